//! End-to-end tests of the observation protocol over the in-memory channel.
//!
//! Time is paused, so delays and cooldowns are exercised deterministically.

use std::sync::Arc;
use std::time::Duration;

use chorus_core::channel::{MemoryChannel, ReplyDispatcher, SnapshotFetcher};
use chorus_core::config::ChorusCfg;
use chorus_core::observation::{
    Agent, ObservationScheduler, ParticipationDeduplicator, SchedulerParts, TaskKey, TaskOutcome, TaskRegistry,
};
use chorus_core::oracle::{DecisionOracle, TopicCache};
use chorus_core::role::{ParticipationStrategy, RoleConfig, builtin_role};
use chorus_core::runtime::Janitor;
use chorus_core::types::{ChannelId, ChannelMessage, SkipReason};
use chorus_llm::{CompletionRequest, LlmError, LlmProvider, MockProvider};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const DELAY_Q: &str = "How many seconds";
const TOPIC_Q: &str = "Has the conversation moved";
const PARTICIPATE_Q: &str = "Would a message from you add";
const COMPOSE_Q: &str = "Write your next message";

struct Harness {
    ch: Arc<MemoryChannel>,
    scheduler: ObservationScheduler,
    mock: MockProvider,
    shutdown: CancellationToken,
}

impl Harness {
    fn new(cfg: ChorusCfg, agents: Vec<Agent>, mock: MockProvider, ch: Arc<MemoryChannel>) -> Self {
        let cfg = Arc::new(cfg);
        let llm: Arc<dyn LlmProvider> = Arc::new(mock.clone());
        let topics = Arc::new(TopicCache::new(cfg.topic_cache_max, cfg.topic_cache_ttl()));
        let oracle = DecisionOracle::new(llm, topics, &cfg);
        let parts = SchedulerParts {
            fetcher: SnapshotFetcher::new(ch.clone()),
            dispatcher: ReplyDispatcher::new(ch.clone(), oracle.clone()),
            oracle,
            dedup: Arc::new(ParticipationDeduplicator::new(cfg.cooldown())),
            tasks: Arc::new(TaskRegistry::new()),
        };
        let shutdown = CancellationToken::new();
        let scheduler = ObservationScheduler::new(cfg, agents, parts, shutdown.clone());
        Self { ch, scheduler, mock, shutdown }
    }

    fn general() -> ChannelId {
        "general".into()
    }

    fn user_says(&self, text: &str) -> ChannelMessage {
        self.ch.post(&Self::general(), &"user".into(), text)
    }

    fn prompts_containing(&self, needle: &str) -> Vec<String> {
        self.mock
            .requests()
            .iter()
            .filter_map(|r| r.last_user_content().map(str::to_owned))
            .filter(|p| p.contains(needle))
            .collect()
    }

    fn posts_by(&self, agent: &str) -> Vec<String> {
        self.ch
            .messages(&Self::general())
            .into_iter()
            .filter(|m| m.author_id.as_str() == agent)
            .map(|m| m.content)
            .collect()
    }
}

/// Answer each question kind with a fixed string.
fn script(delay: &'static str, topic: &'static str, participate: &'static str) -> MockProvider {
    MockProvider::scripted(move |req: &CompletionRequest| {
        let prompt = req.last_user_content().unwrap_or_default();
        Ok(if prompt.contains(DELAY_Q) {
            delay.to_owned()
        } else if prompt.contains(TOPIC_Q) {
            topic.to_owned()
        } else if prompt.contains(PARTICIPATE_Q) {
            participate.to_owned()
        } else {
            "a reply".to_owned()
        })
    })
}

fn role(name: &str) -> RoleConfig {
    builtin_role(name).unwrap()
}

#[tokio::test(start_paused = true)]
async fn always_on_trigger_replies_immediately_without_decisions() {
    let h = Harness::new(
        ChorusCfg::default(),
        vec![Agent::new("expert", role("expert"))],
        script("6", "NO", "NO"),
        Arc::new(MemoryChannel::new()),
    );
    let start = Instant::now();
    let trigger = h.user_says("what is borrowck?");
    let mut tasks = h.scheduler.on_message(&trigger);
    assert_eq!(tasks.len(), 1);

    let outcome = tasks.remove(0).handle.await.unwrap();
    assert!(outcome.participated());
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(h.mock.calls(), 1, "only the reply is composed");
    assert!(h.prompts_containing(COMPOSE_Q)[0].contains("user: what is borrowck?"));
    assert_eq!(h.posts_by("expert"), ["a reply"]);
}

#[tokio::test(start_paused = true)]
async fn oracle_delay_then_refresh_sees_earlier_reply() {
    let h = Harness::new(
        ChorusCfg::default(),
        vec![Agent::new("expert", role("expert")), Agent::new("critic", role("critic"))],
        script("6", "YES", "YES, one caveat"),
        Arc::new(MemoryChannel::new()),
    );
    let start = Instant::now();
    let trigger = h.user_says("should we use unsafe here?");
    let tasks = h.scheduler.on_message(&trigger);
    assert_eq!(tasks.len(), 2);

    let mut critic_outcome = None;
    for t in tasks {
        let agent = t.agent.clone();
        let outcome = t.handle.await.unwrap();
        if agent.as_str() == "critic" {
            assert!(start.elapsed() >= Duration::from_millis(6000));
            critic_outcome = Some(outcome);
        }
    }
    assert!(critic_outcome.unwrap().participated());

    let decision_prompt = &h.prompts_containing(PARTICIPATE_Q)[0];
    assert!(decision_prompt.contains("expert: a reply"), "refreshed snapshot must include the expert's reply");
    assert_eq!(h.posts_by("critic").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn non_integer_delay_falls_back_to_default() {
    let h = Harness::new(
        ChorusCfg::default(),
        vec![Agent::new("critic", role("critic"))],
        script("7.5", "YES", "NO"),
        Arc::new(MemoryChannel::new()),
    );
    let start = Instant::now();
    let trigger = h.user_says("thoughts?");
    let mut tasks = h.scheduler.on_message(&trigger);
    let outcome = tasks.remove(0).handle.await.unwrap();

    assert_eq!(outcome.skip_reason(), Some(SkipReason::Declined));
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(5000) && waited < Duration::from_millis(5100), "{waited:?}");
}

#[tokio::test(start_paused = true)]
async fn topic_answers_are_cached_per_trigger_text() {
    let mock = MockProvider::scripted(|req: &CompletionRequest| {
        let prompt = req.last_user_content().unwrap_or_default();
        Ok(if prompt.contains(DELAY_Q) {
            "3"
        } else if prompt.contains(TOPIC_Q) {
            if prompt.contains("databases") { "YES" } else { "NO" }
        } else if prompt.contains(PARTICIPATE_Q) {
            "YES"
        } else {
            "a reply"
        }
        .to_owned())
    });
    let h = Harness::new(
        ChorusCfg::default(),
        vec![Agent::new("critic", role("critic"))],
        mock,
        Arc::new(MemoryChannel::new()),
    );
    h.user_says("is Arc needed?");
    h.ch.post(&Harness::general(), &"critic".into(), "Only if shared across threads.");

    for text in ["ok thanks", "  Ok   thanks "] {
        let trigger = h.user_says(text);
        let mut tasks = h.scheduler.on_message(&trigger);
        let outcome = tasks.remove(0).handle.await.unwrap();
        assert_eq!(outcome.skip_reason(), Some(SkipReason::TopicUnchanged));
    }
    assert_eq!(h.prompts_containing(TOPIC_Q).len(), 1, "repeated text must hit the cache");

    let trigger = h.user_says("New subject entirely: how do databases do MVCC?");
    let mut tasks = h.scheduler.on_message(&trigger);
    let outcome = tasks.remove(0).handle.await.unwrap();
    assert!(outcome.participated());

    assert_eq!(h.prompts_containing(TOPIC_Q).len(), 2, "new text must be asked again");
    assert_eq!(h.prompts_containing(PARTICIPATE_Q).len(), 1);
    assert_eq!(h.scheduler.oracle().topic_cache().len(), 2);
    assert_eq!(h.posts_by("critic").last().map(String::as_str), Some("a reply"));
}

#[tokio::test(start_paused = true)]
async fn unclear_participation_answer_stays_silent() {
    let h = Harness::new(
        ChorusCfg::default(),
        vec![Agent::new("critic", role("critic"))],
        script("3", "YES", "maybe later"),
        Arc::new(MemoryChannel::new()),
    );
    let trigger = h.user_says("anyone?");
    let mut tasks = h.scheduler.on_message(&trigger);
    let outcome = tasks.remove(0).handle.await.unwrap();
    assert_eq!(outcome.skip_reason(), Some(SkipReason::UnclearDecision));
    assert!(h.posts_by("critic").is_empty());
    assert!(!h.scheduler.dedup().should_skip(&Harness::general(), &"critic".into()));
}

#[tokio::test(start_paused = true)]
async fn refresh_before_reply_sees_messages_after_decision() {
    let ch = Arc::new(MemoryChannel::new());
    let side = ch.clone();
    let mock = MockProvider::scripted(move |req: &CompletionRequest| {
        let prompt = req.last_user_content().unwrap_or_default();
        if prompt.contains(PARTICIPATE_Q) {
            // Lands after the decision refresh, before the pre-dispatch one.
            side.post(&"general".into(), &"expert".into(), "late breaking detail");
            Ok("YES".into())
        } else {
            Ok("summary".into())
        }
    });
    let h = Harness::new(ChorusCfg::default(), vec![Agent::new("summarizer", role("summarizer"))], mock, ch);

    let trigger = h.user_says("can someone sum up?");
    let mut tasks = h.scheduler.on_message(&trigger);
    assert!(tasks.remove(0).handle.await.unwrap().participated());

    assert!(!h.prompts_containing(PARTICIPATE_Q)[0].contains("late breaking detail"));
    assert!(h.prompts_containing(COMPOSE_Q)[0].contains("expert: late breaking detail"));
}

#[tokio::test(start_paused = true)]
async fn without_refresh_before_reply_compose_uses_decision_snapshot() {
    let ch = Arc::new(MemoryChannel::new());
    let side = ch.clone();
    let mock = MockProvider::scripted(move |req: &CompletionRequest| {
        let prompt = req.last_user_content().unwrap_or_default();
        if prompt.contains(PARTICIPATE_Q) {
            side.post(&"general".into(), &"expert".into(), "late breaking detail");
            Ok("YES".into())
        } else if prompt.contains(DELAY_Q) {
            Ok("2".into())
        } else {
            Ok("critique".into())
        }
    });
    let h = Harness::new(ChorusCfg::default(), vec![Agent::new("critic", role("critic"))], mock, ch);

    let trigger = h.user_says("review this");
    let mut tasks = h.scheduler.on_message(&trigger);
    assert!(tasks.remove(0).handle.await.unwrap().participated());
    assert!(!h.prompts_containing(COMPOSE_Q)[0].contains("late breaking detail"));
}

#[tokio::test(start_paused = true)]
async fn second_trigger_within_cooldown_gets_no_reply() {
    let h = Harness::new(
        ChorusCfg::default(),
        vec![Agent::new("expert", role("expert"))],
        script("3", "YES", "YES"),
        Arc::new(MemoryChannel::new()),
    );
    let first = h.user_says("q1");
    for t in h.scheduler.on_message(&first) {
        t.handle.await.unwrap();
    }
    tokio::time::advance(Duration::from_secs(60)).await;
    let second = h.user_says("q2");
    assert!(h.scheduler.on_message(&second).is_empty());
    assert_eq!(h.posts_by("expert").len(), 1);

    tokio::time::advance(Duration::from_secs(241)).await;
    let third = h.user_says("q3");
    for t in h.scheduler.on_message(&third) {
        t.handle.await.unwrap();
    }
    assert_eq!(h.posts_by("expert").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn trigger_during_flight_is_ignored() {
    let mut summarizer = role("summarizer");
    summarizer.observation_delay_ms = 4000;
    let h = Harness::new(
        ChorusCfg::default(),
        vec![Agent::new("summarizer", summarizer)],
        script("3", "YES", "YES"),
        Arc::new(MemoryChannel::new()),
    );
    let first = h.scheduler.on_message(&h.user_says("first"));
    let second = h.scheduler.on_message(&h.user_says("second"));
    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
    assert_eq!(
        h.scheduler
            .tasks()
            .trigger_of(&TaskKey::new(Harness::general(), "summarizer".into())),
        Some(h.ch.messages(&Harness::general())[0].message_id.clone())
    );
    for t in first {
        t.handle.await.unwrap();
    }
    assert!(h.scheduler.tasks().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_triggers_start_one_task_per_agent() {
    let mut slow = RoleConfig::generic(&"scout".into());
    slow.participation_strategy = ParticipationStrategy::AlwaysOnTrigger;
    slow.observation_delay_ms = 15_000;
    let h = Arc::new(Harness::new(
        ChorusCfg::default(),
        vec![Agent::new("scout", slow)],
        script("3", "YES", "YES"),
        Arc::new(MemoryChannel::new()),
    ));
    let triggers: Vec<_> = (0..32).map(|i| h.user_says(&format!("msg {i}"))).collect();

    let barrier = Arc::new(tokio::sync::Barrier::new(triggers.len()));
    let mut joins = Vec::new();
    for trigger in triggers {
        let h = h.clone();
        let barrier = barrier.clone();
        joins.push(tokio::spawn(async move {
            barrier.wait().await;
            h.scheduler.on_message(&trigger)
        }));
    }
    let mut started = Vec::new();
    for j in joins {
        started.extend(j.await.unwrap());
    }
    assert_eq!(started.len(), 1);
    assert_eq!(h.scheduler.tasks().len(), 1);

    h.shutdown.cancel();
    let outcome = started.remove(0).handle.await.unwrap();
    assert_eq!(outcome.skip_reason(), Some(SkipReason::Cancelled));
    assert!(h.scheduler.tasks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn deleted_anchor_does_not_abort() {
    let mut critic = role("critic");
    critic.observation_delay_ms = 3000;
    let h = Harness::new(
        ChorusCfg::default(),
        vec![Agent::new("critic", critic)],
        script("3", "YES", "YES"),
        Arc::new(MemoryChannel::new()),
    );
    h.user_says("context");
    let trigger = h.user_says("to be deleted");
    let mut tasks = h.scheduler.on_message(&trigger);
    assert!(h.ch.delete_message(&Harness::general(), &trigger.message_id));

    let outcome = tasks.remove(0).handle.await.unwrap();
    assert!(outcome.participated(), "{outcome:?}");
}

#[tokio::test(start_paused = true)]
async fn failures_stay_isolated_per_agent() {
    let mock = MockProvider::scripted(|req: &CompletionRequest| {
        let system = &req.messages[0].content;
        if system.contains("critic") {
            Err(LlmError::Unavailable("critic backend down".into()))
        } else {
            Ok("fine answer".into())
        }
    });
    let h = Harness::new(
        ChorusCfg::default(),
        vec![Agent::new("expert", role("expert")), Agent::new("critic", role("critic"))],
        mock,
        Arc::new(MemoryChannel::new()),
    );
    let trigger = h.user_says("help");
    let mut outcomes = Vec::new();
    for t in h.scheduler.on_message(&trigger) {
        outcomes.push((t.agent.clone(), t.handle.await.unwrap()));
    }
    for (agent, outcome) in &outcomes {
        match agent.as_str() {
            "expert" => assert!(outcome.participated()),
            _ => assert!(matches!(outcome, TaskOutcome::Aborted(_))),
        }
    }
    assert!(h.scheduler.tasks().is_empty());
    assert_eq!(h.posts_by("expert"), ["fine answer"]);
}

#[tokio::test(start_paused = true)]
async fn settle_delay_precedes_decision_refresh() {
    let cfg = ChorusCfg {
        settle_delay_ms: 1500,
        ..ChorusCfg::default()
    };
    let mut critic = role("critic");
    critic.observation_delay_ms = 2000;
    let h = Harness::new(cfg, vec![Agent::new("critic", critic)], script("3", "YES", "NO"), Arc::new(MemoryChannel::new()));
    let start = Instant::now();
    let trigger = h.user_says("hm");
    let mut tasks = h.scheduler.on_message(&trigger);
    tasks.remove(0).handle.await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(3500));
}

#[tokio::test(start_paused = true)]
async fn slow_oracle_task_outlives_janitor_sweeps() {
    let cfg = ChorusCfg {
        settle_delay_ms: 10_000,
        ..ChorusCfg::default()
    };
    let h = Harness::new(
        cfg,
        vec![Agent::new("critic", role("critic"))],
        script("15", "YES", "YES").with_latency(Duration::from_secs(29)),
        Arc::new(MemoryChannel::new()),
    );
    let janitor = Janitor::new(
        h.scheduler.oracle().topic_cache().clone(),
        h.scheduler.dedup().clone(),
        h.scheduler.tasks().clone(),
        Duration::from_secs(5),
    );
    let sweeping = janitor.spawn(h.shutdown.clone());

    h.user_says("is Arc needed?");
    h.ch.post(&Harness::general(), &"critic".into(), "Only if shared across threads.");
    let start = Instant::now();
    let trigger = h.user_says("what about Rc in async code?");
    let mut tasks = h.scheduler.on_message(&trigger);
    let outcome = tasks.remove(0).handle.await.unwrap();

    // four oracle calls at 29s each, a 15s delay and a 10s settle
    assert!(start.elapsed() >= Duration::from_secs(141), "{:?}", start.elapsed());
    assert!(outcome.participated(), "{outcome:?}");
    assert_eq!(h.posts_by("critic"), ["Only if shared across threads.", "a reply"]);
    assert!(h.scheduler.dedup().should_skip(&Harness::general(), &"critic".into()));
    assert!(h.scheduler.tasks().is_empty());

    h.shutdown.cancel();
    sweeping.await.unwrap();
}
