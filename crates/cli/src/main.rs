use std::sync::Arc;

use chorus_core::channel::MemoryChannel;
use chorus_core::config::parse_flag;
use chorus_core::types::{AgentId, ChannelId, ChannelMessage};
use chorus_core::{ChorusCfg, Coordinator, RoleRegistry};
use chorus_llm::LlmProvider;
use rustyline::error::ReadlineError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_AGENTS: &str = "expert,critic,summarizer";
const CHANNEL: &str = "general";
const USER: &str = "user";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cfg = Arc::new(ChorusCfg::from_env());
    let agents = parse_agent_list(&std::env::var("CHORUS_AGENTS").unwrap_or_else(|_| DEFAULT_AGENTS.to_owned()));
    if agents.is_empty() {
        anyhow::bail!("CHORUS_AGENTS names no agents");
    }
    let roles = RoleRegistry::from_env(&cfg).resolve_all(&agents);

    let Some(llm) = chorus_llm::http::from_env() else {
        anyhow::bail!("CHORUS_LLM_MODEL and CHORUS_LLM_API_KEY must be set");
    };
    tracing::info!(provider = llm.name(), model = llm.model(), "llm provider ready");

    let channel = Arc::new(MemoryChannel::new());
    let coordinator = Arc::new(Coordinator::new(cfg, roles, channel.clone(), Arc::new(llm)));
    coordinator.shutdown().spawn_signal_listener();
    let token = coordinator.token();

    let runner = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        let feed = channel.subscribe();
        async move { coordinator.run(feed).await }
    });
    spawn_printer(channel.subscribe(), token.clone());

    print_agents(&coordinator);
    println!("Type a message to the channel. /agents, /status, /quit.");

    let (line_tx, mut line_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    spawn_input_thread(line_tx, ready_rx);
    request_next_prompt(&ready_tx);

    let channel_id = ChannelId::new(CHANNEL);
    let user = AgentId::new(USER);
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = line_rx.recv() => event,
        };
        match event {
            Some(InputEvent::Line(line)) => {
                let line = line.trim();
                match line {
                    "" => {}
                    "/quit" | "/exit" => break,
                    "/agents" => print_agents(&coordinator),
                    "/status" => {
                        let scheduler = coordinator.scheduler();
                        println!(
                            "live observations: {}, cooling down: {}, cached topics: {}",
                            scheduler.tasks().len(),
                            scheduler.dedup().len(),
                            scheduler.oracle().topic_cache().len(),
                        );
                    }
                    _ => {
                        channel.post(&channel_id, &user, line);
                    }
                }
                request_next_prompt(&ready_tx);
            }
            Some(InputEvent::Interrupted) | Some(InputEvent::Eof) | None => break,
            Some(InputEvent::Error(e)) => {
                eprintln!("input error: {e}");
                break;
            }
        }
    }

    coordinator.shutdown().trigger();
    runner.await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("CHORUS_LOG_JSON")
        .ok()
        .and_then(|v| parse_flag(&v))
        .unwrap_or(false);
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

/// Comma-separated agent ids, blanks dropped.
fn parse_agent_list(raw: &str) -> Vec<AgentId> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(AgentId::new)
        .collect()
}

fn print_agents(coordinator: &Coordinator) {
    for agent in coordinator.scheduler().agents() {
        let role = &agent.role;
        println!(
            "  {:<12} {:<22} delay={}ms window={}",
            agent.id.as_str(),
            role.participation_strategy.as_str(),
            role.observation_delay_ms,
            role.max_observation_messages,
        );
    }
}

/// Echo agent replies as they land in the channel.
fn spawn_printer(mut feed: broadcast::Receiver<ChannelMessage>, token: CancellationToken) {
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = token.cancelled() => return,
                received = feed.recv() => received,
            };
            match received {
                Ok(msg) if msg.author_id.as_str() != USER => {
                    println!("\n{}> {}\n", msg.author_id, msg.content);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "printer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

fn request_next_prompt(ready_tx: &std::sync::mpsc::Sender<()>) {
    let _ = ready_tx.send(());
}

fn spawn_input_thread(line_tx: mpsc::UnboundedSender<InputEvent>, ready_rx: std::sync::mpsc::Receiver<()>) {
    std::thread::spawn(move || {
        let mut editor = match rustyline::DefaultEditor::new() {
            Ok(editor) => editor,
            Err(e) => {
                let _ = line_tx.send(InputEvent::Error(e.to_string()));
                return;
            }
        };

        while ready_rx.recv().is_ok() {
            match editor.readline("you> ") {
                Ok(line) => {
                    let _ = editor.add_history_entry(line.as_str());
                    if line_tx.send(InputEvent::Line(line)).is_err() {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    let _ = line_tx.send(InputEvent::Interrupted);
                    break;
                }
                Err(ReadlineError::Eof) => {
                    let _ = line_tx.send(InputEvent::Eof);
                    break;
                }
                Err(e) => {
                    let _ = line_tx.send(InputEvent::Error(e.to_string()));
                    break;
                }
            }
        }
    });
}

enum InputEvent {
    Line(String),
    Interrupted,
    Eof,
    Error(String),
}
