//! Observation & participation coordination for multiple personas sharing
//! one append-only message channel.
//!
//! Agents never talk to each other directly. Each one watches the channel,
//! waits, re-reads the history right before every irreversible decision and
//! decides on its own whether to speak. Process-local caches and registries
//! only save cost; the channel itself is the source of truth.

pub mod channel;
pub mod config;
pub mod observation;
pub mod oracle;
pub mod role;
pub mod runtime;
pub mod types;

pub use config::ChorusCfg;
pub use observation::{Agent, ObservationScheduler, TaskOutcome};
pub use role::{ParticipationStrategy, RoleConfig, RoleRegistry};
pub use runtime::Coordinator;
