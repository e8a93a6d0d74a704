mod coordinator;
mod janitor;
mod shutdown;

pub use coordinator::Coordinator;
pub use janitor::{Janitor, SweepReport};
pub use shutdown::ShutdownGuard;
