//! Runtime lifecycle: state machine, state cache and the start/stop synchronizer

pub mod cache;
pub mod orchestrator;
pub mod state;
pub mod synchronizer;

pub use cache::{ConfigMapStateStore, InMemoryStateStore, RuntimeStateStore};
pub use orchestrator::RuntimeOrchestrator;
pub use state::{MachineState, MachineStatus, RuntimeState, RuntimeStatus};
pub use synchronizer::{await_deletion, await_readiness, StartGuard, StartSynchronizer};
