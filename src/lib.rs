pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod media;
pub mod protocol;
pub mod scanner;
pub mod store;
pub mod worker;

pub use config::{ClusterConfig, Config, WorkerConfig};
pub use coordinator::Coordinator;
pub use error::{CrucibleError, Result};
pub use events::{Event, EventBus};
pub use store::{FileRecord, FileStatus, Store};
pub use worker::WorkerAgent;
