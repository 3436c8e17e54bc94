pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{HarvestError, PhaseError, Result};
pub use event::{EventBus, WorkflowEvent};
pub use message::{Message, MessageType};
pub use types::*;
