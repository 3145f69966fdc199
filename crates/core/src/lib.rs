pub mod config;
pub mod encoding;
pub mod error;
pub mod history;
pub mod message;
pub mod model;
pub mod observability;
pub mod orchestrator;
pub mod prefill;
pub mod session;
pub mod title;

#[cfg(test)]
mod testing;

pub use config::{Config, ConfigOverrides};
pub use error::{CompletionError, HistoryError};
pub use history::{HistoryStore, LoadOutcome};
pub use message::{ContentPart, Message, MessageLog, Role};
pub use orchestrator::Orchestrator;
pub use session::{InputSpec, Interrupts, Session, StdinLines};
