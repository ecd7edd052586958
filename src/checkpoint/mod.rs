pub mod history;
pub mod store;

pub use history::{HistoryEvent, HistoryLog};
pub use store::{Checkpoint, CheckpointStore};
