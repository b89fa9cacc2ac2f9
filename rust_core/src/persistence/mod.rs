pub mod backoff;
pub mod queue;

pub use backoff::Backoff;
pub use queue::{FlushOutcome, GameWriter, PendingWrite, WriteQueue, WriteQueueConfig, WriteReport};
