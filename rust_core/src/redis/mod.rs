pub mod bus;
pub mod pubsub_reconnect;
pub mod store;

pub use bus::RedisBus;
pub use pubsub_reconnect::{ReconnectConfig, ReconnectStats, ReconnectingMessageStream, ReconnectingPubSub};
pub use store::{HashOp, HashStore, MemoryHashStore, RedisHashStore, StoreError, StoreResult};
