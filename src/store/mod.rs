mod notifier;
mod records;
mod service;

pub use notifier::{DEFAULT_MAX_SUBSCRIBERS, Notifier, SubscribeError};
pub use records::{LogEntry, PendingEntry, PersistenceError, RecordStore, StoreMode};
pub use service::{LogHandle, LogService, ServiceError, Subscription};
