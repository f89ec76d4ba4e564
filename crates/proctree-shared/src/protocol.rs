//! WARNING: Has to be in sync with the tracing agent's TCP client.

use serde::{Deserialize, Serialize};

pub const DEFAULT_INGEST_PORT: u16 = 9090;
pub const DEFAULT_WEB_PORT: u16 = 3000;

/// Every ingest frame is a single JSON document terminated by this byte.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Name of the event pushed to observers after every persisted record.
pub const UPDATE_COUNT_EVENT: &str = "update_count";

/// Payload pushed to observers: the number of records persisted so far.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountUpdate {
    pub total: usize,
}

impl CountUpdate {
    pub fn new(total: usize) -> Self {
        Self { total }
    }
}
