//! Everything between the tracer's TCP socket and the log: framing, validation and the
//! per-connection supervisor.

mod frame;
mod server;
mod validate;

pub use frame::{FrameDecoder, Frames, FramingError};
pub use server::{
    ConnectionError, ConnectionState, DEFAULT_MAX_FRAME_LEN, IngestConfig, IngestError,
    IngestMetrics, IngestMetricsSnapshot, IngestServer,
};
pub use validate::{ValidationError, normalize};
