//! Types shared between the proctree server and the tracing agents that feed it.

pub mod artifacts;
pub mod protocol;
