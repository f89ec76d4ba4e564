use super::frame::{FrameDecoder, FramingError};
use super::validate::normalize;
use crate::store::{LogHandle, ServiceError};
use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// 16 MiB: far above any real snapshot, low enough to stop a runaway producer.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Largest frame accepted, delimiter excluded.
    pub max_frame_len: usize,
    /// Bytes requested from the socket per read.
    pub read_buffer_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("failed to bind ingest listener to {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Reasons a connection ends in [`ConnectionState::Errored`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("log service stopped")]
    LogClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Streaming,
    Disconnected,
    Errored,
}

#[derive(Debug, Default)]
pub struct IngestMetrics {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_errored: AtomicU64,
    pub bytes_received: AtomicU64,
    pub frames_accepted: AtomicU64,
    pub frames_rejected: AtomicU64,
    pub persist_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestMetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_errored: u64,
    pub bytes_received: u64,
    pub frames_accepted: u64,
    pub frames_rejected: u64,
    pub persist_failures: u64,
}

impl IngestMetrics {
    pub fn snapshot(&self) -> IngestMetricsSnapshot {
        IngestMetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_errored: self.connections_errored.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_accepted: self.frames_accepted.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
        }
    }
}

/// Accepts tracing agent connections and feeds their frames into the log.
pub struct IngestServer {
    listener: TcpListener,
    config: IngestConfig,
    log: LogHandle,
    metrics: Arc<IngestMetrics>,
}

impl IngestServer {
    /// Bind the ingest listener. Failing to bind is fatal for the caller.
    pub async fn bind(
        address: SocketAddr,
        config: IngestConfig,
        log: LogHandle,
    ) -> Result<Self, IngestError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| IngestError::Bind { address, source })?;

        Ok(Self {
            listener,
            config,
            log,
            metrics: Arc::new(IngestMetrics::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn metrics(&self) -> Arc<IngestMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Accept connections until `cancel` fires, then wait for open connections to wind down.
    pub async fn run(self, cancel: CancellationToken) {
        match self.local_addr() {
            Ok(address) => info!("TCP server for tracer listening on {address}"),
            Err(e) => warn!("TCP server for tracer listening on an unknown address: {e}"),
        }

        let connections = TaskTracker::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let connection = Connection {
                            peer,
                            state: ConnectionState::Connected,
                            decoder: FrameDecoder::new(self.config.max_frame_len),
                            read_buffer_size: self.config.read_buffer_size,
                            log: self.log.clone(),
                            metrics: Arc::clone(&self.metrics),
                        };
                        connections.spawn(connection.run(stream, cancel.child_token()));
                    }
                    Err(e) => warn!("Failed to accept tracer connection: {e}"),
                },
            }
        }

        connections.close();
        connections.wait().await;
        info!("TCP server for tracer stopped ({:?})", self.metrics.snapshot());
    }
}

struct Connection {
    peer: SocketAddr,
    state: ConnectionState,
    decoder: FrameDecoder,
    read_buffer_size: usize,
    log: LogHandle,
    metrics: Arc<IngestMetrics>,
}

impl Connection {
    async fn run(mut self, mut stream: TcpStream, cancel: CancellationToken) {
        info!("Tracer connected from {}", self.peer);
        self.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
        self.metrics.connections_active.fetch_add(1, Ordering::Relaxed);

        let outcome = self.stream_frames(&mut stream, &cancel).await;
        match outcome {
            Ok(()) => {
                self.transition(ConnectionState::Disconnected);
                info!("Tracer {} disconnected", self.peer);
            }
            Err(e) => {
                self.transition(ConnectionState::Errored);
                warn!("Tracer connection {} closed: {e}", self.peer);
            }
        }

        if let Some(rest) = self.decoder.finish() {
            warn!("Discarding {} unterminated bytes from {}", rest.len(), self.peer);
        }
        self.metrics.connections_active.fetch_sub(1, Ordering::Relaxed);
        debug!("Ingest counters: {:?}", self.metrics.snapshot());
    }

    async fn stream_frames(
        &mut self,
        stream: &mut TcpStream,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        let mut buffer = vec![0u8; self.read_buffer_size];
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                read = stream.read(&mut buffer) => read?,
            };
            if read == 0 {
                return Ok(());
            }

            if self.state == ConnectionState::Connected {
                self.transition(ConnectionState::Streaming);
            }
            self.metrics
                .bytes_received
                .fetch_add(read as u64, Ordering::Relaxed);

            for frame in self.decoder.feed(&buffer[..read]) {
                accept_frame(&frame?, self.peer, &self.log, &self.metrics).await?;
            }
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!("Connection {}: {:?} -> {next:?}", self.peer, self.state);
        if next == ConnectionState::Errored {
            self.metrics.connections_errored.fetch_add(1, Ordering::Relaxed);
        }
        self.state = next;
    }
}

/// Validate and persist one frame. Only a stopped log service ends the connection; a bad
/// frame or a failed write drops that frame alone.
async fn accept_frame(
    frame: &[u8],
    peer: SocketAddr,
    log: &LogHandle,
    metrics: &IngestMetrics,
) -> Result<(), ConnectionError> {
    let record = match normalize(frame) {
        Ok(record) => record,
        Err(e) => {
            metrics.frames_rejected.fetch_add(1, Ordering::Relaxed);
            warn!("Error parsing data from tracer {peer}: {e}");
            return Ok(());
        }
    };

    match log.append(record).await {
        Ok(_) => {
            metrics.frames_accepted.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        Err(ServiceError::Closed) => Err(ConnectionError::LogClosed),
        Err(e) => {
            metrics.persist_failures.fetch_add(1, Ordering::Relaxed);
            error!("Error saving data from tracer {peer}: {e}");
            Ok(())
        }
    }
}
