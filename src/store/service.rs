//! The task that owns the record store and the notifier.
//!
//! Every mutation of the ordinal index or of the subscriber list happens inside this task,
//! in the order commands arrive on its channel. Connection handlers and HTTP handlers only
//! hold a cloneable [`LogHandle`].

use super::notifier::{Notifier, SubscribeError};
use super::records::{LogEntry, PersistenceError, RecordStore};
use log::{debug, error, info};
use proctree_shared::artifacts::ProcessTree;
use proctree_shared::protocol::CountUpdate;
use std::io;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const COMMAND_QUEUE_SIZE: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("log service is no longer running")]
    Closed,
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Subscribe(#[from] SubscribeError),
    #[error("failed to read entry {ordinal}: {source}")]
    Read {
        ordinal: usize,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove the storage directory: {0}")]
    Teardown(#[source] io::Error),
}

/// A live subscription: the count at the time of subscribing, then one update per append.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub initial: CountUpdate,
    pub updates: mpsc::Receiver<CountUpdate>,
}

enum Command {
    Append {
        record: ProcessTree,
        reply: oneshot::Sender<Result<LogEntry, PersistenceError>>,
    },
    Locate {
        ordinal: usize,
        reply: oneshot::Sender<Option<PathBuf>>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    Subscribe {
        reply: oneshot::Sender<Result<Subscription, SubscribeError>>,
    },
    Shutdown {
        reply: oneshot::Sender<io::Result<()>>,
    },
}

#[derive(Clone, Debug)]
pub struct LogHandle {
    commands: mpsc::Sender<Command>,
}

impl LogHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ServiceError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ServiceError::Closed)?;
        response.await.map_err(|_| ServiceError::Closed)
    }

    /// Persist `record`, assign it the next ordinal and notify subscribers.
    pub async fn append(&self, record: ProcessTree) -> Result<LogEntry, ServiceError> {
        Ok(self
            .request(|reply| Command::Append { record, reply })
            .await??)
    }

    /// Stored payload at `ordinal`. Negative and unassigned ordinals are `None`.
    pub async fn get(&self, ordinal: i64) -> Result<Option<Vec<u8>>, ServiceError> {
        let Ok(ordinal) = usize::try_from(ordinal) else {
            return Ok(None);
        };

        let Some(path) = self
            .request(|reply| Command::Locate { ordinal, reply })
            .await?
        else {
            return Ok(None);
        };

        // Entries are immutable, so the read happens outside the service task.
        tokio::fs::read(&path)
            .await
            .map(Some)
            .map_err(|source| ServiceError::Read { ordinal, source })
    }

    pub async fn count(&self) -> Result<usize, ServiceError> {
        self.request(|reply| Command::Count { reply }).await
    }

    /// Register an observer. The initial count and the registration are taken in the same
    /// step, so the first update received is always for the append after `initial`.
    pub async fn subscribe(&self) -> Result<Subscription, ServiceError> {
        Ok(self.request(|reply| Command::Subscribe { reply }).await??)
    }

    /// Remove the storage directory and stop the service. Every later request fails with
    /// [`ServiceError::Closed`].
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.request(|reply| Command::Shutdown { reply })
            .await?
            .map_err(ServiceError::Teardown)
    }
}

pub struct LogService {
    store: RecordStore,
    notifier: Notifier,
    commands: mpsc::Receiver<Command>,
}

impl LogService {
    /// Start the service task. It runs until [`LogHandle::shutdown`] is called or every
    /// handle has been dropped.
    pub fn spawn(store: RecordStore, notifier: Notifier) -> (LogHandle, JoinHandle<()>) {
        let (sender, commands) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let service = Self {
            store,
            notifier,
            commands,
        };
        let task = tokio::spawn(service.run());
        (LogHandle { commands: sender }, task)
    }

    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Append { record, reply } => {
                    let result = self.append(record).await;
                    let _ = reply.send(result);
                }
                Command::Locate { ordinal, reply } => {
                    let _ = reply.send(self.store.get(ordinal));
                }
                Command::Count { reply } => {
                    let _ = reply.send(self.store.count());
                }
                Command::Subscribe { reply } => {
                    let subscription = self.notifier.subscribe().map(|(id, updates)| Subscription {
                        id,
                        initial: CountUpdate::new(self.store.count()),
                        updates,
                    });
                    let _ = reply.send(subscription);
                }
                Command::Shutdown { reply } => {
                    self.commands.close();
                    let result = tokio::task::spawn_blocking(move || self.store.teardown())
                        .await
                        .unwrap_or_else(|e| Err(io::Error::other(e)));
                    let _ = reply.send(result);
                    return;
                }
            }
        }
        debug!("Every log handle was dropped, stopping the log service");
    }

    async fn append(&mut self, record: ProcessTree) -> Result<LogEntry, PersistenceError> {
        let pending = self.store.prepare(&record)?;

        // The write may block on the disk; keep it off the runtime threads.
        let pending = tokio::task::spawn_blocking(move || pending.write().map(|()| pending))
            .await
            .map_err(|e| PersistenceError::Io {
                path: self.store.dir().to_path_buf(),
                source: io::Error::other(e),
            })?
            .inspect_err(|e| error!("Dropping record for pid {}: {e}", record.pid))?;

        let entry = self.store.commit(pending);
        let total = self.store.count();
        let delivered = self.notifier.notify(total);
        info!(
            "Saved log {} (ordinal {}, root pid {}, {} nodes), notified {delivered} subscribers",
            entry.identity,
            entry.ordinal,
            record.pid,
            record.node_count()
        );

        Ok(entry)
    }
}
