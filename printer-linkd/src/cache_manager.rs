use std::thread;
use tokio::sync::{mpsc, oneshot, watch};
use anyhow::Result;
use shared::types::DnsCacheEntry;
use crate::cache::{db::DnsStore, hash};

/// Commands sent to the persistence thread
#[derive(Debug)]
pub enum PersistCommand {
    Persist(Vec<DnsCacheEntry>, Option<oneshot::Sender<Result<bool>>>),
    Shutdown,
}

/// Handle to the thread owning the DNS store.
///
/// Snapshots are written only when their content hash differs from the last
/// one written; the current hash is published on a watch channel.
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::UnboundedSender<PersistCommand>,
}

impl PersistHandle {
    /// Spawn the persistence thread. `hash_tx` must hold the hash of what is
    /// currently stored in `db`.
    pub fn spawn(mut db: DnsStore, hash_tx: watch::Sender<String>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<PersistCommand>();

        thread::spawn(move || {
            let mut last_hash = hash_tx.borrow().clone();

            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    PersistCommand::Persist(snapshot, reply) => {
                        let new_hash = hash::compute_hash(&snapshot);
                        let result = if new_hash == last_hash {
                            tracing::debug!("Skip persisting dns cache, unchanged");
                            Ok(false)
                        } else {
                            tracing::debug!("Persisting {} dns entries", snapshot.len());
                            db.replace_all(&snapshot).map(|_| {
                                last_hash = new_hash.clone();
                                hash_tx.send_replace(new_hash);
                                true
                            })
                        };
                        if let Err(e) = &result {
                            tracing::error!("Failed to persist dns cache: {:#}", e);
                        }
                        if let Some(reply) = reply {
                            let _ = reply.send(result);
                        }
                    }
                    PersistCommand::Shutdown => {
                        tracing::info!("Persistence thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Queue a snapshot for writing without waiting for the result
    pub fn persist(&self, snapshot: Vec<DnsCacheEntry>) {
        if self.tx.send(PersistCommand::Persist(snapshot, None)).is_err() {
            tracing::warn!("Persistence thread is gone, dropping dns snapshot");
        }
    }

    /// Write a snapshot. Returns true if the store was rewritten.
    pub async fn persist_and_wait(&self, snapshot: Vec<DnsCacheEntry>) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(PersistCommand::Persist(snapshot, Some(reply)))?;
        rx.await?
    }

    pub fn shutdown(&self) -> Result<()> {
        self.tx.send(PersistCommand::Shutdown)?;
        Ok(())
    }
}
