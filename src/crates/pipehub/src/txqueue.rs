//! Durable transaction queue
//!
//! A FIFO of `(method, payload)` mutation items living outside process
//! memory: one file per item in a spool directory, named by a zero-padded
//! sequence number. The dispatcher pushes, the single executor pops,
//! applies, then acks. Files are only removed on ack, so a crash between
//! pop and ack replays the item; the mutations are idempotent, so replay
//! is harmless.

use crate::error::{HubError, Result};
use crate::protocol::Method;
use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

const ITEM_EXTENSION: &str = "txn";

/// One queued mutation.
#[derive(Debug, Clone)]
pub struct QueueItem {
    /// Position in the queue; pass back to [`TransactionQueue::ack`].
    pub seq: u64,
    pub method: Method,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct QueueState {
    pending: VecDeque<u64>,
    next_seq: u64,
}

/// Durable FIFO of mutation requests.
#[derive(Debug)]
pub struct TransactionQueue {
    dir: PathBuf,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl TransactionQueue {
    /// Open the queue at `dir`, creating it if needed and rescanning any
    /// items left behind by a previous process.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| HubError::Queue(format!("failed to create queue directory: {}", e)))?;

        let mut seqs: Vec<u64> = Vec::new();
        for entry in std::fs::read_dir(&dir)
            .map_err(|e| HubError::Queue(format!("failed to scan queue directory: {}", e)))?
        {
            let entry = entry.map_err(|e| HubError::Queue(e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ITEM_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                match stem.parse::<u64>() {
                    Ok(seq) => seqs.push(seq),
                    Err(_) => warn!(file = %path.display(), "ignoring unparseable queue file"),
                }
            }
        }
        seqs.sort_unstable();
        let next_seq = seqs.last().map(|s| s + 1).unwrap_or(0);
        if !seqs.is_empty() {
            debug!(count = seqs.len(), "recovered queued mutations from disk");
        }

        Ok(Self {
            dir,
            state: Mutex::new(QueueState {
                pending: seqs.into(),
                next_seq,
            }),
            notify: Notify::new(),
        })
    }

    fn item_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{:020}.{}", seq, ITEM_EXTENSION))
    }

    /// Append a mutation. The item is synced to disk before this returns,
    /// so an `ok` acknowledgement sent afterwards survives a crash.
    pub async fn push(&self, method: Method, payload: &[u8]) -> Result<u64> {
        let mut state = self.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;

        let tmp = self.dir.join(format!("{:020}.tmp", seq));
        let path = self.item_path(seq);
        {
            let mut file = std::fs::File::create(&tmp)
                .map_err(|e| HubError::Queue(format!("failed to create queue item: {}", e)))?;
            file.write_all(method.as_str().as_bytes())
                .and_then(|_| file.write_all(b"\n"))
                .and_then(|_| file.write_all(payload))
                .and_then(|_| file.sync_all())
                .map_err(|e| HubError::Queue(format!("failed to write queue item: {}", e)))?;
        }
        std::fs::rename(&tmp, &path)
            .map_err(|e| HubError::Queue(format!("failed to commit queue item: {}", e)))?;

        state.pending.push_back(seq);
        drop(state);
        self.notify.notify_one();
        Ok(seq)
    }

    /// Read the item at the head of the queue without removing it.
    ///
    /// The caller applies the mutation and then calls [`ack`](Self::ack).
    pub async fn pop(&self) -> Result<Option<QueueItem>> {
        let state = self.state.lock().await;
        let seq = match state.pending.front() {
            Some(seq) => *seq,
            None => return Ok(None),
        };
        drop(state);

        let bytes = std::fs::read(self.item_path(seq))
            .map_err(|e| HubError::Queue(format!("failed to read queue item {}: {}", seq, e)))?;
        let split = bytes
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| HubError::Queue(format!("queue item {} has no method line", seq)))?;
        let method_str = std::str::from_utf8(&bytes[..split])
            .map_err(|_| HubError::Queue(format!("queue item {} method is not UTF-8", seq)))?;
        let method = Method::parse(method_str)
            .ok_or_else(|| HubError::Queue(format!("queue item {} has unknown method", seq)))?;

        Ok(Some(QueueItem {
            seq,
            method,
            payload: bytes[split + 1..].to_vec(),
        }))
    }

    /// Remove an applied item from the queue and from disk.
    pub async fn ack(&self, seq: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.pending.front() == Some(&seq) {
            state.pending.pop_front();
        } else {
            state.pending.retain(|s| *s != seq);
        }
        drop(state);

        match std::fs::remove_file(self.item_path(seq)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HubError::Queue(format!(
                "failed to remove queue item {}: {}",
                seq, e
            ))),
        }
    }

    /// Number of items currently enqueued (including an unacked head).
    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.pending.is_empty()
    }

    /// Wait until at least one item is enqueued.
    pub async fn wait_nonempty(&self) {
        loop {
            let notified = self.notify.notified();
            if !self.is_empty().await {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_push_pop_ack_fifo() {
        let dir = TempDir::new().unwrap();
        let queue = TransactionQueue::open(dir.path()).unwrap();

        queue.push(Method::Done, b"step-a").await.unwrap();
        queue.push(Method::Cancel, b"step-b").await.unwrap();
        assert_eq!(queue.len().await, 2);

        let first = queue.pop().await.unwrap().unwrap();
        assert_eq!(first.method, Method::Done);
        assert_eq!(first.payload, b"step-a");

        // Pop is a peek: the head stays until acked.
        let again = queue.pop().await.unwrap().unwrap();
        assert_eq!(again.seq, first.seq);

        queue.ack(first.seq).await.unwrap();
        let second = queue.pop().await.unwrap().unwrap();
        assert_eq!(second.method, Method::Cancel);
        assert_eq!(second.payload, b"step-b");
        queue.ack(second.seq).await.unwrap();

        assert!(queue.pop().await.unwrap().is_none());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_reopen_recovers_unacked_items() {
        let dir = TempDir::new().unwrap();

        {
            let queue = TransactionQueue::open(dir.path()).unwrap();
            queue.push(Method::Pending, b"one").await.unwrap();
            queue.push(Method::Pending, b"two").await.unwrap();
            let head = queue.pop().await.unwrap().unwrap();
            queue.ack(head.seq).await.unwrap();
            // "two" is still on disk when the process "crashes" here.
        }

        let queue = TransactionQueue::open(dir.path()).unwrap();
        assert_eq!(queue.len().await, 1);
        let item = queue.pop().await.unwrap().unwrap();
        assert_eq!(item.payload, b"two");

        // New pushes continue after the recovered sequence.
        let seq = queue.push(Method::Done, b"three").await.unwrap();
        assert!(seq > item.seq);
    }

    #[tokio::test]
    async fn test_payload_bytes_survive_verbatim() {
        let dir = TempDir::new().unwrap();
        let queue = TransactionQueue::open(dir.path()).unwrap();

        // Payloads may themselves contain newlines; only the first one
        // terminates the method line.
        let payload = b"{\"step_id\": \"x\",\n \"msg\": \"boom\"}".to_vec();
        queue.push(Method::Error, &payload).await.unwrap();

        let item = queue.pop().await.unwrap().unwrap();
        assert_eq!(item.method, Method::Error);
        assert_eq!(item.payload, payload);
    }

    #[tokio::test]
    async fn test_wait_nonempty_wakes_on_push() {
        let dir = TempDir::new().unwrap();
        let queue = std::sync::Arc::new(TransactionQueue::open(dir.path()).unwrap());

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.wait_nonempty().await;
                queue.pop().await.unwrap().unwrap()
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.push(Method::Reset, b"id").await.unwrap();

        let item = waiter.await.unwrap();
        assert_eq!(item.method, Method::Reset);
    }
}
