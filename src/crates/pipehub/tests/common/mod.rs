//! Common test utilities and setup

use pipehub::{
    Bucket, Database, Hub, HubClient, MemoryBucket, RetryPolicy, StepRepository, StepStatus,
    TransactionQueue,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// A hub served on an ephemeral port, plus handles into its internals for
/// fixtures and assertions.
pub struct TestHub {
    pub hub: Arc<Hub>,
    pub client: HubClient,
    pub bucket: Arc<MemoryBucket>,
    pub port: u16,
    server: tokio::task::JoinHandle<pipehub::Result<()>>,
    _temp: TempDir,
}

/// Start a full hub (file-backed database and queue, in-memory bucket) and
/// a client pointed at it.
pub async fn spawn_hub() -> TestHub {
    let temp = TempDir::new().expect("failed to create temp dir");

    let db = Database::initialize(temp.path().join("hub.db"))
        .await
        .expect("failed to create test database");
    let bucket = Arc::new(MemoryBucket::new());
    let queue =
        TransactionQueue::open(temp.path().join("queue")).expect("failed to open test queue");

    let hub = Arc::new(Hub::new(db, Arc::clone(&bucket) as Arc<dyn Bucket>, queue));

    let listener = Hub::bind("127.0.0.1:0").await.expect("failed to bind");
    let addr = listener.local_addr().expect("no local addr");
    let server = tokio::spawn(Arc::clone(&hub).serve(listener));

    let client = HubClient::new("127.0.0.1", addr.port()).with_retry(RetryPolicy {
        attempts: 3,
        initial_timeout: Duration::from_secs(2),
        increment: Duration::from_secs(1),
    });

    TestHub {
        hub,
        client,
        bucket,
        port: addr.port(),
        server,
        _temp: temp,
    }
}

impl TestHub {
    pub fn steps(&self) -> &StepRepository {
        self.hub.steps()
    }

    /// Writes are acknowledged before they apply; poll until the row
    /// reaches the expected status.
    pub async fn wait_for_status(&self, id: &str, status: StepStatus) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(row) = self.steps().find_by_id(id).await.unwrap() {
                if row.status == status.as_i64() {
                    return;
                }
            }
            if Instant::now() > deadline {
                panic!("step {} never reached {}", id, status);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until the steps table holds exactly `expected` rows.
    pub async fn wait_for_row_count(&self, expected: i64) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let count = self.steps().count_all().await.unwrap();
            if count == expected {
                return;
            }
            if Instant::now() > deadline {
                panic!("expected {} rows, still at {}", expected, count);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Stop the hub and wait for its tasks to exit.
    pub async fn stop(self) {
        self.hub.shutdown().request();
        let _ = self.server.await;
    }
}
