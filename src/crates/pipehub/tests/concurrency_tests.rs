//! Concurrency tests: the transaction pipeline under parallel clients

mod common;

use common::spawn_hub;
use futures::future::join_all;
use pipehub::{StepDefinition, StepStatus};

#[tokio::test]
async fn test_concurrent_uploads_all_drain() {
    let hub = spawn_hub().await;
    const UPLOADS: usize = 100;

    let tasks: Vec<_> = (0..UPLOADS)
        .map(|i| {
            let client = hub.client.clone();
            tokio::spawn(async move {
                client
                    .upload_step(&StepDefinition::new(format!("step-{:03}", i)))
                    .await
            })
        })
        .collect();

    for result in join_all(tasks).await {
        result.unwrap().unwrap();
    }

    // Every ack'd upload must be applied once the queue drains.
    hub.wait_for_row_count(UPLOADS as i64).await;
    let counts = hub.client.step_count("*").await.unwrap();
    assert_eq!(counts.total, UPLOADS as i64);
    assert_eq!(counts.table.get("pending"), Some(&(UPLOADS as i64)));

    hub.stop().await;
}

#[tokio::test]
async fn test_enqueue_order_is_apply_order() {
    let hub = spawn_hub().await;

    hub.client
        .upload_step(&StepDefinition::new("churn"))
        .await
        .unwrap();
    hub.wait_for_status("churn", StepStatus::Pending).await;

    // Sequential acked writes must land in order; the last one wins.
    hub.client.cancel("churn").await.unwrap();
    hub.client.reset("churn").await.unwrap();
    hub.client.error("churn", "late failure", "").await.unwrap();
    hub.wait_for_status("churn", StepStatus::Error).await;

    let row = hub.steps().find_by_id("churn").await.unwrap().unwrap();
    assert_eq!(row.msg, "late failure");

    hub.stop().await;
}

#[tokio::test]
async fn test_parallel_get_steps_never_hand_out_duplicates() {
    let hub = spawn_hub().await;

    let defs: Vec<StepDefinition> = (0..20)
        .map(|i| StepDefinition::new(format!("w{:02}", i)))
        .collect();
    hub.client.upload_steps(&defs).await.unwrap();
    hub.wait_for_row_count(20).await;

    // Ten workers polling at once; leases must never overlap.
    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let client = hub.client.clone();
            tokio::spawn(async move {
                client
                    .get_steps_limited(&["default".to_string()], 2)
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut seen = std::collections::HashSet::new();
    for result in join_all(tasks).await {
        for id in result.unwrap() {
            assert!(seen.insert(id.clone()), "step {} leased twice", id);
        }
    }
    assert_eq!(seen.len(), 20);

    hub.stop().await;
}
