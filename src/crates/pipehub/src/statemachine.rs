//! State-machine executor
//!
//! Applies one mutation at a time against the metadata store and the blob
//! bucket. Serial application gives a total order over state transitions;
//! every operation is an absolute-state write, so replaying an item after a
//! crash between dequeue and ack changes nothing.

use crate::bucket::{fetch_definition, step_data_key, store_definition, Bucket};
use crate::error::{HubError, Result};
use crate::models::{now_epoch, StepDefinition, StepStatus};
use crate::protocol::Method;
use crate::repositories::StepRepository;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Body of an `error` request.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorReport {
    pub step_id: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub trace: String,
}

/// A decoded mutation, ready to apply.
#[derive(Debug, Clone)]
pub enum Mutation {
    Done(String),
    Pending(String),
    Cancel(String),
    Reset(String),
    Error(ErrorReport),
    UploadStep {
        def: StepDefinition,
        status: StepStatus,
    },
    UploadSteps {
        defs: Vec<StepDefinition>,
        statuses: Vec<StepStatus>,
    },
    ResetErrors {
        include_working: bool,
    },
}

fn body_step_id(payload: &[u8]) -> Result<String> {
    let id = std::str::from_utf8(payload)
        .map_err(|_| HubError::Protocol("step id is not UTF-8".to_string()))?;
    if id.is_empty() {
        return Err(HubError::Protocol("empty step id".to_string()));
    }
    Ok(id.to_string())
}

fn decode_status(n: i64) -> Result<StepStatus> {
    StepStatus::from_i64(n)
        .ok_or_else(|| HubError::Protocol(format!("unknown status integer {}", n)))
}

impl Mutation {
    /// Decode a wire body for a mutating method.
    pub fn parse(method: Method, payload: &[u8]) -> Result<Self> {
        match method {
            Method::Done => Ok(Self::Done(body_step_id(payload)?)),
            Method::Pending => Ok(Self::Pending(body_step_id(payload)?)),
            Method::Cancel => Ok(Self::Cancel(body_step_id(payload)?)),
            Method::Reset => Ok(Self::Reset(body_step_id(payload)?)),
            Method::Error => Ok(Self::Error(serde_json::from_slice(payload)?)),
            Method::UploadStep => {
                let (def, status): (StepDefinition, i64) = serde_json::from_slice(payload)?;
                Ok(Self::UploadStep {
                    def,
                    status: decode_status(status)?,
                })
            }
            Method::UploadSteps => {
                let (defs, statuses): (Vec<StepDefinition>, Vec<i64>) =
                    serde_json::from_slice(payload)?;
                if defs.len() != statuses.len() {
                    return Err(HubError::Protocol(format!(
                        "upload-steps carries {} definitions but {} statuses",
                        defs.len(),
                        statuses.len()
                    )));
                }
                let statuses = statuses
                    .into_iter()
                    .map(decode_status)
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self::UploadSteps { defs, statuses })
            }
            Method::ResetErrors => {
                let include_working = match payload {
                    b"true" => true,
                    b"false" => false,
                    other => {
                        return Err(HubError::Protocol(format!(
                            "reset-errors body must be 'true' or 'false', got {:?}",
                            String::from_utf8_lossy(other)
                        )))
                    }
                };
                Ok(Self::ResetErrors { include_working })
            }
            _ => Err(HubError::Protocol(format!(
                "{} is not a mutating method",
                method
            ))),
        }
    }
}

/// Applies mutations against the metadata store and blob bucket.
#[derive(Clone)]
pub struct StateMachine {
    steps: StepRepository,
    bucket: Arc<dyn Bucket>,
}

impl StateMachine {
    pub fn new(steps: StepRepository, bucket: Arc<dyn Bucket>) -> Self {
        Self { steps, bucket }
    }

    /// Apply one mutation. Errors here are logged by the executor loop and
    /// never reach the client, which was acknowledged at enqueue time.
    pub async fn apply(&self, mutation: Mutation) -> Result<()> {
        match mutation {
            Mutation::Done(id) => self.apply_done(&id).await,
            Mutation::Pending(id) => {
                self.steps
                    .set_status(&id, StepStatus::Pending, now_epoch())
                    .await
            }
            Mutation::Cancel(id) => self.apply_cancel(&id).await,
            Mutation::Reset(id) => self.apply_reset(&id).await,
            Mutation::Error(report) => {
                self.steps
                    .set_error(&report.step_id, now_epoch(), &report.msg, &report.trace)
                    .await
            }
            Mutation::UploadStep { def, status } => self.apply_upload(&def, status).await,
            Mutation::UploadSteps { defs, statuses } => {
                for (def, status) in defs.iter().zip(statuses) {
                    self.apply_upload(def, status).await?;
                }
                Ok(())
            }
            Mutation::ResetErrors { include_working } => {
                let changed = self
                    .steps
                    .reset_errors(include_working, now_epoch())
                    .await?;
                debug!(changed, include_working, "reset errored steps to pending");
                Ok(())
            }
        }
    }

    async fn apply_upload(&self, def: &StepDefinition, status: StepStatus) -> Result<()> {
        // Definition blob first: a metadata row without its blob would be
        // an orphan the traversals cannot follow.
        store_definition(self.bucket.as_ref(), def).await?;
        self.steps.insert(&def.to_row(status, now_epoch())).await?;
        debug!(step = %def.id, status = %status, "uploaded step");
        Ok(())
    }

    async fn apply_done(&self, id: &str) -> Result<()> {
        // Definition first: without it the children cannot be promoted, and
        // the row transition is skipped along with the rest of the mutation.
        let def = fetch_definition(self.bucket.as_ref(), id).await?;

        let now = now_epoch();
        self.steps.set_status(id, StepStatus::Success, now).await?;
        if !def.children.is_empty() {
            self.steps
                .set_status_many(&def.children, StepStatus::Pending, now)
                .await?;
            debug!(step = %id, children = def.children.len(), "promoted children to pending");
        }

        self.collect_garbage(id).await
    }

    async fn apply_cancel(&self, id: &str) -> Result<()> {
        let ids = self.reachable(id).await?;
        self.steps
            .set_status_many(&ids, StepStatus::Cancel, now_epoch())
            .await?;
        debug!(step = %id, affected = ids.len(), "cancelled connected steps");

        self.collect_garbage(id).await
    }

    async fn apply_reset(&self, id: &str) -> Result<()> {
        let ids = self.reachable(id).await?;
        let now = now_epoch();

        let mut to_queued = Vec::new();
        let mut to_pending = Vec::new();
        for step_id in &ids {
            let def = fetch_definition(self.bucket.as_ref(), step_id).await?;
            if def.is_starter() {
                to_pending.push(step_id.clone());
            } else {
                to_queued.push(step_id.clone());
            }
        }
        self.steps
            .set_status_many(&to_pending, StepStatus::Pending, now)
            .await?;
        self.steps
            .set_status_many(&to_queued, StepStatus::Queued, now)
            .await?;
        debug!(step = %id, affected = ids.len(), "reset connected steps");
        Ok(())
    }

    /// Every id reachable from `id` over parent and child edges, `id`
    /// included. The DAG is assumed acyclic; the visited set guards anyway.
    async fn reachable(&self, id: &str) -> Result<Vec<String>> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut frontier = vec![id.to_string()];
        let mut order = Vec::new();

        while let Some(current) = frontier.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let def = fetch_definition(self.bucket.as_ref(), &current).await?;
            for neighbor in def.parents.iter().chain(def.children.iter()) {
                if !visited.contains(neighbor) {
                    frontier.push(neighbor.clone());
                }
            }
            order.push(current);
        }
        Ok(order)
    }

    /// Delete the payload blobs of a finished component.
    ///
    /// Once every step reachable from `id` is terminal, the inter-step
    /// payloads can no longer be read by anything; the definitions stay as
    /// reference data.
    async fn collect_garbage(&self, id: &str) -> Result<()> {
        let ids = self.reachable(id).await?;
        let statuses = self.steps.statuses_of(&ids).await?;

        let all_terminal = ids.iter().all(|step_id| {
            statuses
                .get(step_id)
                .and_then(|s| StepStatus::from_i64(*s))
                .map(|s| s.is_terminal())
                .unwrap_or(false)
        });
        if !all_terminal {
            return Ok(());
        }

        for step_id in &ids {
            if let Err(e) = self.bucket.delete(&step_data_key(step_id)).await {
                warn!(step = %step_id, error = %e, "failed to delete step payload");
            }
        }
        debug!(component = id, size = ids.len(), "collected step payloads");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::MemoryBucket;
    use crate::db::Database;
    use crate::models::StepRow;

    struct Fixture {
        machine: StateMachine,
        steps: StepRepository,
        bucket: Arc<MemoryBucket>,
    }

    async fn setup() -> Fixture {
        let db = Arc::new(Database::test_in_memory().await.unwrap());
        let steps = StepRepository::new(db);
        let bucket = Arc::new(MemoryBucket::new());
        let machine = StateMachine::new(steps.clone(), bucket.clone());
        Fixture {
            machine,
            steps,
            bucket,
        }
    }

    async fn upload(fix: &Fixture, def: StepDefinition) {
        let status = def.initial_status();
        fix.machine
            .apply(Mutation::UploadStep { def, status })
            .await
            .unwrap();
    }

    /// A → B → C chain with A the only starter.
    async fn upload_chain(fix: &Fixture) {
        upload(fix, StepDefinition::new("a").with_children(vec!["b".into()])).await;
        upload(
            fix,
            StepDefinition::new("b")
                .with_parents(vec!["a".into()])
                .with_children(vec!["c".into()]),
        )
        .await;
        upload(fix, StepDefinition::new("c").with_parents(vec!["b".into()])).await;
    }

    async fn status_of(fix: &Fixture, id: &str) -> i64 {
        fix.steps.find_by_id(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_upload_writes_blob_then_row() {
        let fix = setup().await;
        upload(&fix, StepDefinition::new("a")).await;

        assert!(fix.bucket.contains("step/a"));
        let row: StepRow = fix.steps.find_by_id("a").await.unwrap().unwrap();
        assert_eq!(row.status, StepStatus::Pending.as_i64());
    }

    #[tokio::test]
    async fn test_done_promotes_children() {
        let fix = setup().await;
        upload_chain(&fix).await;
        assert_eq!(status_of(&fix, "b").await, StepStatus::Queued.as_i64());

        fix.machine.apply(Mutation::Done("a".into())).await.unwrap();

        assert_eq!(status_of(&fix, "a").await, StepStatus::Success.as_i64());
        assert_eq!(status_of(&fix, "b").await, StepStatus::Pending.as_i64());
        // Grandchildren stay queued until their parent finishes.
        assert_eq!(status_of(&fix, "c").await, StepStatus::Queued.as_i64());
    }

    #[tokio::test]
    async fn test_cancel_sweeps_both_directions() {
        let fix = setup().await;
        upload_chain(&fix).await;

        fix.machine
            .apply(Mutation::Cancel("b".into()))
            .await
            .unwrap();

        for id in ["a", "b", "c"] {
            assert_eq!(status_of(&fix, id).await, StepStatus::Cancel.as_i64());
        }
    }

    #[tokio::test]
    async fn test_reset_restores_initial_statuses() {
        let fix = setup().await;
        upload_chain(&fix).await;
        fix.machine
            .apply(Mutation::Cancel("b".into()))
            .await
            .unwrap();

        fix.machine.apply(Mutation::Reset("b".into())).await.unwrap();

        assert_eq!(status_of(&fix, "a").await, StepStatus::Pending.as_i64());
        assert_eq!(status_of(&fix, "b").await, StepStatus::Queued.as_i64());
        assert_eq!(status_of(&fix, "c").await, StepStatus::Queued.as_i64());
    }

    #[tokio::test]
    async fn test_error_records_message_and_trace() {
        let fix = setup().await;
        upload(&fix, StepDefinition::new("a")).await;

        fix.machine
            .apply(Mutation::Error(ErrorReport {
                step_id: "a".into(),
                msg: "boom".into(),
                trace: "line 1".into(),
            }))
            .await
            .unwrap();

        let row = fix.steps.find_by_id("a").await.unwrap().unwrap();
        assert_eq!(row.status, StepStatus::Error.as_i64());
        assert_eq!(row.msg, "boom");
        assert_eq!(row.trace, "line 1");
    }

    #[tokio::test]
    async fn test_payload_gc_waits_for_whole_component() {
        let fix = setup().await;
        upload_chain(&fix).await;
        for id in ["a", "b", "c"] {
            fix.bucket
                .put(&step_data_key(id), b"payload")
                .await
                .unwrap();
        }

        fix.machine.apply(Mutation::Done("a".into())).await.unwrap();
        fix.machine.apply(Mutation::Done("b".into())).await.unwrap();
        // c is still pending, so nothing is collected yet.
        assert!(fix.bucket.contains("step-data/a"));

        fix.machine.apply(Mutation::Done("c".into())).await.unwrap();
        for id in ["a", "b", "c"] {
            assert!(!fix.bucket.contains(&step_data_key(id)), "{} payload kept", id);
            // Definitions are reference data and survive collection.
            assert!(fix.bucket.contains(&format!("step/{}", id)));
        }
    }

    #[tokio::test]
    async fn test_cancel_collects_payloads_immediately() {
        let fix = setup().await;
        upload_chain(&fix).await;
        fix.bucket
            .put(&step_data_key("b"), b"payload")
            .await
            .unwrap();

        fix.machine
            .apply(Mutation::Cancel("a".into()))
            .await
            .unwrap();
        assert!(!fix.bucket.contains("step-data/b"));
    }

    #[tokio::test]
    async fn test_missing_definition_blob_is_fatal_for_mutation() {
        let fix = setup().await;
        upload_chain(&fix).await;
        fix.bucket.delete("step/b").await.unwrap();

        let result = fix.machine.apply(Mutation::Cancel("a".into())).await;
        assert!(matches!(result, Err(HubError::Bucket(_))));
        // The row transitions for the unreachable sweep were skipped.
        assert_eq!(status_of(&fix, "c").await, StepStatus::Queued.as_i64());
    }

    #[tokio::test]
    async fn test_traversal_survives_cycles() {
        let fix = setup().await;
        // Malformed upload forming a 2-cycle; the visited set must stop it.
        upload(
            &fix,
            StepDefinition::new("x")
                .with_parents(vec!["y".into()])
                .with_children(vec!["y".into()]),
        )
        .await;
        upload(
            &fix,
            StepDefinition::new("y")
                .with_parents(vec!["x".into()])
                .with_children(vec!["x".into()]),
        )
        .await;

        fix.machine
            .apply(Mutation::Cancel("x".into()))
            .await
            .unwrap();
        assert_eq!(status_of(&fix, "x").await, StepStatus::Cancel.as_i64());
        assert_eq!(status_of(&fix, "y").await, StepStatus::Cancel.as_i64());
    }

    #[tokio::test]
    async fn test_upload_steps_batch() {
        let fix = setup().await;
        let defs = vec![StepDefinition::new("a"), StepDefinition::new("b")];
        let statuses = vec![StepStatus::Pending, StepStatus::Queued];
        fix.machine
            .apply(Mutation::UploadSteps { defs, statuses })
            .await
            .unwrap();

        assert_eq!(status_of(&fix, "a").await, StepStatus::Pending.as_i64());
        assert_eq!(status_of(&fix, "b").await, StepStatus::Queued.as_i64());
    }

    #[test]
    fn test_parse_bodies() {
        let m = Mutation::parse(Method::Done, b"step-1").unwrap();
        assert!(matches!(m, Mutation::Done(id) if id == "step-1"));

        let m = Mutation::parse(
            Method::Error,
            br#"{"step_id": "s", "msg": "m", "trace": "t"}"#,
        )
        .unwrap();
        assert!(matches!(m, Mutation::Error(r) if r.step_id == "s"));

        let m = Mutation::parse(Method::ResetErrors, b"true").unwrap();
        assert!(matches!(m, Mutation::ResetErrors { include_working: true }));

        assert!(Mutation::parse(Method::Done, b"").is_err());
        assert!(Mutation::parse(Method::ResetErrors, b"yes").is_err());
        assert!(Mutation::parse(Method::GetSteps, b"").is_err());

        let body = serde_json::to_vec(&(
            vec![StepDefinition::new("a")],
            vec![StepStatus::Pending.as_i64(), StepStatus::Queued.as_i64()],
        ))
        .unwrap();
        assert!(Mutation::parse(Method::UploadSteps, &body).is_err());
    }
}
