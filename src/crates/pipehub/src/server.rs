//! Request dispatcher and hub wiring
//!
//! Three long-lived tasks service the wire protocol:
//!
//! - the acceptor takes connections and spawns a short-lived handler per
//!   connection that reads exactly one frame and enqueues it;
//! - the request processor consumes the in-memory request queue, answers
//!   reads inline, and spools writes to the durable transaction queue
//!   before acknowledging `ok`;
//! - the transaction executor drains the durable queue and applies each
//!   mutation through the state machine.
//!
//! Writes are acknowledged before application; clients needing
//! read-after-write poll.

use crate::bucket::{fetch_definition, Bucket};
use crate::db::Database;
use crate::error::{HubError, Result};
use crate::governor::TagGovernor;
use crate::protocol::{
    read_frame, split_request, write_frame, Method, OK_RESPONSE, UNKNOWN_METHOD_RESPONSE,
};
use crate::repositories::{StepRepository, VelocityRepository};
use crate::scheduler::{GetStepsOptions, Scheduler};
use crate::shutdown::ShutdownCoordinator;
use crate::statemachine::{Mutation, StateMachine};
use crate::txqueue::TransactionQueue;
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Maximum bind retries when the port is still held by a previous process.
const BIND_RETRIES: u32 = 5;

/// Capacity of the in-memory request queue between acceptor and processor.
const REQUEST_QUEUE_CAPACITY: usize = 1024;

/// One accepted request waiting for the processor.
struct Request {
    stream: TcpStream,
    method: Method,
    body: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct StepCountRequest {
    types: String,
}

#[derive(Debug, Deserialize)]
struct FetchErrorsRequest {
    #[serde(default)]
    count: Option<usize>,
    #[serde(default)]
    exclude: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct FetchRowsRequest {
    step_id: String,
}

/// The coordination hub: owns the stores, queues, scheduler, and state
/// machine, and serves the wire protocol.
pub struct Hub {
    steps: StepRepository,
    velocities: VelocityRepository,
    scheduler: Scheduler,
    machine: StateMachine,
    queue: Arc<TransactionQueue>,
    governor: Arc<TagGovernor>,
    bucket: Arc<dyn Bucket>,
    shutdown: ShutdownCoordinator,
}

impl Hub {
    /// Wire up a hub over an opened database, bucket, and durable queue.
    pub fn new(db: Database, bucket: Arc<dyn Bucket>, queue: TransactionQueue) -> Self {
        let db = Arc::new(db);
        let steps = StepRepository::new(db.clone());
        let velocities = VelocityRepository::new(db);
        let governor = Arc::new(TagGovernor::new());
        let scheduler = Scheduler::new(steps.clone(), velocities.clone(), governor.clone());
        let machine = StateMachine::new(steps.clone(), bucket.clone());

        Self {
            steps,
            velocities,
            scheduler,
            machine,
            queue: Arc::new(queue),
            governor,
            bucket,
            shutdown: ShutdownCoordinator::new(),
        }
    }

    pub fn steps(&self) -> &StepRepository {
        &self.steps
    }

    pub fn velocities(&self) -> &VelocityRepository {
        &self.velocities
    }

    pub fn governor(&self) -> &Arc<TagGovernor> {
        &self.governor
    }

    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Bind the listener, retrying while the port is still in use.
    pub async fn bind(addr: &str) -> Result<TcpListener> {
        let mut attempt: u32 = 0;
        loop {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    info!(addr, "hub listening");
                    return Ok(listener);
                }
                Err(e) if e.kind() == ErrorKind::AddrInUse && attempt < BIND_RETRIES => {
                    attempt += 1;
                    let backoff = Duration::from_secs(u64::from(5 * attempt));
                    warn!(addr, attempt, "address in use, retrying in {:?}", backoff);
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run the hub until shutdown is requested.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let ticker = self.governor.spawn_ticker(self.shutdown.clone());

        let (tx, rx) = mpsc::channel::<Request>(REQUEST_QUEUE_CAPACITY);
        let processor = {
            let hub = self.clone();
            tokio::spawn(async move { hub.process_loop(rx).await })
        };
        let executor = {
            let hub = self.clone();
            tokio::spawn(async move { hub.execute_loop().await })
        };

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted connection");
                            let tx = tx.clone();
                            tokio::spawn(handle_connection(stream, tx));
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        }

        drop(tx);
        let _ = processor.await;
        let _ = executor.await;
        let _ = ticker.await;
        info!("hub stopped");
        Ok(())
    }

    async fn process_loop(&self, mut rx: mpsc::Receiver<Request>) {
        loop {
            let request = tokio::select! {
                _ = self.shutdown.wait() => break,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            self.process(request).await;
        }
        debug!("request processor stopped");
    }

    /// Route one request: spool writes, execute reads inline, reply.
    async fn process(&self, request: Request) {
        let Request {
            mut stream,
            method,
            body,
        } = request;

        let reply = if method.is_mutation() {
            self.queue
                .push(method, &body)
                .await
                .map(|_| OK_RESPONSE.to_vec())
        } else {
            self.execute_read(method, &body).await
        };

        match reply {
            Ok(bytes) => {
                if let Err(e) = write_frame(&mut stream, &bytes).await {
                    debug!(%method, error = %e, "failed to write reply");
                }
            }
            Err(e) => {
                // Malformed body or storage failure: close without a reply.
                debug!(%method, error = %e, "request failed, closing connection");
            }
        }
    }

    async fn execute_read(&self, method: Method, body: &[u8]) -> Result<Vec<u8>> {
        match method {
            Method::GetSteps => {
                let (scopes, options): (Vec<String>, GetStepsOptions) =
                    serde_json::from_slice(body)?;
                let ids = self.scheduler.get_steps(&scopes, &options).await?;
                Ok(serde_json::to_vec(&ids)?)
            }
            Method::StepCount => {
                let request: StepCountRequest = serde_json::from_slice(body)?;
                let table = self.steps.count_by_status(request.types == "*").await?;
                let total: i64 = table.values().sum();
                Ok(serde_json::to_vec(&json!({
                    "table": table,
                    "total": total,
                }))?)
            }
            Method::FetchErrors => {
                let request: FetchErrorsRequest = serde_json::from_slice(body)?;
                self.fetch_errors(request).await
            }
            Method::FetchRows => {
                let request: FetchRowsRequest = serde_json::from_slice(body)?;
                let ids: Vec<String> = request
                    .step_id
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                let rows = self.steps.find_many(&ids).await?;
                let documents: Vec<Value> = rows.iter().map(|r| r.to_document()).collect();
                Ok(serde_json::to_vec(&documents)?)
            }
            Method::DeleteSteps => {
                if body.is_empty() {
                    return Err(HubError::Protocol("delete-steps body is empty".to_string()));
                }
                let deleted = self.steps.delete_all().await?;
                info!(deleted, "deleted all step rows");
                Ok(serde_json::to_vec(&json!({ "deleted": deleted }))?)
            }
            other => Err(HubError::Protocol(format!(
                "{} is not a read method",
                other
            ))),
        }
    }

    async fn fetch_errors(&self, request: FetchErrorsRequest) -> Result<Vec<u8>> {
        let excludes = normalize_excludes(request.exclude)?;
        let limit = request.count.unwrap_or(100);

        let total = self.steps.errors_total(&excludes).await?;
        let rows = self.steps.errors(limit, &excludes).await?;

        let mut table = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut document = row.to_document();
            // Enrich with the full definition; a missing blob degrades to
            // null rather than failing the whole report.
            let definition = match fetch_definition(self.bucket.as_ref(), &row.id).await {
                Ok(def) => serde_json::to_value(def)?,
                Err(e) => {
                    warn!(step = %row.id, error = %e, "no definition for errored step");
                    Value::Null
                }
            };
            document["definition"] = definition;
            table.push(document);
        }

        Ok(serde_json::to_vec(&json!({
            "total": total,
            "count": table.len(),
            "table": table,
        }))?)
    }

    /// Drain the durable queue, applying mutations in enqueue order.
    async fn execute_loop(&self) {
        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = self.queue.wait_nonempty() => {}
            }

            loop {
                let item = match self.queue.pop().await {
                    Ok(Some(item)) => item,
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "failed to read transaction queue head");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        break;
                    }
                };

                match Mutation::parse(item.method, &item.payload) {
                    Ok(mutation) => {
                        if let Err(e) = self.machine.apply(mutation).await {
                            // The client was acked at enqueue time; the step
                            // stays in a recoverable state.
                            error!(method = %item.method, error = %e, "failed to apply mutation");
                        }
                    }
                    Err(e) => warn!(method = %item.method, error = %e, "undecodable mutation body"),
                }

                if let Err(e) = self.queue.ack(item.seq).await {
                    error!(seq = item.seq, error = %e, "failed to ack transaction");
                }
                if self.shutdown.is_requested() {
                    break;
                }
            }
            if self.shutdown.is_requested() {
                break;
            }
        }
        debug!("transaction executor stopped");
    }
}

/// Normalize the `exclude` field: null, a string, or a list of strings.
fn normalize_excludes(exclude: Option<Value>) -> Result<Vec<String>> {
    use crate::repositories::step_repository::sanitize_exclude;

    let raw: Vec<String> = match exclude {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) => vec![s],
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(HubError::Protocol(format!(
                    "exclude list entries must be strings, got {}",
                    other
                ))),
            })
            .collect::<Result<Vec<_>>>()?,
        Some(other) => {
            return Err(HubError::Protocol(format!(
                "exclude must be null, a string, or a list, got {}",
                other
            )))
        }
    };

    Ok(raw.iter().filter_map(|s| sanitize_exclude(s)).collect())
}

/// Read one request frame from a fresh connection and queue it.
async fn handle_connection(mut stream: TcpStream, tx: mpsc::Sender<Request>) {
    let frame = match read_frame(&mut stream).await {
        Ok(Some(frame)) => frame,
        Ok(None) => return,
        Err(e) => {
            // Malformed frame: no reply, just close.
            debug!(error = %e, "dropping malformed frame");
            return;
        }
    };

    let (method_str, body) = match split_request(&frame) {
        Ok(parts) => parts,
        Err(e) => {
            debug!(error = %e, "dropping unsplittable request");
            return;
        }
    };

    let method = match Method::parse(method_str) {
        Some(method) => method,
        None => {
            debug!(method = method_str, "unknown method");
            let _ = write_frame(&mut stream, UNKNOWN_METHOD_RESPONSE).await;
            return;
        }
    };

    let request = Request {
        method,
        body: body.to_vec(),
        stream,
    };
    if tx.send(request).await.is_err() {
        debug!("request queue closed, dropping connection");
    }
}
