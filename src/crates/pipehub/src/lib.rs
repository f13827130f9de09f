//! # Pipehub - Pipeline Coordination Hub
//!
//! The central coordination hub of a distributed pipeline orchestrator.
//! Workers across many machines poll the hub over a small TCP protocol for
//! runnable steps, report transitions (`done`, `error`, `cancel`, `reset`,
//! `pending`), and the hub keeps the authoritative step state.
//!
//! ## Architecture
//!
//! - **Metadata store** - step runtime state in SQLite, indexed for the
//!   scheduler's candidate scan
//! - **Blob bucket** - full step definitions (`step/<id>`) and inter-step
//!   payloads (`step-data/<id>`) behind a pluggable [`Bucket`] seam
//! - **Transaction queue** - durable FIFO of mutations; writes are
//!   acknowledged once spooled and applied serially afterwards
//! - **Scheduler** - priority/recency ranking with per-tag velocity
//!   admission and lease-based recovery of stuck work
//! - **State machine** - dependency-aware transitions across the step DAG
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pipehub::{Bucket, Database, FsBucket, Hub, TransactionQueue};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let db = Database::initialize("pipehub.db").await?;
//! let bucket: Arc<dyn Bucket> = Arc::new(FsBucket::new("bucket")?);
//! let queue = TransactionQueue::open("queue")?;
//!
//! let hub = Arc::new(Hub::new(db, bucket, queue));
//! let listener = Hub::bind("127.0.0.1:65432").await?;
//! hub.serve(listener).await?;
//! # Ok(())
//! # }
//! ```

// Core modules
pub mod bucket;
pub mod client;
pub mod config;
pub mod db;
pub mod governor;
pub mod models;
pub mod protocol;
pub mod repositories;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod statemachine;
pub mod txqueue;

// Error types and utilities
mod error;

// Re-export key types for convenience
pub use bucket::{Bucket, FsBucket, MemoryBucket};
pub use client::{HubClient, RetryPolicy, StepCounts};
pub use config::HubConfig;
pub use db::Database;
pub use error::{HubError, Result};
pub use governor::TagGovernor;
pub use models::{StepDefinition, StepRow, StepStatus, TagVelocity, LEASE_SECONDS};
pub use protocol::Method;
pub use repositories::{StepRepository, VelocityRepository};
pub use scheduler::{GetStepsOptions, Scheduler};
pub use server::Hub;
pub use shutdown::ShutdownCoordinator;
pub use statemachine::{Mutation, StateMachine};
pub use txqueue::TransactionQueue;
