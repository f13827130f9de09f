//! Domain models for pipehub
//!
//! Defines the step metadata row held in the metadata store, the full step
//! definition held in the blob bucket, and the tag velocity record.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::FromRow;

/// How long a `working` lease is honored before the row is considered stuck
/// and re-offered by the scheduler (0.2 hours).
pub const LEASE_SECONDS: i64 = 720;

/// Step status enumeration
///
/// The integer values are stored in the metadata store and travel on the
/// wire in `upload-step`/`upload-steps` bodies; they must stay stable across
/// releases. Responses expose the lowercase names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Waiting for parents to finish
    Queued = 0,
    /// Runnable, not yet handed to a worker
    Pending = 1,
    /// Leased to a worker
    Working = 2,
    /// Finished successfully
    Success = 3,
    /// Worker reported a failure
    Error = 4,
    /// Cancelled, terminal until an explicit reset
    Cancel = 5,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Pending => "pending",
            Self::Working => "working",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancel => "cancel",
        }
    }

    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    /// Decode the stable integer encoding. Returns `None` for values no
    /// release has ever produced.
    pub fn from_i64(n: i64) -> Option<Self> {
        match n {
            0 => Some(Self::Queued),
            1 => Some(Self::Pending),
            2 => Some(Self::Working),
            3 => Some(Self::Success),
            4 => Some(Self::Error),
            5 => Some(Self::Cancel),
            _ => None,
        }
    }

    /// Human name for a stored integer, used when serializing rows outward.
    pub fn name_of(n: i64) -> &'static str {
        Self::from_i64(n).map(|s| s.as_str()).unwrap_or("unknown")
    }

    /// Terminal states survive until an explicit `reset`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Cancel)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One step's runtime record in the metadata store.
///
/// The dependency edges are NOT here; they live in the blob bucket as part
/// of the [`StepDefinition`] and are fetched when a traversal needs them.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StepRow {
    /// Opaque unique step identifier
    pub id: String,

    /// Higher runs earlier within a scope
    pub priority: i64,

    /// Named bucket for coarse prioritization (e.g. `production`)
    pub scope: String,

    /// Reserved per-step rate hint; scheduling consults the tag table only
    pub velocity: Option<f64>,

    /// Label grouping steps for rate throttling
    pub tag: String,

    /// Integer-encoded [`StepStatus`]
    pub status: i64,

    /// Seconds since the Unix epoch of the last status transition
    pub epoch: i64,

    /// Last error message, empty otherwise
    pub msg: String,

    /// Last error stack trace, empty otherwise
    pub trace: String,
}

impl StepRow {
    /// Serialize for responses, translating the status integer to its name.
    pub fn to_document(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "priority": self.priority,
            "scope": self.scope,
            "velocity": self.velocity,
            "tag": self.tag,
            "status": StepStatus::name_of(self.status),
            "epoch": self.epoch,
            "msg": self.msg,
            "trace": self.trace,
        })
    }
}

/// Full step definition, stored in the blob bucket at `step/<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Opaque unique step identifier
    pub id: String,

    /// Higher runs earlier within a scope
    #[serde(default)]
    pub priority: i64,

    /// Named bucket for coarse prioritization
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Reserved per-step rate hint
    #[serde(default)]
    pub velocity: Option<f64>,

    /// Label grouping steps for rate throttling
    #[serde(default = "default_scope")]
    pub tag: String,

    /// Ids of predecessor steps
    #[serde(default)]
    pub parents: Vec<String>,

    /// Ids of successor steps
    #[serde(default)]
    pub children: Vec<String>,

    /// Embedded language the step's code unit is written in
    #[serde(default)]
    pub language: String,

    /// Code unit reference executed by workers
    #[serde(default)]
    pub code: String,
}

fn default_scope() -> String {
    "default".to_string()
}

impl StepDefinition {
    /// Create a definition with defaults suitable for building up via the
    /// `with_*` methods.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            priority: 0,
            scope: default_scope(),
            velocity: None,
            tag: default_scope(),
            parents: Vec::new(),
            children: Vec::new(),
            language: String::new(),
            code: String::new(),
        }
    }

    /// Builder: set priority
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: set scope
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Builder: set tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Builder: set parent ids
    pub fn with_parents(mut self, parents: Vec<String>) -> Self {
        self.parents = parents;
        self
    }

    /// Builder: set child ids
    pub fn with_children(mut self, children: Vec<String>) -> Self {
        self.children = children;
        self
    }

    /// Builder: set the code unit and its language
    pub fn with_code(mut self, language: impl Into<String>, code: impl Into<String>) -> Self {
        self.language = language.into();
        self.code = code.into();
        self
    }

    /// A starter has no parents and is uploaded directly as `pending`.
    pub fn is_starter(&self) -> bool {
        self.parents.is_empty()
    }

    /// Status a fresh upload of this step should carry.
    pub fn initial_status(&self) -> StepStatus {
        if self.is_starter() {
            StepStatus::Pending
        } else {
            StepStatus::Queued
        }
    }

    /// Materialize the metadata row for this definition.
    pub fn to_row(&self, status: StepStatus, epoch: i64) -> StepRow {
        StepRow {
            id: self.id.clone(),
            priority: self.priority,
            scope: self.scope.clone(),
            velocity: self.velocity,
            tag: self.tag.clone(),
            status: status.as_i64(),
            epoch,
            msg: String::new(),
            trace: String::new(),
        }
    }
}

/// Velocity cap for one tag: the maximum concurrent in-flight count the
/// scheduler will admit for steps carrying the tag.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TagVelocity {
    pub tag: String,
    pub velocity_limit: i64,
}

/// Current Unix time in seconds, the epoch unit used throughout the hub.
pub fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_integer_encoding_is_stable() {
        assert_eq!(StepStatus::Queued.as_i64(), 0);
        assert_eq!(StepStatus::Pending.as_i64(), 1);
        assert_eq!(StepStatus::Working.as_i64(), 2);
        assert_eq!(StepStatus::Success.as_i64(), 3);
        assert_eq!(StepStatus::Error.as_i64(), 4);
        assert_eq!(StepStatus::Cancel.as_i64(), 5);

        for n in 0..6 {
            assert_eq!(StepStatus::from_i64(n).unwrap().as_i64(), n);
        }
        assert!(StepStatus::from_i64(42).is_none());
        assert_eq!(StepStatus::name_of(42), "unknown");
    }

    #[test]
    fn test_starter_initial_status() {
        let starter = StepDefinition::new("a");
        assert!(starter.is_starter());
        assert_eq!(starter.initial_status(), StepStatus::Pending);

        let child = StepDefinition::new("b").with_parents(vec!["a".to_string()]);
        assert!(!child.is_starter());
        assert_eq!(child.initial_status(), StepStatus::Queued);
    }

    #[test]
    fn test_definition_roundtrip() {
        let def = StepDefinition::new("step-1")
            .with_priority(7)
            .with_scope("production")
            .with_tag("reports")
            .with_children(vec!["step-2".to_string()])
            .with_code("python", "print('hi')");

        let bytes = serde_json::to_vec(&def).unwrap();
        let back: StepDefinition = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.id, "step-1");
        assert_eq!(back.priority, 7);
        assert_eq!(back.scope, "production");
        assert_eq!(back.children, vec!["step-2".to_string()]);
    }

    #[test]
    fn test_definition_tolerates_sparse_documents() {
        // Workers may upload documents carrying only the fields they know.
        let def: StepDefinition = serde_json::from_str(r#"{"id": "bare"}"#).unwrap();
        assert_eq!(def.scope, "default");
        assert_eq!(def.tag, "default");
        assert!(def.parents.is_empty());
        assert!(def.is_starter());
    }

    #[test]
    fn test_row_document_uses_status_name() {
        let row = StepDefinition::new("x").to_row(StepStatus::Pending, 100);
        let doc = row.to_document();
        assert_eq!(doc["status"], "pending");
        assert_eq!(doc["epoch"], 100);
    }
}
