//! Job state bag with explicit per-field merge policies.
//!
//! `StateBag` is the mutable context threaded through a job run. Steps never
//! mutate it directly: they return a [`StateDelta`] which the executor folds
//! into the bag using the [`FieldMerge`] policy registered for each field in a
//! [`StateSchema`]. Append and map-merge policies make the order in which
//! phase members finish irrelevant.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stepwise_types::job::ErrorDetails;

// ---------------------------------------------------------------------------
// Well-known fields
// ---------------------------------------------------------------------------

/// Machine-readable error kind of the failure that ended normal execution.
pub const ERROR: &str = "error";
/// Serialized [`ErrorDetails`] of the first failure.
pub const ERROR_DETAILS: &str = "error_details";
/// Append-only list of failures recorded by phase members.
pub const PROCESSING_ERRORS: &str = "processing_errors";
/// Set on jobs resubmitted by the recovery orchestrator.
pub const IS_RECOVERY: &str = "_is_recovery";
/// Recovery annotation (checkpoint payload or skip flags).
pub const RECOVERY: &str = "_recovery";
/// Identifying key of the job input (content fingerprint).
pub const JOB_KEY: &str = "job_key";

// ---------------------------------------------------------------------------
// Merge policy
// ---------------------------------------------------------------------------

/// How a value in a delta is combined with the value already in the bag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldMerge {
    /// Replace the current value.
    #[default]
    LastWriteWins,
    /// Keep the current value once one is set.
    FirstWriteWins,
    /// Treat the field as a list; arrays are concatenated, scalars pushed.
    Append,
    /// Shallow-merge objects key by key.
    MergeMap,
}

/// Field name -> merge policy table for one workflow.
#[derive(Debug, Clone)]
pub struct StateSchema {
    policies: HashMap<String, FieldMerge>,
}

impl Default for StateSchema {
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert(ERROR_DETAILS.to_string(), FieldMerge::FirstWriteWins);
        policies.insert(PROCESSING_ERRORS.to_string(), FieldMerge::Append);
        Self { policies }
    }
}

impl StateSchema {
    /// Schema with the engine's built-in fields registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or override) the policy of a field.
    pub fn field(mut self, name: impl Into<String>, merge: FieldMerge) -> Self {
        self.policies.insert(name.into(), merge);
        self
    }

    pub fn policy(&self, name: &str) -> FieldMerge {
        self.policies.get(name).copied().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// StateDelta
// ---------------------------------------------------------------------------

/// Partial state returned by a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateDelta {
    fields: Map<String, Value>,
}

impl StateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Signal a controlled (business) failure.
    pub fn with_error(self, kind: impl Into<String>) -> Self {
        self.set(ERROR, Value::String(kind.into()))
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.shift_remove(name)
    }

    /// Whether applying this delta would set `error`.
    pub fn sets_error(&self) -> bool {
        self.fields.get(ERROR).is_some_and(|v| !v.is_null())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }
}

impl From<Map<String, Value>> for StateDelta {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

// ---------------------------------------------------------------------------
// StateBag
// ---------------------------------------------------------------------------

/// Ordered key/value context owned by one in-flight job.
///
/// Invariant: a field that holds a concrete value is never reset to `null`
/// by a delta. The only exception is `error`, which the error-handling
/// terminal step may clear.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateBag {
    fields: Map<String, Value>,
}

/// Who is applying a delta; only the error handler may clear `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Applier {
    Step,
    ErrorHandler,
}

impl StateBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Builder-style insert used to seed the initial state of a job.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|v| !v.is_null())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_bool(&self, name: &str) -> bool {
        self.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// The error kind, when the job is in an error state.
    pub fn error(&self) -> Option<&str> {
        self.get(ERROR).map(|v| v.as_str().unwrap_or("error"))
    }

    pub fn has_error(&self) -> bool {
        self.get(ERROR).is_some()
    }

    pub fn error_details(&self) -> Option<ErrorDetails> {
        self.get(ERROR_DETAILS)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn processing_errors(&self) -> &[Value] {
        self.get(PROCESSING_ERRORS)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_recovery(&self) -> bool {
        self.get_bool(IS_RECOVERY)
    }

    pub fn job_key(&self) -> Option<&str> {
        self.get_str(JOB_KEY)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fold a step's delta into the bag.
    pub fn apply(&mut self, delta: &StateDelta, schema: &StateSchema) {
        self.apply_as(delta, schema, Applier::Step);
    }

    pub(crate) fn apply_as(&mut self, delta: &StateDelta, schema: &StateSchema, applier: Applier) {
        for (name, incoming) in delta.iter() {
            if incoming.is_null() {
                if name == ERROR && applier == Applier::ErrorHandler {
                    self.fields.insert(name.clone(), Value::Null);
                } else if self.contains(name) {
                    tracing::debug!(field = name.as_str(), "ignoring null reset of populated field");
                }
                continue;
            }
            self.merge_field(name, incoming.clone(), schema.policy(name));
        }
    }

    fn merge_field(&mut self, name: &str, incoming: Value, policy: FieldMerge) {
        if !self.contains(name) {
            let value = match (policy, incoming) {
                (FieldMerge::Append, Value::Array(items)) => Value::Array(items),
                (FieldMerge::Append, scalar) => Value::Array(vec![scalar]),
                (_, value) => value,
            };
            self.fields.insert(name.to_string(), value);
            return;
        }
        let Some(current) = self.fields.get_mut(name) else {
            return;
        };
        match policy {
            FieldMerge::LastWriteWins => *current = incoming,
            FieldMerge::FirstWriteWins => {}
            FieldMerge::Append => {
                if !current.is_array() {
                    let previous = current.take();
                    *current = Value::Array(vec![previous]);
                }
                if let Value::Array(list) = current {
                    match incoming {
                        Value::Array(items) => list.extend(items),
                        scalar => list.push(scalar),
                    }
                }
            }
            FieldMerge::MergeMap => match (current, incoming) {
                (Value::Object(existing), Value::Object(update)) => {
                    for (key, value) in update {
                        existing.insert(key, value);
                    }
                }
                (current, replacement) => *current = replacement,
            },
        }
    }

    /// Record a failure raised by a step. Only the first failure is kept.
    pub fn record_failure(&mut self, details: &ErrorDetails) {
        if !self.has_error() {
            self.fields
                .insert(ERROR.to_string(), Value::String(details.error_kind.clone()));
        }
        if !self.contains(ERROR_DETAILS) {
            if let Ok(value) = serde_json::to_value(details) {
                self.fields.insert(ERROR_DETAILS.to_string(), value);
            }
        }
    }

    /// Serialize the bag for checkpointing.
    pub fn to_json(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// Restore a bag from a JSON object; non-objects yield an empty bag.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(fields) => Self { fields },
            _ => Self::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
