//! Schema alteration: change-set parsing and live status tracking.
//!
//! An alter request is a `schema_changes.fields` list whose entries either
//! drop a field (`{"name": "...", "drop": true}`) or add one (a full field
//! record). A drop followed by an add of the same name in one request is a
//! reindex. The two-phase walk over stored documents lives on
//! [`Collection::alter`](crate::collection::Collection::alter); this module
//! owns the pure parts.

use super::Field;
use crate::config::ALTER_STATUS_MSG_COUNT;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Parsed alter request. Drops are processed first, then additions, then
/// reindexes (drop + re-add of the same name).
#[derive(Debug, Default)]
pub struct SchemaChanges {
    pub drops: Vec<String>,
    pub additions: Vec<Field>,
    pub reindexes: Vec<Field>,
}

impl SchemaChanges {
    pub fn is_empty(&self) -> bool {
        self.drops.is_empty() && self.additions.is_empty() && self.reindexes.is_empty()
    }
}

/// Parses a `schema_changes` payload against the currently declared fields.
pub fn parse_schema_changes(payload: &Value, existing: &[Field]) -> Result<SchemaChanges> {
    let entries = payload
        .get("fields")
        .and_then(|f| f.as_array())
        .ok_or_else(|| Error::invalid("The `fields` key must contain an array of changes."))?;

    let mut changes = SchemaChanges::default();

    // Drops first, so re-adds of the same name can be classified.
    for entry in entries {
        let is_drop = entry.get("drop").and_then(|d| d.as_bool()).unwrap_or(false);
        if !is_drop {
            continue;
        }
        let name = entry
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| Error::invalid("A dropped field must have a `name`."))?;
        if !existing.iter().any(|f| f.name == name) {
            return Err(Error::not_found(format!(
                "Field `{}` is not part of the schema.",
                name
            )));
        }
        if entry.as_object().map(|o| o.len()).unwrap_or(0) > 2 {
            return Err(Error::invalid(format!(
                "Field `{}` is marked for deletion, so it cannot carry other properties.",
                name
            )));
        }
        changes.drops.push(name.to_string());
    }

    for entry in entries {
        let is_drop = entry.get("drop").and_then(|d| d.as_bool()).unwrap_or(false);
        if is_drop {
            continue;
        }
        let field: Field = serde_json::from_value(entry.clone())
            .map_err(|e| Error::invalid(format!("Invalid field record: {}", e)))?;
        field.validate()?;

        let dropped_here = changes.drops.iter().any(|d| d == &field.name);
        let already_declared = existing.iter().any(|f| f.name == field.name);
        if dropped_here {
            changes.reindexes.push(field);
        } else if already_declared {
            return Err(Error::invalid(format!(
                "Field `{}` is already part of the schema. To change it, drop it and \
                 re-add it in the same request.",
                field.name
            )));
        } else {
            changes.additions.push(field);
        }
    }

    if changes.is_empty() {
        return Err(Error::invalid("There are no schema changes to apply."));
    }

    Ok(changes)
}

/// Live observability for an in-flight (or recent) schema alteration.
///
/// The history ring buffer keeps the last [`ALTER_STATUS_MSG_COUNT`]
/// outcomes.
#[derive(Debug, Default)]
pub struct AlterStatus {
    in_progress: AtomicBool,
    validated_docs: AtomicU32,
    altered_docs: AtomicU32,
    history: Mutex<VecDeque<String>>,
}

/// Point-in-time copy of [`AlterStatus`] for the status endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AlterStatusSnapshot {
    pub alter_in_progress: bool,
    pub validated_docs: u32,
    pub altered_docs: u32,
    pub history: Vec<String>,
}

impl AlterStatus {
    /// Marks an alteration as started. Errors if one is already running.
    pub fn begin(&self) -> Result<()> {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return Err(Error::Conflict(
                "Another schema alteration is in progress.".to_string(),
            ));
        }
        self.validated_docs.store(0, Ordering::Relaxed);
        self.altered_docs.store(0, Ordering::Relaxed);
        Ok(())
    }

    pub fn record_validated(&self, count: u32) {
        self.validated_docs.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_altered(&self, count: u32) {
        self.altered_docs.fetch_add(count, Ordering::Relaxed);
    }

    /// Marks the alteration as finished and appends an outcome message.
    pub fn finish(&self, outcome: impl Into<String>) {
        let mut history = self.history.lock();
        if history.len() == ALTER_STATUS_MSG_COUNT {
            history.pop_front();
        }
        history.push_back(outcome.into());
        self.in_progress.store(false, Ordering::SeqCst);
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> AlterStatusSnapshot {
        AlterStatusSnapshot {
            alter_in_progress: self.in_progress.load(Ordering::SeqCst),
            validated_docs: self.validated_docs.load(Ordering::Relaxed),
            altered_docs: self.altered_docs.load(Ordering::Relaxed),
            history: self.history.lock().iter().cloned().collect(),
        }
    }
}
