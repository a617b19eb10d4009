//! Status management utilities.
//!
//! Provides helpers for building status conditions and for turning a status
//! into the merge patch that writes it.

use serde_json::Value;

use crate::crd::{Condition, PdClusterStatus};

/// Builder for managing conditions list
///
/// Seeded with the current conditions. Setting a condition whose status did
/// not change keeps its last transition time.
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
}

impl ConditionBuilder {
    /// Create a builder starting from `existing`.
    pub fn from_existing(existing: &[Condition]) -> Self {
        Self {
            conditions: existing.to_vec(),
        }
    }

    /// Add or update a condition
    pub fn set(&mut self, mut condition: Condition) -> &mut Self {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
        self
    }

    /// Set Ready condition
    pub fn ready(
        &mut self,
        ready: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::ready(ready, reason, message, generation))
    }

    /// Set Progressing condition
    pub fn progressing(
        &mut self,
        progressing: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::progressing(
            progressing,
            reason,
            message,
            generation,
        ))
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Check if a condition type is true
pub fn is_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type)
        .is_some_and(|c| c.status == "True")
}

/// Set every key of `old` that is missing from `new` to null, recursing into
/// objects present on both sides. Arrays are replaced as a whole by a merge
/// patch and are left alone.
fn null_removed_keys(old: &Value, new: &mut Value) {
    let (Value::Object(old), Value::Object(new)) = (old, new) else {
        return;
    };
    for (key, old_value) in old {
        match new.get_mut(key) {
            Some(new_value) => null_removed_keys(old_value, new_value),
            None => {
                new.insert(key.clone(), Value::Null);
            }
        }
    }
}

/// JSON merge patch writing `new` over `old`.
///
/// Map entries dropped since `old` are deleted explicitly, so member maps
/// are replaced wholesale rather than merged.
pub fn status_merge_patch(
    old: Option<&PdClusterStatus>,
    new: &PdClusterStatus,
) -> Result<Value, serde_json::Error> {
    let mut status = serde_json::to_value(new)?;
    if let Some(old) = old {
        null_removed_keys(&serde_json::to_value(old)?, &mut status);
    }
    Ok(serde_json::json!({ "status": status }))
}
