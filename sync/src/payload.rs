//! Wire-neutral sync payloads

use enginelink_core::{BridgeError, BridgeResult, StateId, Value, Version};
use serde::{Deserialize, Serialize};

use crate::patch::{apply_operations, Operation};

/// Change set sent to a subscriber
///
/// Carries either the complete document (`full_state`) or the operations that
/// advance `base_version` to `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    pub state_id: StateId,
    pub version: Version,
    /// Version the delta applies to; `None` for full payloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<Version>,
    pub full_state: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<Vec<Operation>>,
}

impl SyncPayload {
    pub fn full(state_id: impl Into<StateId>, version: Version, data: Value) -> Self {
        Self {
            state_id: state_id.into(),
            version,
            base_version: None,
            full_state: true,
            data: Some(data),
            delta: None,
        }
    }

    pub fn delta(
        state_id: impl Into<StateId>,
        base_version: Version,
        version: Version,
        operations: Vec<Operation>,
    ) -> Self {
        Self {
            state_id: state_id.into(),
            version,
            base_version: Some(base_version),
            full_state: false,
            data: None,
            delta: Some(operations),
        }
    }

    /// Number of operations in a delta payload
    pub fn operation_count(&self) -> usize {
        self.delta.as_ref().map_or(0, |ops| ops.len())
    }

    /// Reconstruct the document this payload describes
    ///
    /// `base` is the receiver's copy at `base_version`; it is ignored for full
    /// payloads.
    pub fn apply_to(&self, base: &Value) -> BridgeResult<Value> {
        if self.full_state {
            return self.data.clone().ok_or_else(|| {
                BridgeError::InvalidOperation(format!(
                    "full payload for {} carries no data",
                    self.state_id
                ))
            });
        }

        let ops = self.delta.as_deref().unwrap_or_default();
        let mut doc = base.clone();
        apply_operations(&mut doc, ops)?;
        Ok(doc)
    }

    pub fn to_json(&self) -> BridgeResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> BridgeResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Inbound patch request
///
/// `version` is the version the sender believes is current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationsPayload {
    pub state_id: StateId,
    pub version: Version,
    pub operations: Vec<Operation>,
}

impl OperationsPayload {
    pub fn new(state_id: impl Into<StateId>, version: Version, operations: Vec<Operation>) -> Self {
        Self {
            state_id: state_id.into(),
            version,
            operations,
        }
    }
}
