//! Tunables for conflict detection, complexity estimation and the device
//! worker.
//!
//! The payload size ceiling and the position nudge factor are not here:
//! they are part of the wire contract and live as constants next to the
//! payload type.

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Thresholds used by `estimate_resolution_complexity`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplexityThresholds {
    /// Operation count at which a conflict is at least MEDIUM
    pub medium_operation_count: usize,
    /// Operation count at which a conflict counts double
    pub high_operation_count: usize,
    /// Total payload bytes at which a conflict is at least MEDIUM
    pub medium_payload_bytes: usize,
    /// Total payload bytes at which a conflict counts double
    pub high_payload_bytes: usize,
}

impl Default for ComplexityThresholds {
    fn default() -> Self {
        Self {
            medium_operation_count: 3,
            high_operation_count: 5,
            medium_payload_bytes: 4 * 1024,
            high_payload_bytes: 64 * 1024,
        }
    }
}

/// Configuration for the coordination and resolution services.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Two concurrent position-bearing operations closer than this are an
    /// ordering conflict even on different paths.
    pub position_conflict_distance: f64,

    pub complexity: ComplexityThresholds,

    /// Capacity of the command queue in front of each device worker
    pub worker_queue_depth: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            position_conflict_distance: 5.0,
            complexity: ComplexityThresholds::default(),
            worker_queue_depth: 64,
        }
    }
}

impl SyncConfig {
    /// Parse a config from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, SyncError> {
        let config: SyncConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if !self.position_conflict_distance.is_finite() || self.position_conflict_distance < 0.0 {
            return Err(SyncError::validation(
                "position_conflict_distance",
                "must be a finite, non-negative number",
            ));
        }
        if self.worker_queue_depth == 0 {
            return Err(SyncError::validation("worker_queue_depth", "must be at least 1"));
        }
        let c = &self.complexity;
        if c.high_operation_count < c.medium_operation_count
            || c.high_payload_bytes < c.medium_payload_bytes
        {
            return Err(SyncError::validation(
                "complexity",
                "high thresholds must not be below medium thresholds",
            ));
        }
        Ok(())
    }
}
