//! Per-device replica state
//!
//! A `SyncState` is a value: every transition returns a new state and
//! leaves the input untouched. Content is tracked per slot (a target path,
//! or path plus key for metadata); each slot holds the operation that last
//! wrote it, plus the causally latest original operations that produced it.
//! When several of those are concurrent the slot's content is their merge,
//! and a later concurrent arrival is merged with them afresh, so the content
//! depends only on which operations were absorbed.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use super::clock::{LogicalTimestamp, VectorClock};
use super::conflict::Conflict;
use super::device::DeviceId;
use super::operation::{Operation, OperationId};
use super::payload::OperationPayload;
use super::resolution::{ConflictResolution, ResolutionMethod};
use crate::error::SyncError;

/// Snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// A conflict waiting for a `UserDecision`, with the operation whose
/// arrival raised it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingConflict {
    pub conflict: Conflict,
    pub incoming: Operation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    device_id: DeviceId,
    clock: VectorClock,
    last_sync: LogicalTimestamp,
    absorbed: BTreeSet<OperationId>,
    log: Vec<Operation>,
    slots: BTreeMap<String, Operation>,
    #[serde(default)]
    frontiers: BTreeMap<String, Vec<Operation>>,
    pending: BTreeMap<String, PendingConflict>,
    resolutions: Vec<ConflictResolution>,
}

impl SyncState {
    pub fn new(device_id: DeviceId) -> Self {
        let clock = VectorClock::for_device(&device_id);
        Self {
            last_sync: LogicalTimestamp::now(device_id.clone(), clock.clone()),
            device_id,
            clock,
            absorbed: BTreeSet::new(),
            log: Vec::new(),
            slots: BTreeMap::new(),
            frontiers: BTreeMap::new(),
            pending: BTreeMap::new(),
            resolutions: Vec::new(),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn vector_clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn last_sync(&self) -> &LogicalTimestamp {
        &self.last_sync
    }

    /// Operations written into slots, in the order this replica applied them
    pub fn applied_operations(&self) -> &[Operation] {
        &self.log
    }

    pub fn has_absorbed(&self, id: &OperationId) -> bool {
        self.absorbed.contains(id)
    }

    pub fn absorbed_count(&self) -> usize {
        self.absorbed.len()
    }

    /// The operation currently occupying a slot
    pub fn slot(&self, slot: &str) -> Option<&Operation> {
        self.slots.get(slot)
    }

    /// The causally latest operations behind a slot's content, in total
    /// order. One operation unless concurrent edits were merged; empty for a
    /// slot never written.
    pub fn frontier(&self, slot: &str) -> Vec<&Operation> {
        match self.frontiers.get(slot) {
            Some(ops) if !ops.is_empty() => ops.iter().collect(),
            _ => self.slots.get(slot).into_iter().collect(),
        }
    }

    /// Live content at a slot; `None` if never written or deleted
    pub fn content(&self, slot: &str) -> Option<&OperationPayload> {
        self.slots
            .get(slot)
            .filter(|op| !op.operation_type().is_delete())
            .map(|op| op.payload())
    }

    /// Every live slot and its content, in slot order
    pub fn live_content(&self) -> impl Iterator<Item = (&str, &OperationPayload)> {
        self.slots
            .iter()
            .filter(|(_, op)| !op.operation_type().is_delete())
            .map(|(slot, op)| (slot.as_str(), op.payload()))
    }

    pub fn pending_conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.pending.values().map(|p| &p.conflict)
    }

    pub fn pending_conflict(&self, conflict_id: &str) -> Option<&PendingConflict> {
        self.pending.get(conflict_id)
    }

    /// The pending conflict raised by this operation, if any
    pub fn pending_for(&self, id: &OperationId) -> Option<&PendingConflict> {
        self.pending.values().find(|p| p.incoming.id() == id)
    }

    pub fn resolutions(&self) -> &[ConflictResolution] {
        &self.resolutions
    }

    /// Clock for the next local operation
    pub fn next_clock(&self) -> Result<VectorClock, SyncError> {
        self.clock.increment_for_device(&self.device_id)
    }

    /// Digest of the replicated content: absorbed operations, clock and
    /// live slot contents. Excludes wall-clock time and local audit data, so
    /// replicas that absorbed the same operations agree.
    pub fn content_digest(&self) -> Result<String, SyncError> {
        let mut hasher = Sha256::new();
        for (device, counter) in self.clock.entries().filter(|(_, c)| *c > 0) {
            hasher.update(format!("{}={};", device, counter).as_bytes());
        }
        hasher.update(b"|");
        for id in &self.absorbed {
            hasher.update(id.as_str().as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(b"|");
        for (slot, op) in &self.slots {
            let payload = serde_json::to_string(&op.payload().to_json()?)?;
            hasher.update(format!("{}:{}:{};", slot, op.operation_type(), payload).as_bytes());
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Whether two replicas hold the same content
    pub fn converged_with(&self, other: &SyncState) -> bool {
        matches!(
            (self.content_digest(), other.content_digest()),
            (Ok(ours), Ok(theirs)) if ours == theirs
        )
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            version: SNAPSHOT_VERSION,
            state: self.clone(),
        }
    }

    // ---- transitions ----------------------------------------------------

    fn touched(mut self) -> Self {
        self.last_sync = LogicalTimestamp::now(self.device_id.clone(), self.clock.clone());
        self
    }

    /// Write an operation into its slot
    pub(crate) fn with_applied(&self, op: &Operation) -> SyncState {
        let mut next = self.clone();
        next.absorbed.insert(op.id().clone());
        next.clock = next.clock.merge(op.vector_clock());
        next.slots.insert(op.slot(), op.clone());
        next.frontiers.insert(op.slot(), vec![op.clone()]);
        next.log.push(op.clone());
        next.touched()
    }

    /// Record an operation already superseded by the slot's content
    pub(crate) fn with_stale(&self, op: &Operation) -> SyncState {
        let mut next = self.clone();
        next.absorbed.insert(op.id().clone());
        next.clock = next.clock.merge(op.vector_clock());
        next.touched()
    }

    /// Apply a resolution's outcome. `absorbed` is the operation whose
    /// arrival raised the conflict; `participants` are all the conflict's
    /// operations. An outcome never overwrites a slot that has since moved
    /// causally past it.
    ///
    /// After an automatic merge the participants become the slot's frontier;
    /// a manual outcome replaces it.
    pub(crate) fn with_resolution(
        &self,
        absorbed: &OperationId,
        participants: &[Operation],
        resolution: &ConflictResolution,
    ) -> SyncState {
        let mut next = self.clone();
        next.absorbed.insert(absorbed.clone());
        for op in participants {
            next.clock = next.clock.merge(op.vector_clock());
        }
        for op in &resolution.outcome {
            let slot = op.slot();
            let superseded = next
                .slots
                .get(&slot)
                .map(|current| current.vector_clock().happens_after(op.vector_clock()))
                .unwrap_or(false);
            if superseded {
                log::debug!("Slot {} moved past resolution {}", slot, resolution.conflict_id);
                continue;
            }
            let frontier = match resolution.method {
                ResolutionMethod::Automatic { .. } => {
                    let mut merged: Vec<Operation> = participants
                        .iter()
                        .filter(|p| p.slot() == slot)
                        .cloned()
                        .collect();
                    merged.sort_by(|a, b| a.total_cmp(b));
                    if merged.is_empty() {
                        vec![op.clone()]
                    } else {
                        merged
                    }
                }
                ResolutionMethod::Manual { .. } => vec![op.clone()],
            };
            next.frontiers.insert(slot.clone(), frontier);
            next.slots.insert(slot, op.clone());
            next.log.push(op.clone());
        }
        next.pending.remove(&resolution.conflict_id);
        next.resolutions.push(resolution.clone());
        next.touched()
    }

    /// Park a conflict for manual resolution. The incoming operation is not
    /// absorbed and the clock does not advance.
    pub(crate) fn with_escalation(&self, pending: PendingConflict) -> SyncState {
        let mut next = self.clone();
        next.pending.insert(pending.conflict.id().to_string(), pending);
        next.touched()
    }
}

/// Serializable snapshot of a replica, for persistence or hand-off
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub version: u32,
    pub state: SyncState,
}

impl SyncSnapshot {
    pub fn restore(self) -> Result<SyncState, SyncError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(SyncError::Serialization(format!(
                "unsupported snapshot version {} (expected {})",
                self.version, SNAPSHOT_VERSION
            )));
        }
        Ok(self.state)
    }

    pub fn to_json(&self) -> Result<String, SyncError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, SyncError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>, SyncError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_cbor(data: &[u8]) -> Result<Self, SyncError> {
        ciborium::from_reader(data).map_err(|e| SyncError::Serialization(e.to_string()))
    }
}
