//! Applying operations to a replica
//!
//! `OperationCoordinationService` decides, per incoming operation, whether
//! it is a duplicate, stale, a clean apply, or a conflict with the
//! operations behind the slot's current content. Conflicts are classified
//! and handed to the resolution service; the ones it cannot settle are
//! parked on the state.

use std::collections::{BTreeMap, BTreeSet};

use super::conflict::{Conflict, ConflictType};
use super::operation::{Operation, OperationId, OperationType};
use super::payload::OperationPayload;
use super::resolution::{ConflictResolution, ConflictResolutionService, UserDecision};
use super::state::{PendingConflict, SyncState};
use crate::config::SyncConfig;
use crate::error::SyncError;

/// What happened to an operation handed to `apply_operation`
#[derive(Clone, Debug, PartialEq)]
pub enum Disposition {
    /// Written into an empty or causally older slot
    Applied,
    /// Concurrent with the slot's content and merged automatically
    Resolved(ConflictResolution),
    /// Already superseded by the slot's content; absorbed without effect
    Stale,
    /// Seen before; the state is unchanged
    Duplicate,
    /// Concurrent and not mergeable; waiting for a `UserDecision`
    Escalated(Conflict),
}

/// The next state and how the operation was handled
#[derive(Clone, Debug)]
pub struct ApplyOutcome {
    pub state: SyncState,
    pub disposition: Disposition,
}

impl ApplyOutcome {
    fn new(state: SyncState, disposition: Disposition) -> Self {
        Self { state, disposition }
    }
}

#[derive(Clone, Debug, Default)]
pub struct OperationCoordinationService {
    config: SyncConfig,
    resolver: ConflictResolutionService,
}

impl OperationCoordinationService {
    /// Build a service around a validated config
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        Ok(Self {
            resolver: ConflictResolutionService::new(config.clone())?,
            config,
        })
    }

    pub fn resolver(&self) -> &ConflictResolutionService {
        &self.resolver
    }

    /// Apply a local or remote operation to a replica.
    ///
    /// Errors only for failures unrelated to the conflict itself; a conflict
    /// that needs a person comes back as `Disposition::Escalated`.
    pub fn apply_operation(
        &self,
        op: &Operation,
        state: &SyncState,
    ) -> Result<ApplyOutcome, SyncError> {
        if state.has_absorbed(op.id()) {
            log::debug!("{}: duplicate operation {}", state.device_id(), op.id());
            return Ok(ApplyOutcome::new(state.clone(), Disposition::Duplicate));
        }
        if let Some(pending) = state.pending_for(op.id()) {
            log::debug!(
                "{}: operation {} is already waiting on conflict {}",
                state.device_id(),
                op.id(),
                pending.conflict.id()
            );
            return Ok(ApplyOutcome::new(
                state.clone(),
                Disposition::Escalated(pending.conflict.clone()),
            ));
        }

        let slot = op.slot();
        let frontier = state.frontier(&slot);
        if frontier.is_empty() {
            log::debug!("{}: applied {} to empty slot {}", state.device_id(), op.id(), slot);
            return Ok(ApplyOutcome::new(state.with_applied(op), Disposition::Applied));
        }
        if frontier
            .iter()
            .any(|current| op.vector_clock().happens_before(current.vector_clock()))
        {
            log::debug!(
                "{}: {} is older than the content of {}",
                state.device_id(),
                op.id(),
                slot
            );
            return Ok(ApplyOutcome::new(state.with_stale(op), Disposition::Stale));
        }

        // Whatever the operation has not seen stays in play
        let concurrent: Vec<Operation> = frontier
            .into_iter()
            .filter(|current| !op.vector_clock().happens_after(current.vector_clock()))
            .cloned()
            .collect();
        if concurrent.is_empty() {
            log::debug!("{}: applied {} to {}", state.device_id(), op.id(), slot);
            return Ok(ApplyOutcome::new(state.with_applied(op), Disposition::Applied));
        }
        self.settle_conflict(concurrent, op, state)
    }

    /// Merge an operation with every concurrent original on its slot. The
    /// fold always starts from the originals, never from an earlier merge,
    /// so the result does not depend on arrival order.
    fn settle_conflict(
        &self,
        concurrent: Vec<Operation>,
        incoming: &Operation,
        state: &SyncState,
    ) -> Result<ApplyOutcome, SyncError> {
        let mut operations = concurrent;
        operations.push(incoming.clone());
        operations.sort_by(|a, b| a.total_cmp(b));
        let conflict_type = self.classify(&operations.iter().collect::<Vec<_>>());
        let conflict = Conflict::create(
            Conflict::derive_id(&operations),
            conflict_type,
            incoming.target_path(),
            operations,
        )?;
        log::debug!(
            "{}: {} conflict {} at {}",
            state.device_id(),
            conflict.conflict_type(),
            conflict.id(),
            conflict.target_path()
        );

        match self.resolver.resolve_conflict_automatically(&conflict) {
            Ok(resolution) => {
                let next = state.with_resolution(incoming.id(), conflict.operations(), &resolution);
                Ok(ApplyOutcome::new(next, Disposition::Resolved(resolution)))
            }
            Err(e) if e.is_escalation() => {
                log::warn!(
                    "{}: escalating conflict {} at {}: {}",
                    state.device_id(),
                    conflict.id(),
                    conflict.target_path(),
                    e
                );
                let next = state.with_escalation(PendingConflict {
                    conflict: conflict.clone(),
                    incoming: incoming.clone(),
                });
                Ok(ApplyOutcome::new(next, Disposition::Escalated(conflict)))
            }
            Err(e) => Err(e),
        }
    }

    /// Settle a parked conflict with an explicit decision
    pub fn resolve_pending(
        &self,
        conflict_id: &str,
        decision: UserDecision,
        state: &SyncState,
    ) -> Result<ApplyOutcome, SyncError> {
        let pending = state
            .pending_conflict(conflict_id)
            .ok_or_else(|| SyncError::ConflictNotFound(conflict_id.to_string()))?;
        let resolution = self
            .resolver
            .resolve_conflict_with_user_input(&pending.conflict, decision)?;
        let next = state.with_resolution(
            pending.incoming.id(),
            pending.conflict.operations(),
            &resolution,
        );
        Ok(ApplyOutcome::new(next, Disposition::Resolved(resolution)))
    }

    /// Stamp a local edit with the replica's next clock and apply it.
    ///
    /// Returns the operation to broadcast along with the outcome.
    pub fn issue_local_operation(
        &self,
        state: &SyncState,
        operation_type: OperationType,
        target_path: &str,
        payload: OperationPayload,
    ) -> Result<(Operation, ApplyOutcome), SyncError> {
        let op = Operation::create(
            OperationId::generate(),
            state.device_id().clone(),
            operation_type,
            target_path,
            payload,
            state.next_clock()?,
        )?;
        let outcome = self.apply_operation(&op, state)?;
        Ok((op, outcome))
    }

    /// Find every conflict in a batch of operations without applying them.
    ///
    /// Concurrent operations on the same slot form one conflict per slot.
    /// Concurrent position-bearing operations on different paths closer
    /// than `position_conflict_distance` form an ordering conflict per pair.
    pub fn detect_conflicts(&self, operations: &[Operation]) -> Vec<Conflict> {
        let mut by_slot: BTreeMap<String, Vec<&Operation>> = BTreeMap::new();
        let mut seen = BTreeSet::new();
        for op in operations {
            if seen.insert(op.id()) {
                by_slot.entry(op.slot()).or_default().push(op);
            }
        }

        let mut conflicts = Vec::new();
        for (slot, ops) in &by_slot {
            let involved: Vec<&Operation> = ops
                .iter()
                .filter(|a| ops.iter().any(|b| a.id() != b.id() && a.is_concurrent_with(b)))
                .copied()
                .collect();
            if involved.len() < 2 {
                continue;
            }
            let conflict_type = self.classify(&involved);
            let owned: Vec<Operation> = involved.into_iter().cloned().collect();
            let path = owned[0].target_path().to_string();
            match Conflict::create(Conflict::derive_id(&owned), conflict_type, path, owned) {
                Ok(conflict) => conflicts.push(conflict),
                Err(e) => log::warn!("Skipping conflict at {}: {}", slot, e),
            }
        }

        let positioned: Vec<&Operation> = by_slot
            .values()
            .flatten()
            .copied()
            .filter(|op| op.payload().position_value().is_some())
            .collect();
        for (i, a) in positioned.iter().enumerate() {
            for b in &positioned[i + 1..] {
                if a.target_path() == b.target_path() || !a.is_concurrent_with(b) {
                    continue;
                }
                let (Some(pa), Some(pb)) = (a.payload().position_value(), b.payload().position_value())
                else {
                    continue;
                };
                if pa.distance_to(pb) >= self.config.position_conflict_distance {
                    continue;
                }
                let mut pair = vec![(*a).clone(), (*b).clone()];
                pair.sort_by(|x, y| x.total_cmp(y));
                let path = pair[0].target_path().to_string();
                match Conflict::create(
                    Conflict::derive_id(&pair),
                    ConflictType::ordering_conflict(),
                    path,
                    pair,
                ) {
                    Ok(conflict) => conflicts.push(conflict),
                    Err(e) => log::warn!("Skipping ordering conflict: {}", e),
                }
            }
        }

        conflicts.sort_by(|a, b| a.id().cmp(b.id()));
        log::debug!("Detected {} conflicts among {} operations", conflicts.len(), seen.len());
        conflicts
    }

    /// Classify a set of concurrent operations.
    ///
    /// A delete racing an edit is structural; all position-bearing is
    /// ordering; edits to different element families are semantic;
    /// everything else is a concurrent modification.
    pub fn classify(&self, operations: &[&Operation]) -> ConflictType {
        let deletes = operations
            .iter()
            .filter(|op| op.operation_type().is_delete())
            .count();
        if deletes > 0 && deletes < operations.len() {
            return ConflictType::structural_conflict();
        }
        if operations
            .iter()
            .all(|op| op.payload().position_value().is_some())
        {
            return ConflictType::ordering_conflict();
        }
        let mut families = operations.iter().map(|op| op.operation_type().element());
        if let Some(first) = families.next() {
            if families.any(|family| family != first) {
                return ConflictType::semantic_conflict();
            }
        }
        ConflictType::concurrent_modification()
    }
}
