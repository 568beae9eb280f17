//! Conflict resolution
//!
//! A conflict moves through detected → automatic attempt → resolved, or
//! detected → escalated → manual decision → resolved. Automatic resolution
//! is keyed by the conflict type; semantic conflicts always escalate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::clock::VectorClock;
use super::conflict::{Conflict, ConflictType};
use super::operation::{Operation, OperationId};
use super::payload::{OperationPayload, TransformStrategy};
use crate::config::SyncConfig;
use crate::error::SyncError;

/// How much effort a conflict is likely to need
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionComplexity {
    Low,
    Medium,
    High,
}

/// An explicit decision supplied by a person or an external policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserDecision {
    /// Keep one of the conflicting operations and drop the rest
    KeepOperation {
        #[serde(rename = "operationId")]
        operation_id: OperationId,
    },
    /// Replace the conflicting edits with hand-merged data, validated
    /// against the winning operation's type
    CustomMerge { data: Value },
    /// Drop the incoming edits and keep the current content
    RejectAll,
}

impl UserDecision {
    /// Parse the (kind, payload) form used by the UI layer
    pub fn from_parts(kind: &str, payload: &Value) -> Result<Self, SyncError> {
        match kind {
            "KEEP_OPERATION" => {
                let id = payload
                    .get("operationId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        SyncError::InvalidDecision("KEEP_OPERATION requires an operationId".into())
                    })?;
                Ok(UserDecision::KeepOperation {
                    operation_id: OperationId::new(id)
                        .map_err(|e| SyncError::InvalidDecision(e.to_string()))?,
                })
            }
            "CUSTOM_MERGE" => match payload {
                Value::Object(_) => Ok(UserDecision::CustomMerge {
                    data: payload.clone(),
                }),
                _ => Err(SyncError::InvalidDecision(
                    "CUSTOM_MERGE requires an object payload".into(),
                )),
            },
            "REJECT_ALL" => Ok(UserDecision::RejectAll),
            other => Err(SyncError::InvalidDecision(format!(
                "unknown decision kind '{}'",
                other
            ))),
        }
    }

    pub fn custom_merge(payload: &OperationPayload) -> Result<Self, SyncError> {
        Ok(UserDecision::CustomMerge {
            data: payload.to_json()?,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UserDecision::KeepOperation { .. } => "KEEP_OPERATION",
            UserDecision::CustomMerge { .. } => "CUSTOM_MERGE",
            UserDecision::RejectAll => "REJECT_ALL",
        }
    }
}

/// How a conflict was settled; kept for audit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionMethod {
    Automatic { strategy: String },
    Manual { decision: UserDecision },
}

/// The result of resolving a conflict.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub conflict_id: String,
    pub conflict_type: ConflictType,
    pub target_path: String,
    pub method: ResolutionMethod,
    /// Operations to apply in place of the conflicting ones, one per slot.
    /// Empty when the decision keeps the current content.
    pub outcome: Vec<Operation>,
    /// Every operation the outcome replaces
    pub superseded: Vec<OperationId>,
    pub resolved_at: DateTime<Utc>,
}

const PAIRWISE_TRANSFORM: &str = "PAIRWISE_TRANSFORM";

/// Resolves conflicts automatically or from a user decision.
///
/// Stateless apart from its config; safe to share between device workers.
#[derive(Clone, Debug, Default)]
pub struct ConflictResolutionService {
    config: SyncConfig,
}

impl ConflictResolutionService {
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Try to settle a conflict without human input.
    ///
    /// Semantic and custom conflicts return `RequiresManualResolution`. A
    /// merge that cannot produce valid data returns `TransformationFailure`,
    /// which callers escalate the same way.
    pub fn resolve_conflict_automatically(
        &self,
        conflict: &Conflict,
    ) -> Result<ConflictResolution, SyncError> {
        let (strategy, outcome) = match conflict.conflict_type() {
            ConflictType::ConcurrentModification => {
                (PAIRWISE_TRANSFORM, self.transform_by_slot(conflict)?)
            }
            ConflictType::OrderingConflict => {
                let resolved = self.transform_by_slot(conflict)?;
                (PAIRWISE_TRANSFORM, separate_positions(resolved)?)
            }
            ConflictType::StructuralConflict => (
                TransformStrategy::ContentMerge.name(),
                self.content_merge_by_slot(conflict)?,
            ),
            ConflictType::SemanticConflict => {
                return Err(SyncError::RequiresManualResolution {
                    conflict_id: conflict.id().to_string(),
                    reason: "semantic conflicts cannot be merged mechanically".into(),
                });
            }
            ConflictType::Custom(name) => {
                return Err(SyncError::RequiresManualResolution {
                    conflict_id: conflict.id().to_string(),
                    reason: format!("no automatic strategy for custom conflict '{}'", name),
                });
            }
        };

        log::info!(
            "Resolved {} conflict {} at {} with {} ({} operations -> {})",
            conflict.conflict_type(),
            conflict.id(),
            conflict.target_path(),
            strategy,
            conflict.operations().len(),
            outcome.len()
        );

        Ok(ConflictResolution {
            conflict_id: conflict.id().to_string(),
            conflict_type: conflict.conflict_type().clone(),
            target_path: conflict.target_path().to_string(),
            method: ResolutionMethod::Automatic {
                strategy: strategy.to_string(),
            },
            outcome,
            superseded: conflict.operation_ids(),
            resolved_at: Utc::now(),
        })
    }

    /// Settle a conflict with an explicit decision. Succeeds for any
    /// well-formed decision, whatever the conflict type.
    pub fn resolve_conflict_with_user_input(
        &self,
        conflict: &Conflict,
        decision: UserDecision,
    ) -> Result<ConflictResolution, SyncError> {
        let winner = conflict
            .latest_operation()
            .ok_or(SyncError::InsufficientOperations(0))?;
        let clock = merged_clock(conflict.operations().iter());
        let resolved_id = OperationId::new(format!("{}-resolved", conflict.id()))?;

        let outcome = match &decision {
            UserDecision::KeepOperation { operation_id } => {
                let kept = conflict
                    .operations()
                    .iter()
                    .find(|op| op.id() == operation_id)
                    .ok_or_else(|| {
                        SyncError::InvalidDecision(format!(
                            "operation {} is not part of conflict {}",
                            operation_id,
                            conflict.id()
                        ))
                    })?;
                vec![Operation::create(
                    resolved_id,
                    kept.device_id().clone(),
                    kept.operation_type(),
                    kept.target_path(),
                    kept.payload().clone(),
                    clock,
                )?]
            }
            UserDecision::CustomMerge { data } => {
                let payload = OperationPayload::create(data.clone(), winner.operation_type())
                    .map_err(|e| SyncError::InvalidDecision(e.to_string()))?;
                vec![Operation::create(
                    resolved_id,
                    winner.device_id().clone(),
                    winner.operation_type(),
                    winner.target_path(),
                    payload,
                    clock,
                )?]
            }
            UserDecision::RejectAll => Vec::new(),
        };

        log::info!(
            "Conflict {} at {} resolved manually: {}",
            conflict.id(),
            conflict.target_path(),
            decision.kind()
        );

        Ok(ConflictResolution {
            conflict_id: conflict.id().to_string(),
            conflict_type: conflict.conflict_type().clone(),
            target_path: conflict.target_path().to_string(),
            method: ResolutionMethod::Manual { decision },
            outcome,
            superseded: conflict.operation_ids(),
            resolved_at: Utc::now(),
        })
    }

    /// Heuristic used to decide whether to ask a person before trying the
    /// automatic path.
    pub fn estimate_resolution_complexity(&self, conflict: &Conflict) -> ResolutionComplexity {
        if *conflict.conflict_type() == ConflictType::SemanticConflict {
            return ResolutionComplexity::High;
        }
        let thresholds = &self.config.complexity;
        let mut score = 0;

        let count = conflict.operations().len();
        if count >= thresholds.high_operation_count {
            score += 2;
        } else if count >= thresholds.medium_operation_count {
            score += 1;
        }

        let size = conflict.total_payload_size();
        if size >= thresholds.high_payload_bytes {
            score += 2;
        } else if size >= thresholds.medium_payload_bytes {
            score += 1;
        }

        if matches!(
            conflict.conflict_type(),
            ConflictType::StructuralConflict | ConflictType::Custom(_)
        ) {
            score += 1;
        }

        match score {
            0 => ResolutionComplexity::Low,
            1 | 2 => ResolutionComplexity::Medium,
            _ => ResolutionComplexity::High,
        }
    }

    /// Fold `transform_with` over each slot's operations in total order.
    /// The last transformed operation carries everything merged before it.
    fn transform_by_slot(&self, conflict: &Conflict) -> Result<Vec<Operation>, SyncError> {
        let mut outcome = Vec::new();
        for group in group_by_slot(conflict).into_values() {
            let mut acc = group[0].clone();
            for next in &group[1..] {
                let (_, next_transformed) = acc.transform_with(next)?;
                acc = next_transformed;
            }
            outcome.push(settle(&group, acc.payload().clone())?);
        }
        outcome.sort_by(|a, b| a.total_cmp(b));
        Ok(outcome)
    }

    /// Union every payload's fields in total order (later wins) and
    /// validate the result against the winning operation's type.
    fn content_merge_by_slot(&self, conflict: &Conflict) -> Result<Vec<Operation>, SyncError> {
        let mut outcome = Vec::new();
        for group in group_by_slot(conflict).into_values() {
            let mut merged = Map::new();
            for op in &group {
                if let Value::Object(fields) = op.payload().to_json()? {
                    merged.extend(fields);
                }
            }
            let winner = group[group.len() - 1];
            let payload = OperationPayload::create(Value::Object(merged), winner.operation_type())
                .map_err(|e| {
                    SyncError::TransformationFailure(format!(
                        "merged shape is invalid for {}: {}",
                        winner.operation_type(),
                        e
                    ))
                })?;
            outcome.push(settle(&group, payload)?);
        }
        outcome.sort_by(|a, b| a.total_cmp(b));
        Ok(outcome)
    }
}

/// Operations grouped by slot, each group sorted by the total order
fn group_by_slot(conflict: &Conflict) -> BTreeMap<String, Vec<&Operation>> {
    let mut groups: BTreeMap<String, Vec<&Operation>> = BTreeMap::new();
    for op in conflict.ordered_operations() {
        groups.entry(op.slot()).or_default().push(op);
    }
    groups
}

fn merged_clock<'a>(ops: impl Iterator<Item = &'a Operation>) -> VectorClock {
    ops.fold(VectorClock::new(), |acc, op| acc.merge(op.vector_clock()))
}

/// Build the single operation standing in for a slot's group. A lone
/// operation stands for itself; otherwise the result takes the winner's
/// identity fields, a deterministic id and the merged clock.
fn settle(group: &[&Operation], payload: OperationPayload) -> Result<Operation, SyncError> {
    let winner = group[group.len() - 1];
    if group.len() == 1 {
        return Ok(winner.with_payload(payload));
    }
    let owned: Vec<Operation> = group.iter().map(|op| (*op).clone()).collect();
    Operation::create(
        OperationId::new(format!("{}-resolved", Conflict::derive_id(&owned)))?,
        winner.device_id().clone(),
        winner.operation_type(),
        winner.target_path(),
        payload,
        merged_clock(group.iter().copied()),
    )
}

/// Nudge position-bearing outcomes on different slots apart, each by the
/// one before it in total order.
fn separate_positions(outcome: Vec<Operation>) -> Result<Vec<Operation>, SyncError> {
    let mut separated: Vec<Operation> = Vec::with_capacity(outcome.len());
    for op in outcome {
        let moved = match separated.last() {
            Some(prev) if prev.payload().position_value().is_some() => {
                let payload = op
                    .payload()
                    .transform_with_strategy(prev.payload(), TransformStrategy::PositionOffset)?;
                op.with_payload(payload)
            }
            _ => op,
        };
        separated.push(moved);
    }
    Ok(separated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergent::device::DeviceId;
    use crate::convergent::operation::OperationType;
    use crate::convergent::payload::Position;
    use serde_json::json;

    fn dev(id: &str) -> DeviceId {
        DeviceId::new(id).unwrap()
    }

    fn clock(entries: &[(&str, i64)]) -> VectorClock {
        VectorClock::from_map(entries.iter().copied()).unwrap()
    }

    fn op(
        id: &str,
        device: &str,
        operation_type: OperationType,
        path: &str,
        payload: OperationPayload,
        c: VectorClock,
    ) -> Operation {
        Operation::create(OperationId::new(id).unwrap(), dev(device), operation_type, path, payload, c)
            .unwrap()
    }

    fn hello_world() -> (Operation, Operation) {
        let a = op(
            "a",
            "A",
            OperationType::CreateStatement,
            "/statements/s1",
            OperationPayload::statement("s1", "Hello").unwrap(),
            clock(&[("A", 1)]),
        );
        let b = op(
            "b",
            "B",
            OperationType::CreateStatement,
            "/statements/s1",
            OperationPayload::statement("s1", "World").unwrap(),
            clock(&[("A", 0), ("B", 1)]),
        );
        (a, b)
    }

    fn conflict_of(conflict_type: ConflictType, ops: Vec<Operation>) -> Conflict {
        let path = ops[0].target_path().to_string();
        Conflict::create(Conflict::derive_id(&ops), conflict_type, path, ops).unwrap()
    }

    #[test]
    fn test_concurrent_modification_merges_deterministically() {
        let service = ConflictResolutionService::default();
        let (a, b) = hello_world();

        let forward = service
            .resolve_conflict_automatically(&conflict_of(
                ConflictType::concurrent_modification(),
                vec![a.clone(), b.clone()],
            ))
            .unwrap();
        let backward = service
            .resolve_conflict_automatically(&conflict_of(
                ConflictType::concurrent_modification(),
                vec![b, a],
            ))
            .unwrap();

        assert_eq!(forward.outcome.len(), 1);
        assert_eq!(forward.outcome, backward.outcome);
        let resolved = &forward.outcome[0];
        assert_eq!(resolved.payload(), &OperationPayload::statement("s1", "World").unwrap());
        assert_eq!(resolved.vector_clock(), &clock(&[("A", 1), ("B", 1)]));
        assert_eq!(resolved.device_id().as_str(), "B");
        assert_eq!(forward.superseded.len(), 2);
    }

    #[test]
    fn test_semantic_conflict_needs_a_person() {
        let service = ConflictResolutionService::default();
        let (a, b) = hello_world();
        let conflict = conflict_of(ConflictType::semantic_conflict(), vec![a.clone(), b]);

        let err = service.resolve_conflict_automatically(&conflict).unwrap_err();
        assert!(matches!(err, SyncError::RequiresManualResolution { .. }));
        assert!(err.is_escalation());

        let resolution = service
            .resolve_conflict_with_user_input(
                &conflict,
                UserDecision::KeepOperation {
                    operation_id: a.id().clone(),
                },
            )
            .unwrap();
        assert_eq!(resolution.outcome[0].payload(), a.payload());
        assert!(matches!(resolution.method, ResolutionMethod::Manual { .. }));
    }

    #[test]
    fn test_custom_conflict_escalates() {
        let service = ConflictResolutionService::default();
        let (a, b) = hello_world();
        let conflict = conflict_of(ConflictType::custom("citation-loop").unwrap(), vec![a, b]);
        assert!(matches!(
            service.resolve_conflict_automatically(&conflict),
            Err(SyncError::RequiresManualResolution { .. })
        ));
    }

    #[test]
    fn test_user_decisions() {
        let service = ConflictResolutionService::default();
        let (a, b) = hello_world();
        let conflict = conflict_of(ConflictType::semantic_conflict(), vec![a, b]);

        let merge = UserDecision::from_parts("CUSTOM_MERGE", &json!({"id": "s1", "content": "Hello World"}))
            .unwrap();
        let resolution = service.resolve_conflict_with_user_input(&conflict, merge).unwrap();
        assert_eq!(
            resolution.outcome[0].payload(),
            &OperationPayload::statement("s1", "Hello World").unwrap()
        );

        let reject = UserDecision::from_parts("REJECT_ALL", &Value::Null).unwrap();
        let resolution = service.resolve_conflict_with_user_input(&conflict, reject).unwrap();
        assert!(resolution.outcome.is_empty());

        let stranger = UserDecision::KeepOperation {
            operation_id: OperationId::new("zzz").unwrap(),
        };
        assert!(matches!(
            service.resolve_conflict_with_user_input(&conflict, stranger),
            Err(SyncError::InvalidDecision(_))
        ));

        let bad_merge = UserDecision::from_parts("CUSTOM_MERGE", &json!({"id": "s1"})).unwrap();
        assert!(matches!(
            service.resolve_conflict_with_user_input(&conflict, bad_merge),
            Err(SyncError::InvalidDecision(_))
        ));

        assert!(UserDecision::from_parts("FLIP_A_COIN", &Value::Null).is_err());
        assert!(UserDecision::from_parts("KEEP_OPERATION", &json!({})).is_err());
    }

    #[test]
    fn test_structural_conflict_merges_content() {
        let service = ConflictResolutionService::default();
        let delete = op(
            "d",
            "A",
            OperationType::DeleteStatement,
            "/statements/s1",
            OperationPayload::create_empty(),
            clock(&[("A", 1)]),
        );
        let edit = op(
            "e",
            "B",
            OperationType::UpdateStatement,
            "/statements/s1",
            OperationPayload::statement("s1", "Kept").unwrap(),
            clock(&[("B", 1)]),
        );
        let resolution = service
            .resolve_conflict_automatically(&conflict_of(
                ConflictType::structural_conflict(),
                vec![delete.clone(), edit.clone()],
            ))
            .unwrap();
        assert_eq!(resolution.outcome.len(), 1);
        assert_eq!(resolution.outcome[0].operation_type(), OperationType::UpdateStatement);
        assert_eq!(resolution.outcome[0].payload(), edit.payload());

        // A later delete wins and removes the element
        let late_delete = op(
            "f",
            "C",
            OperationType::DeleteStatement,
            "/statements/s1",
            OperationPayload::create_empty(),
            clock(&[("C", 1)]),
        );
        let resolution = service
            .resolve_conflict_automatically(&conflict_of(
                ConflictType::structural_conflict(),
                vec![edit, late_delete],
            ))
            .unwrap();
        assert!(resolution.outcome[0].operation_type().is_delete());
    }

    #[test]
    fn test_ordering_conflict_separates_positions() {
        let service = ConflictResolutionService::default();
        let a = op(
            "a",
            "A",
            OperationType::UpdateTreePosition,
            "/trees/t1",
            OperationPayload::position(Position::new(10.0, 10.0)).unwrap(),
            clock(&[("A", 1)]),
        );
        let b = op(
            "b",
            "B",
            OperationType::UpdateTreePosition,
            "/trees/t2",
            OperationPayload::position(Position::new(10.0, 10.0)).unwrap(),
            clock(&[("B", 1)]),
        );
        let resolution = service
            .resolve_conflict_automatically(&conflict_of(ConflictType::ordering_conflict(), vec![a, b]))
            .unwrap();
        assert_eq!(resolution.outcome.len(), 2);
        let first = resolution.outcome[0].payload().position_value().unwrap();
        let second = resolution.outcome[1].payload().position_value().unwrap();
        assert!(first.distance_to(second) > 0.0);
    }

    #[test]
    fn test_complexity_estimate() {
        let service = ConflictResolutionService::default();
        let (a, b) = hello_world();

        let simple = conflict_of(ConflictType::concurrent_modification(), vec![a.clone(), b.clone()]);
        assert_eq!(service.estimate_resolution_complexity(&simple), ResolutionComplexity::Low);

        let semantic = conflict_of(ConflictType::semantic_conflict(), vec![a.clone(), b.clone()]);
        assert_eq!(service.estimate_resolution_complexity(&semantic), ResolutionComplexity::High);

        let structural = conflict_of(ConflictType::structural_conflict(), vec![a.clone(), b.clone()]);
        assert_eq!(
            service.estimate_resolution_complexity(&structural),
            ResolutionComplexity::Medium
        );

        let crowd: Vec<Operation> = (0..5)
            .map(|i| {
                let device = format!("D{}", i);
                op(
                    &format!("op{}", i),
                    &device,
                    OperationType::UpdateStatement,
                    "/statements/s1",
                    OperationPayload::statement("s1", "x".repeat(70 * 1024)).unwrap(),
                    clock(&[(device.as_str(), 1)]),
                )
            })
            .collect();
        let crowded = conflict_of(ConflictType::concurrent_modification(), crowd);
        assert_eq!(service.estimate_resolution_complexity(&crowded), ResolutionComplexity::High);
    }
}
