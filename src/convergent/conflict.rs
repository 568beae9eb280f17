//! Conflicts between concurrent operations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use super::operation::{Operation, OperationId};
use crate::error::SyncError;

/// Why two or more operations cannot trivially co-apply.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ConflictType {
    /// Concurrent edits of the same element
    ConcurrentModification,
    /// Concurrent placements that collide spatially or in sequence
    OrderingConflict,
    /// Edits whose meaning clashes; never merged mechanically
    SemanticConflict,
    /// An edit racing a delete of the same element
    StructuralConflict,
    Custom(String),
}

const CUSTOM_PREFIX: &str = "custom:";

impl ConflictType {
    pub fn concurrent_modification() -> Self {
        ConflictType::ConcurrentModification
    }

    pub fn ordering_conflict() -> Self {
        ConflictType::OrderingConflict
    }

    pub fn semantic_conflict() -> Self {
        ConflictType::SemanticConflict
    }

    pub fn structural_conflict() -> Self {
        ConflictType::StructuralConflict
    }

    /// Free-form classification for conflicts outside the built-in set
    pub fn custom(name: impl Into<String>) -> Result<Self, SyncError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(SyncError::UnknownConflictType(name));
        }
        Ok(ConflictType::Custom(name))
    }

    /// Parse a canonical name, or `custom:<name>`
    pub fn from_name(name: &str) -> Result<Self, SyncError> {
        match name {
            "CONCURRENT_MODIFICATION" => Ok(ConflictType::ConcurrentModification),
            "ORDERING_CONFLICT" => Ok(ConflictType::OrderingConflict),
            "SEMANTIC_CONFLICT" => Ok(ConflictType::SemanticConflict),
            "STRUCTURAL_CONFLICT" => Ok(ConflictType::StructuralConflict),
            other => match other.strip_prefix(CUSTOM_PREFIX) {
                Some(custom) => ConflictType::custom(custom),
                None => Err(SyncError::UnknownConflictType(other.to_string())),
            },
        }
    }

    pub fn name(&self) -> String {
        match self {
            ConflictType::ConcurrentModification => "CONCURRENT_MODIFICATION".into(),
            ConflictType::OrderingConflict => "ORDERING_CONFLICT".into(),
            ConflictType::SemanticConflict => "SEMANTIC_CONFLICT".into(),
            ConflictType::StructuralConflict => "STRUCTURAL_CONFLICT".into(),
            ConflictType::Custom(name) => format!("{}{}", CUSTOM_PREFIX, name),
        }
    }

    /// Whether automatic resolution is ever attempted for this type
    pub fn is_auto_resolvable(&self) -> bool {
        matches!(
            self,
            ConflictType::ConcurrentModification
                | ConflictType::OrderingConflict
                | ConflictType::StructuralConflict
        )
    }
}

impl TryFrom<String> for ConflictType {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ConflictType::from_name(&value)
    }
}

impl From<ConflictType> for String {
    fn from(t: ConflictType) -> Self {
        t.name()
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Two or more concurrent operations targeting an overlapping path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    id: String,
    conflict_type: ConflictType,
    target_path: String,
    operations: Vec<Operation>,
    detected_at: DateTime<Utc>,
}

impl Conflict {
    pub fn create(
        id: impl Into<String>,
        conflict_type: ConflictType,
        target_path: impl Into<String>,
        operations: Vec<Operation>,
    ) -> Result<Self, SyncError> {
        if operations.len() < 2 {
            return Err(SyncError::InsufficientOperations(operations.len()));
        }
        Ok(Self {
            id: id.into(),
            conflict_type,
            target_path: target_path.into(),
            operations,
            detected_at: Utc::now(),
        })
    }

    /// Deterministic id from the participating operation ids, so every
    /// device that detects the same conflict names it the same way.
    pub fn derive_id(operations: &[Operation]) -> String {
        let mut ids: Vec<&str> = operations.iter().map(|op| op.id().as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        let mut hasher = Sha256::new();
        for id in ids {
            hasher.update(id.as_bytes());
            hasher.update([0u8]);
        }
        format!("conflict-{}", &hex::encode(hasher.finalize())[..16])
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn conflict_type(&self) -> &ConflictType {
        &self.conflict_type
    }

    pub fn target_path(&self) -> &str {
        &self.target_path
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn detected_at(&self) -> DateTime<Utc> {
        self.detected_at
    }

    pub fn operation_ids(&self) -> Vec<OperationId> {
        self.operations.iter().map(|op| op.id().clone()).collect()
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.operations.iter().any(|op| op.id() == id)
    }

    /// Operations sorted by the tie-break total order, latest last
    pub fn ordered_operations(&self) -> Vec<&Operation> {
        let mut ops: Vec<&Operation> = self.operations.iter().collect();
        ops.sort_by(|a, b| a.total_cmp(b));
        ops
    }

    /// The operation that wins tie-breaks
    pub fn latest_operation(&self) -> Option<&Operation> {
        self.operations.iter().max_by(|a, b| a.total_cmp(b))
    }

    /// Sum of the payloads' serialized sizes
    pub fn total_payload_size(&self) -> usize {
        self.operations
            .iter()
            .map(|op| op.payload().serialized_size().unwrap_or(0))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergent::clock::VectorClock;
    use crate::convergent::device::DeviceId;
    use crate::convergent::operation::OperationType;
    use crate::convergent::payload::OperationPayload;

    fn statement_op(id: &str, device: &str, content: &str) -> Operation {
        let device = DeviceId::new(device).unwrap();
        Operation::create(
            OperationId::new(id).unwrap(),
            device.clone(),
            OperationType::UpdateStatement,
            "/statements/s1",
            OperationPayload::statement("s1", content).unwrap(),
            VectorClock::new().increment_for_device(&device).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_requires_two_operations() {
        let a = statement_op("a", "A", "Hello");
        let b = statement_op("b", "B", "World");

        assert_eq!(
            Conflict::create("c", ConflictType::concurrent_modification(), "/statements/s1", vec![a.clone()]),
            Err(SyncError::InsufficientOperations(1))
        );
        assert_eq!(
            Conflict::create("c", ConflictType::concurrent_modification(), "/statements/s1", vec![]),
            Err(SyncError::InsufficientOperations(0))
        );
        let conflict = Conflict::create(
            "c",
            ConflictType::concurrent_modification(),
            "/statements/s1",
            vec![a, b],
        )
        .unwrap();
        assert_eq!(conflict.operations().len(), 2);
        assert_eq!(conflict.latest_operation().unwrap().device_id().as_str(), "B");
    }

    #[test]
    fn test_conflict_type_names() {
        for t in [
            ConflictType::concurrent_modification(),
            ConflictType::ordering_conflict(),
            ConflictType::semantic_conflict(),
            ConflictType::structural_conflict(),
            ConflictType::custom("citation-loop").unwrap(),
        ] {
            assert_eq!(ConflictType::from_name(&t.name()).unwrap(), t);
        }
        assert_eq!(
            ConflictType::from_name("MERGE_CONFLICT"),
            Err(SyncError::UnknownConflictType("MERGE_CONFLICT".into()))
        );
        assert!(ConflictType::custom("  ").is_err());
        assert!(!ConflictType::semantic_conflict().is_auto_resolvable());
    }

    #[test]
    fn test_derived_id_ignores_order() {
        let a = statement_op("a", "A", "Hello");
        let b = statement_op("b", "B", "World");
        let forward = Conflict::derive_id(&[a.clone(), b.clone()]);
        let backward = Conflict::derive_id(&[b, a]);
        assert_eq!(forward, backward);
        assert!(forward.starts_with("conflict-"));
    }
}
