//! Operations: immutable edit intents stamped with a causal clock
//!
//! An Operation is what a device broadcasts after a local edit. It never
//! changes after construction; transforming it against a concurrent
//! operation produces new operations.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

use super::clock::{CausalOrder, VectorClock};
use super::device::DeviceId;
use super::payload::{OperationPayload, PayloadKind, TransformStrategy};
use crate::error::SyncError;

/// Unique identifier for an operation
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OperationId(String);

impl OperationId {
    pub fn new(id: impl Into<String>) -> Result<Self, SyncError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(SyncError::validation("id", "operation id must not be empty"));
        }
        Ok(Self(id))
    }

    /// Fresh random id for a local operation
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OperationId {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        OperationId::new(value)
    }
}

impl From<OperationId> for String {
    fn from(id: OperationId) -> Self {
        id.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The document element family an operation addresses
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Statement,
    Argument,
    Tree,
    Connection,
    Metadata,
}

/// The closed set of edit kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    CreateStatement,
    UpdateStatement,
    DeleteStatement,
    CreateArgument,
    UpdateArgument,
    DeleteArgument,
    CreateTree,
    UpdateTree,
    DeleteTree,
    CreateConnection,
    UpdateConnection,
    DeleteConnection,
    UpdateTreePosition,
    UpdateMetadata,
}

impl OperationType {
    pub const ALL: [OperationType; 14] = [
        OperationType::CreateStatement,
        OperationType::UpdateStatement,
        OperationType::DeleteStatement,
        OperationType::CreateArgument,
        OperationType::UpdateArgument,
        OperationType::DeleteArgument,
        OperationType::CreateTree,
        OperationType::UpdateTree,
        OperationType::DeleteTree,
        OperationType::CreateConnection,
        OperationType::UpdateConnection,
        OperationType::DeleteConnection,
        OperationType::UpdateTreePosition,
        OperationType::UpdateMetadata,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            OperationType::CreateStatement => "CREATE_STATEMENT",
            OperationType::UpdateStatement => "UPDATE_STATEMENT",
            OperationType::DeleteStatement => "DELETE_STATEMENT",
            OperationType::CreateArgument => "CREATE_ARGUMENT",
            OperationType::UpdateArgument => "UPDATE_ARGUMENT",
            OperationType::DeleteArgument => "DELETE_ARGUMENT",
            OperationType::CreateTree => "CREATE_TREE",
            OperationType::UpdateTree => "UPDATE_TREE",
            OperationType::DeleteTree => "DELETE_TREE",
            OperationType::CreateConnection => "CREATE_CONNECTION",
            OperationType::UpdateConnection => "UPDATE_CONNECTION",
            OperationType::DeleteConnection => "DELETE_CONNECTION",
            OperationType::UpdateTreePosition => "UPDATE_TREE_POSITION",
            OperationType::UpdateMetadata => "UPDATE_METADATA",
        }
    }

    /// Payload kind this operation must carry; `None` for deletes
    pub fn required_payload(&self) -> Option<PayloadKind> {
        match self {
            OperationType::CreateStatement | OperationType::UpdateStatement => {
                Some(PayloadKind::Statement)
            }
            OperationType::CreateArgument | OperationType::UpdateArgument => {
                Some(PayloadKind::Argument)
            }
            OperationType::CreateTree | OperationType::UpdateTree => Some(PayloadKind::Tree),
            OperationType::CreateConnection | OperationType::UpdateConnection => {
                Some(PayloadKind::Connection)
            }
            OperationType::UpdateTreePosition => Some(PayloadKind::Position),
            OperationType::UpdateMetadata => Some(PayloadKind::Metadata),
            OperationType::DeleteStatement
            | OperationType::DeleteArgument
            | OperationType::DeleteTree
            | OperationType::DeleteConnection => None,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.required_payload().is_none()
    }

    pub fn element(&self) -> ElementKind {
        match self {
            OperationType::CreateStatement
            | OperationType::UpdateStatement
            | OperationType::DeleteStatement => ElementKind::Statement,
            OperationType::CreateArgument
            | OperationType::UpdateArgument
            | OperationType::DeleteArgument => ElementKind::Argument,
            OperationType::CreateTree
            | OperationType::UpdateTree
            | OperationType::DeleteTree
            | OperationType::UpdateTreePosition => ElementKind::Tree,
            OperationType::CreateConnection
            | OperationType::UpdateConnection
            | OperationType::DeleteConnection => ElementKind::Connection,
            OperationType::UpdateMetadata => ElementKind::Metadata,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Wire form of an operation; validated into `Operation` on decode.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    id: OperationId,
    device_id: DeviceId,
    operation_type: OperationType,
    target_path: String,
    payload: OperationPayload,
    vector_clock: VectorClock,
}

/// An immutable edit intent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "OperationRecord")]
pub struct Operation {
    id: OperationId,
    device_id: DeviceId,
    operation_type: OperationType,
    target_path: String,
    payload: OperationPayload,
    vector_clock: VectorClock,
}

impl TryFrom<OperationRecord> for Operation {
    type Error = SyncError;

    fn try_from(r: OperationRecord) -> Result<Self, Self::Error> {
        Operation::create(
            r.id,
            r.device_id,
            r.operation_type,
            r.target_path,
            r.payload,
            r.vector_clock,
        )
    }
}

impl Operation {
    /// Create an operation, checking the payload against the type
    pub fn create(
        id: OperationId,
        device_id: DeviceId,
        operation_type: OperationType,
        target_path: impl Into<String>,
        payload: OperationPayload,
        vector_clock: VectorClock,
    ) -> Result<Self, SyncError> {
        let target_path = target_path.into();
        if target_path.trim().is_empty() {
            return Err(SyncError::validation("targetPath", "must not be empty"));
        }
        payload.validate_for(operation_type)?;
        Ok(Self {
            id,
            device_id,
            operation_type,
            target_path,
            payload,
            vector_clock,
        })
    }

    pub fn id(&self) -> &OperationId {
        &self.id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    pub fn target_path(&self) -> &str {
        &self.target_path
    }

    pub fn payload(&self) -> &OperationPayload {
        &self.payload
    }

    pub fn vector_clock(&self) -> &VectorClock {
        &self.vector_clock
    }

    /// The unit of content this operation writes. Metadata edits are keyed
    /// by path and key so disjoint keys at one path never collide.
    pub fn slot(&self) -> String {
        match self.payload.metadata_key() {
            Some(key) => format!("{}#{}", self.target_path, key),
            None => self.target_path.clone(),
        }
    }

    pub fn is_concurrent_with(&self, other: &Operation) -> bool {
        self.vector_clock.is_concurrent_with(&other.vector_clock)
    }

    /// Deterministic total order used for every tie-break: causal order,
    /// then device id, then operation id.
    pub fn total_cmp(&self, other: &Operation) -> Ordering {
        match self.vector_clock.compare(&other.vector_clock) {
            CausalOrder::Before => Ordering::Less,
            CausalOrder::After => Ordering::Greater,
            CausalOrder::Equal | CausalOrder::Concurrent => self
                .device_id
                .cmp(&other.device_id)
                .then_with(|| self.id.cmp(&other.id)),
        }
    }

    /// Whether this operation wins tie-breaks against `other`
    pub fn is_later_than(&self, other: &Operation) -> bool {
        self.total_cmp(other) == Ordering::Greater
    }

    /// Copy of this operation carrying a different payload of the same kind
    pub(crate) fn with_payload(&self, payload: OperationPayload) -> Operation {
        Operation {
            payload,
            ..self.clone()
        }
    }

    /// Transform against a concurrent operation.
    ///
    /// Returns `(self', other')` such that applying `self` then `other'`
    /// leaves the same content as applying `other` then `self'` for the
    /// content and metadata merges. Position nudges are mirrored instead:
    /// `a.transform_with(b)` is `b.transform_with(a)` swapped.
    pub fn transform_with(&self, other: &Operation) -> Result<(Operation, Operation), SyncError> {
        let identity = || Ok((self.clone(), other.clone()));

        if self.id == other.id || self.target_path != other.target_path {
            return identity();
        }
        if self.operation_type.is_delete() || other.operation_type.is_delete() {
            return identity();
        }

        let ours = self.payload.kind();
        let theirs = other.payload.kind();
        let positional = |k: PayloadKind| matches!(k, PayloadKind::Tree | PayloadKind::Position);

        if positional(ours) && positional(theirs) {
            let this_moved = self
                .payload
                .transform_with_strategy(&other.payload, TransformStrategy::PositionOffset)?;
            let other_moved = other
                .payload
                .transform_with_strategy(&self.payload, TransformStrategy::PositionOffset)?;
            return Ok((self.with_payload(this_moved), other.with_payload(other_moved)));
        }

        let strategy = match (ours, theirs) {
            (PayloadKind::Metadata, PayloadKind::Metadata) => {
                if self.payload.metadata_key() != other.payload.metadata_key() {
                    return identity();
                }
                TransformStrategy::MetadataMerge
            }
            (a, b) if a == b => TransformStrategy::ContentMerge,
            _ => return identity(),
        };

        let (loser, winner) = if self.is_later_than(other) {
            (other, self)
        } else {
            (self, other)
        };
        let merged = loser
            .payload
            .transform_with_strategy(&winner.payload, strategy)?;
        log::debug!(
            "{} {} against {} at {}: {} wins",
            strategy.name(),
            self.id,
            other.id,
            self.target_path,
            winner.id
        );
        Ok((self.with_payload(merged.clone()), other.with_payload(merged)))
    }

    /// Serialize to CBOR bytes.
    pub fn to_cbor(&self) -> Result<Vec<u8>, SyncError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize from CBOR bytes, re-running validation.
    pub fn from_cbor(data: &[u8]) -> Result<Self, SyncError> {
        ciborium::from_reader(data).map_err(|e| SyncError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn statement_op(id: &str, device: &str, content: &str, c: VectorClock) -> Operation {
        op(
            id,
            device,
            OperationType::UpdateStatement,
            "/statements/s1",
            OperationPayload::statement("s1", content).unwrap(),
            c,
        )
    }

    #[test]
    fn test_create_rejects_mismatched_payload() {
        let err = Operation::create(
            OperationId::generate(),
            dev("A"),
            OperationType::CreateStatement,
            "/statements/s1",
            OperationPayload::create_empty(),
            VectorClock::new(),
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::Validation { ref field, .. } if field == "payload"));

        assert!(Operation::create(
            OperationId::generate(),
            dev("A"),
            OperationType::DeleteStatement,
            "  ",
            OperationPayload::create_empty(),
            VectorClock::new(),
        )
        .is_err());
    }

    #[test]
    fn test_every_type_has_a_valid_payload() {
        for operation_type in OperationType::ALL {
            let data = match operation_type.required_payload() {
                Some(PayloadKind::Statement) => json!({"id": "s", "content": "c"}),
                Some(PayloadKind::Argument) => json!({"id": "a", "premises": [], "conclusions": ["c"]}),
                Some(PayloadKind::Tree) => {
                    json!({"id": "t", "rootNodeId": "n", "position": {"x": 0, "y": 0}})
                }
                Some(PayloadKind::Connection) => {
                    json!({"sourceId": "a", "targetId": "b", "connectionType": "supports"})
                }
                Some(PayloadKind::Position) => json!({"x": 1, "y": 2, "z": 3}),
                Some(PayloadKind::Metadata) => json!({"key": "k", "value": null}),
                Some(PayloadKind::Generic) | None => json!({}),
            };
            let payload = OperationPayload::create(data, operation_type).unwrap();
            assert!(Operation::create(
                OperationId::generate(),
                dev("A"),
                operation_type,
                "/x",
                payload,
                VectorClock::new()
            )
            .is_ok());
        }
    }

    #[test]
    fn test_total_order() {
        let a = statement_op("op-2", "A", "x", clock(&[("A", 1)]));
        let b = statement_op("op-1", "B", "y", clock(&[("B", 1)]));
        let after_both = statement_op("op-0", "A", "z", clock(&[("A", 2), ("B", 1)]));

        // Concurrent: device id decides
        assert!(b.is_later_than(&a));
        // Causal order beats device id
        assert!(after_both.is_later_than(&b));
        // Same device and clock: operation id decides
        let twin = statement_op("op-3", "A", "x", clock(&[("A", 1)]));
        assert!(twin.is_later_than(&a));
    }

    #[test]
    fn test_self_transform_is_identity() {
        let samples = [
            statement_op("s", "A", "Hello", clock(&[("A", 1)])),
            op(
                "m",
                "A",
                OperationType::UpdateMetadata,
                "/trees/t1",
                OperationPayload::metadata("color", json!("red")).unwrap(),
                clock(&[("A", 1)]),
            ),
            op(
                "p",
                "A",
                OperationType::UpdateTreePosition,
                "/trees/t1",
                OperationPayload::position(Position::new(3.0, 4.0)).unwrap(),
                clock(&[("A", 1)]),
            ),
        ];
        for sample in samples {
            let (x, y) = sample.transform_with(&sample).unwrap();
            assert_eq!(x.payload(), sample.payload());
            assert_eq!(y.payload(), sample.payload());
        }
    }

    #[test]
    fn test_disjoint_paths_are_untouched() {
        let a = statement_op("a", "A", "Hello", clock(&[("A", 1)]));
        let b = op(
            "b",
            "B",
            OperationType::UpdateStatement,
            "/statements/s2",
            OperationPayload::statement("s2", "World").unwrap(),
            clock(&[("B", 1)]),
        );
        let (x, y) = a.transform_with(&b).unwrap();
        assert_eq!(x, a);
        assert_eq!(y, b);
    }

    #[test]
    fn test_content_merge_converges() {
        let a = statement_op("a", "A", "Hello", clock(&[("A", 1)]));
        let b = statement_op("b", "B", "World", clock(&[("A", 0), ("B", 1)]));

        let (a1, b1) = a.transform_with(&b).unwrap();
        let (b2, a2) = b.transform_with(&a).unwrap();
        let expected = OperationPayload::statement("s1", "World").unwrap();
        for transformed in [&a1, &b1, &a2, &b2] {
            assert_eq!(transformed.payload(), &expected);
        }
        // Identity and clocks are preserved
        assert_eq!(a1.id(), a.id());
        assert_eq!(b1.vector_clock(), b.vector_clock());
    }

    #[test]
    fn test_position_transform_is_mirrored() {
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
            "/trees/t1",
            OperationPayload::position(Position::new(20.0, 0.0)).unwrap(),
            clock(&[("B", 1)]),
        );
        let (a1, b1) = a.transform_with(&b).unwrap();
        let (b2, a2) = b.transform_with(&a).unwrap();
        assert_eq!(a1, a2);
        assert_eq!(b1, b2);

        let moved = a1.payload().position_value().unwrap();
        assert!((moved.x - 12.0).abs() < 1e-9);
        assert!((moved.y - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_metadata_transform() {
        let red = op(
            "a",
            "A",
            OperationType::UpdateMetadata,
            "/trees/t1",
            OperationPayload::metadata("color", json!("red")).unwrap(),
            clock(&[("A", 1)]),
        );
        let blue = op(
            "b",
            "B",
            OperationType::UpdateMetadata,
            "/trees/t1",
            OperationPayload::metadata("color", json!("blue")).unwrap(),
            clock(&[("B", 1)]),
        );
        let (x, y) = red.transform_with(&blue).unwrap();
        let expected = json!({"key": "color", "value": "blue", "previousValue": "red"});
        assert_eq!(x.payload().to_json().unwrap(), expected);
        assert_eq!(y.payload().to_json().unwrap(), expected);

        let size = op(
            "c",
            "B",
            OperationType::UpdateMetadata,
            "/trees/t1",
            OperationPayload::metadata("size", json!(2)).unwrap(),
            clock(&[("B", 1)]),
        );
        assert_ne!(red.slot(), size.slot());
        let (x, y) = red.transform_with(&size).unwrap();
        assert_eq!((x, y), (red, size));
    }

    #[test]
    fn test_delete_and_mixed_kinds_are_identity() {
        let edit = statement_op("a", "A", "Hello", clock(&[("A", 1)]));
        let delete = op(
            "d",
            "B",
            OperationType::DeleteStatement,
            "/statements/s1",
            OperationPayload::create_empty(),
            clock(&[("B", 1)]),
        );
        let (x, y) = edit.transform_with(&delete).unwrap();
        assert_eq!((x, y), (edit.clone(), delete));

        let connection = op(
            "c",
            "B",
            OperationType::UpdateConnection,
            "/statements/s1",
            OperationPayload::connection("s1", "s2", "supports").unwrap(),
            clock(&[("B", 1)]),
        );
        let (x, y) = edit.transform_with(&connection).unwrap();
        assert_eq!((x, y), (edit, connection));
    }

    #[test]
    fn test_wire_round_trip_validates() {
        let a = statement_op("a", "A", "Hello", clock(&[("A", 1)]));
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["operationType"], "UPDATE_STATEMENT");
        assert_eq!(json["vectorClock"]["A"], 1);
        let restored: Operation = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(restored, a);

        let cbor = a.to_cbor().unwrap();
        assert_eq!(Operation::from_cbor(&cbor).unwrap(), a);

        let mut forged = json;
        forged["operationType"] = json!("UPDATE_TREE_POSITION");
        assert!(serde_json::from_value::<Operation>(forged).is_err());
    }
}
