//! Typed operation payloads
//!
//! A payload is a closed tagged union with one validator per variant. Which
//! variant an operation must carry is decided by its `OperationType`; delete
//! operations accept anything, including an empty payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::operation::OperationType;
use crate::error::SyncError;

/// Ceiling on the serialized (JSON) size of a payload's data
pub const MAX_PAYLOAD_BYTES: usize = 1_048_576;

/// Fraction of the other operation's coordinates applied by POSITION_OFFSET
pub const POSITION_OFFSET_FACTOR: f64 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayloadKind {
    Statement,
    Argument,
    Tree,
    Connection,
    Position,
    Metadata,
    Generic,
}

impl PayloadKind {
    pub fn name(&self) -> &'static str {
        match self {
            PayloadKind::Statement => "STATEMENT",
            PayloadKind::Argument => "ARGUMENT",
            PayloadKind::Tree => "TREE",
            PayloadKind::Connection => "CONNECTION",
            PayloadKind::Position => "POSITION",
            PayloadKind::Metadata => "METADATA",
            PayloadKind::Generic => "GENERIC",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementData {
    pub id: String,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgumentData {
    pub id: String,
    pub premises: Vec<String>,
    pub conclusions: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, z: None }
    }

    pub fn with_z(mut self, z: f64) -> Self {
        self.z = Some(z);
        self
    }

    /// Euclidean distance; a missing z reads as 0
    pub fn distance_to(&self, other: &Position) -> f64 {
        let dz = self.z.unwrap_or(0.0) - other.z.unwrap_or(0.0);
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2) + dz.powi(2)).sqrt()
    }

    /// Nudge by a fraction of another position's coordinates
    fn offset_by(&self, other: &Position, factor: f64) -> Position {
        Position {
            x: self.x + other.x * factor,
            y: self.y + other.y * factor,
            z: match (self.z, other.z) {
                (Some(a), Some(b)) => Some(a + b * factor),
                (z, _) => z,
            },
        }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.map_or(true, f64::is_finite)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeData {
    pub id: String,
    pub root_node_id: String,
    pub position: Position,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionData {
    pub source_id: String,
    pub target_id: String,
    pub connection_type: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataData {
    pub key: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<Value>,
}

/// The raw payload variants. Only reachable from outside through
/// `OperationPayload`, which guarantees the data was validated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayloadData {
    Statement(StatementData),
    Argument(ArgumentData),
    Tree(TreeData),
    Connection(ConnectionData),
    Position(Position),
    Metadata(MetadataData),
    Generic(Map<String, Value>),
}

impl PayloadData {
    pub fn kind(&self) -> PayloadKind {
        match self {
            PayloadData::Statement(_) => PayloadKind::Statement,
            PayloadData::Argument(_) => PayloadKind::Argument,
            PayloadData::Tree(_) => PayloadKind::Tree,
            PayloadData::Connection(_) => PayloadKind::Connection,
            PayloadData::Position(_) => PayloadKind::Position,
            PayloadData::Metadata(_) => PayloadKind::Metadata,
            PayloadData::Generic(_) => PayloadKind::Generic,
        }
    }

    /// The data part alone, without the kind tag
    fn to_json(&self) -> Result<Value, serde_json::Error> {
        match self {
            PayloadData::Statement(d) => serde_json::to_value(d),
            PayloadData::Argument(d) => serde_json::to_value(d),
            PayloadData::Tree(d) => serde_json::to_value(d),
            PayloadData::Connection(d) => serde_json::to_value(d),
            PayloadData::Position(d) => serde_json::to_value(d),
            PayloadData::Metadata(d) => serde_json::to_value(d),
            PayloadData::Generic(m) => Ok(Value::Object(m.clone())),
        }
    }

    fn validate(&self) -> Result<(), SyncError> {
        match self {
            PayloadData::Statement(d) => {
                non_empty("id", &d.id)?;
                non_empty("content", &d.content)
            }
            PayloadData::Argument(d) => {
                non_empty("id", &d.id)?;
                for p in &d.premises {
                    non_empty("premises", p)?;
                }
                for c in &d.conclusions {
                    non_empty("conclusions", c)?;
                }
                Ok(())
            }
            PayloadData::Tree(d) => {
                non_empty("id", &d.id)?;
                non_empty("rootNodeId", &d.root_node_id)?;
                finite_position("position", &d.position)
            }
            PayloadData::Connection(d) => {
                non_empty("sourceId", &d.source_id)?;
                non_empty("targetId", &d.target_id)?;
                non_empty("connectionType", &d.connection_type)
            }
            PayloadData::Position(p) => finite_position("position", p),
            PayloadData::Metadata(d) => non_empty("key", &d.key),
            PayloadData::Generic(_) => Ok(()),
        }
    }
}

fn non_empty(field: &str, value: &str) -> Result<(), SyncError> {
    if value.trim().is_empty() {
        return Err(SyncError::validation(field, "must be a non-empty string"));
    }
    Ok(())
}

fn finite_position(field: &str, position: &Position) -> Result<(), SyncError> {
    if !position.is_finite() {
        return Err(SyncError::validation(field, "coordinates must be finite numbers"));
    }
    Ok(())
}

// Field extraction from untyped JSON. Each helper names the field it failed on.

fn take_object(data: Value) -> Result<Map<String, Value>, SyncError> {
    match data {
        Value::Object(map) => Ok(map),
        Value::Null => Err(SyncError::validation("payload", "payload is required")),
        other => Err(SyncError::validation(
            "payload",
            format!("expected an object, got {}", json_type_name(&other)),
        )),
    }
}

fn take_string(map: &Map<String, Value>, field: &str) -> Result<String, SyncError> {
    match map.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(SyncError::validation(
            field,
            format!("expected a string, got {}", json_type_name(other)),
        )),
        None => Err(SyncError::validation(field, "missing required field")),
    }
}

fn take_string_list(map: &Map<String, Value>, field: &str) -> Result<Vec<String>, SyncError> {
    match map.get(field) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(SyncError::validation(
                    field,
                    format!("expected an array of strings, found {}", json_type_name(other)),
                )),
            })
            .collect(),
        Some(other) => Err(SyncError::validation(
            field,
            format!("expected an array, got {}", json_type_name(other)),
        )),
        None => Err(SyncError::validation(field, "missing required field")),
    }
}

fn take_number(map: &Map<String, Value>, field: &str) -> Result<f64, SyncError> {
    match map.get(field) {
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| SyncError::validation(field, "number is not representable as f64")),
        Some(other) => Err(SyncError::validation(
            field,
            format!("expected a number, got {}", json_type_name(other)),
        )),
        None => Err(SyncError::validation(field, "missing required field")),
    }
}

fn take_position(map: &Map<String, Value>) -> Result<Position, SyncError> {
    let z = match map.get("z") {
        None | Some(Value::Null) => None,
        Some(_) => Some(take_number(map, "z")?),
    };
    Ok(Position {
        x: take_number(map, "x")?,
        y: take_number(map, "y")?,
        z,
    })
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn parse_kind(kind: PayloadKind, data: Value) -> Result<PayloadData, SyncError> {
    let map = take_object(data)?;
    let parsed = match kind {
        PayloadKind::Statement => PayloadData::Statement(StatementData {
            id: take_string(&map, "id")?,
            content: take_string(&map, "content")?,
        }),
        PayloadKind::Argument => PayloadData::Argument(ArgumentData {
            id: take_string(&map, "id")?,
            premises: take_string_list(&map, "premises")?,
            conclusions: take_string_list(&map, "conclusions")?,
        }),
        PayloadKind::Tree => {
            let position = match map.get("position") {
                Some(Value::Object(p)) => take_position(p)?,
                Some(_) => return Err(SyncError::validation("position", "expected an object")),
                None => return Err(SyncError::validation("position", "missing required field")),
            };
            PayloadData::Tree(TreeData {
                id: take_string(&map, "id")?,
                root_node_id: take_string(&map, "rootNodeId")?,
                position,
            })
        }
        PayloadKind::Connection => PayloadData::Connection(ConnectionData {
            source_id: take_string(&map, "sourceId")?,
            target_id: take_string(&map, "targetId")?,
            connection_type: take_string(&map, "connectionType")?,
        }),
        PayloadKind::Position => PayloadData::Position(take_position(&map)?),
        PayloadKind::Metadata => PayloadData::Metadata(MetadataData {
            key: take_string(&map, "key")?,
            value: map
                .get("value")
                .cloned()
                .ok_or_else(|| SyncError::validation("value", "missing required field"))?,
            previous_value: map.get("previousValue").cloned(),
        }),
        PayloadKind::Generic => PayloadData::Generic(map),
    };
    Ok(parsed)
}

/// Named merge strategies understood by `OperationPayload::transform`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransformStrategy {
    PositionOffset,
    ContentMerge,
    MetadataMerge,
}

impl TransformStrategy {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "POSITION_OFFSET" => Some(TransformStrategy::PositionOffset),
            "CONTENT_MERGE" => Some(TransformStrategy::ContentMerge),
            "METADATA_MERGE" => Some(TransformStrategy::MetadataMerge),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransformStrategy::PositionOffset => "POSITION_OFFSET",
            TransformStrategy::ContentMerge => "CONTENT_MERGE",
            TransformStrategy::MetadataMerge => "METADATA_MERGE",
        }
    }
}

/// Validated, size-bounded data carried by an operation.
///
/// Every construction path, deserialization included, runs the per-kind
/// validator and the size check, so holding an `OperationPayload` means the
/// data is well-formed. Equality is structural: same kind and same data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PayloadData", into = "PayloadData")]
pub struct OperationPayload {
    data: PayloadData,
}

impl OperationPayload {
    /// Build a payload from untyped JSON for the given operation type
    pub fn create(data: Value, operation_type: OperationType) -> Result<Self, SyncError> {
        let payload_data = match operation_type.required_payload() {
            Some(kind) => parse_kind(kind, data)?,
            // Deletes need no positive data; keep whatever was sent
            None => match data {
                Value::Null => PayloadData::Generic(Map::new()),
                Value::Object(map) => PayloadData::Generic(map),
                other => {
                    let mut map = Map::new();
                    map.insert("value".to_string(), other);
                    PayloadData::Generic(map)
                }
            },
        };
        Self::from_data(payload_data)
    }

    /// Validate already-typed data
    pub fn from_data(data: PayloadData) -> Result<Self, SyncError> {
        data.validate()?;
        let payload = Self { data };
        let size = payload.serialized_size()?;
        if size > MAX_PAYLOAD_BYTES {
            return Err(SyncError::PayloadTooLarge {
                size,
                limit: MAX_PAYLOAD_BYTES,
            });
        }
        Ok(payload)
    }

    /// Empty generic payload for deletes and placeholders
    pub fn create_empty() -> Self {
        Self {
            data: PayloadData::Generic(Map::new()),
        }
    }

    pub fn statement(id: impl Into<String>, content: impl Into<String>) -> Result<Self, SyncError> {
        Self::from_data(PayloadData::Statement(StatementData {
            id: id.into(),
            content: content.into(),
        }))
    }

    pub fn argument(
        id: impl Into<String>,
        premises: Vec<String>,
        conclusions: Vec<String>,
    ) -> Result<Self, SyncError> {
        Self::from_data(PayloadData::Argument(ArgumentData {
            id: id.into(),
            premises,
            conclusions,
        }))
    }

    pub fn tree(
        id: impl Into<String>,
        root_node_id: impl Into<String>,
        position: Position,
    ) -> Result<Self, SyncError> {
        Self::from_data(PayloadData::Tree(TreeData {
            id: id.into(),
            root_node_id: root_node_id.into(),
            position,
        }))
    }

    pub fn connection(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        connection_type: impl Into<String>,
    ) -> Result<Self, SyncError> {
        Self::from_data(PayloadData::Connection(ConnectionData {
            source_id: source_id.into(),
            target_id: target_id.into(),
            connection_type: connection_type.into(),
        }))
    }

    pub fn position(position: Position) -> Result<Self, SyncError> {
        Self::from_data(PayloadData::Position(position))
    }

    pub fn metadata(key: impl Into<String>, value: Value) -> Result<Self, SyncError> {
        Self::from_data(PayloadData::Metadata(MetadataData {
            key: key.into(),
            value,
            previous_value: None,
        }))
    }

    pub fn generic(map: Map<String, Value>) -> Result<Self, SyncError> {
        Self::from_data(PayloadData::Generic(map))
    }

    pub fn kind(&self) -> PayloadKind {
        self.data.kind()
    }

    pub fn data(&self) -> &PayloadData {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        matches!(&self.data, PayloadData::Generic(m) if m.is_empty())
    }

    /// The payload's data as untyped JSON (no kind tag)
    pub fn to_json(&self) -> Result<Value, SyncError> {
        Ok(self.data.to_json()?)
    }

    /// Size of the JSON-encoded data; this is what the 1 MiB ceiling bounds
    pub fn serialized_size(&self) -> Result<usize, SyncError> {
        Ok(serde_json::to_vec(&self.data.to_json()?)?.len())
    }

    /// Coordinates carried by tree and position payloads
    pub fn position_value(&self) -> Option<&Position> {
        match &self.data {
            PayloadData::Tree(t) => Some(&t.position),
            PayloadData::Position(p) => Some(p),
            _ => None,
        }
    }

    pub fn metadata_key(&self) -> Option<&str> {
        match &self.data {
            PayloadData::Metadata(m) => Some(&m.key),
            _ => None,
        }
    }

    /// Check that this payload is the shape `operation_type` requires
    pub fn validate_for(&self, operation_type: OperationType) -> Result<(), SyncError> {
        if let Some(expected) = operation_type.required_payload() {
            if self.kind() != expected {
                return Err(SyncError::validation(
                    "payload",
                    format!(
                        "{} requires a {} payload, got {}",
                        operation_type.name(),
                        expected.name(),
                        self.kind().name()
                    ),
                ));
            }
        }
        self.data.validate()
    }

    /// Deep copy through a serialization round-trip
    pub fn deep_copy(&self) -> Result<Self, SyncError> {
        let encoded = serde_json::to_value(self)?;
        Ok(serde_json::from_value(encoded)?)
    }

    /// Merge `other` into this payload with a named strategy.
    ///
    /// Unknown strategy names return the receiver unchanged.
    pub fn transform(&self, other: &OperationPayload, strategy_name: &str) -> Result<Self, SyncError> {
        match TransformStrategy::from_name(strategy_name) {
            Some(strategy) => self.transform_with_strategy(other, strategy),
            None => {
                log::debug!("Unknown transform strategy '{}', leaving payload as is", strategy_name);
                Ok(self.clone())
            }
        }
    }

    pub fn transform_with_strategy(
        &self,
        other: &OperationPayload,
        strategy: TransformStrategy,
    ) -> Result<Self, SyncError> {
        match strategy {
            TransformStrategy::PositionOffset => self.offset_position(other),
            TransformStrategy::ContentMerge => self.content_merge(other),
            TransformStrategy::MetadataMerge => self.metadata_merge(other),
        }
    }

    fn offset_position(&self, other: &OperationPayload) -> Result<Self, SyncError> {
        let Some(theirs) = other.position_value() else {
            return Ok(self.clone());
        };
        let data = match &self.data {
            PayloadData::Tree(t) => PayloadData::Tree(TreeData {
                position: t.position.offset_by(theirs, POSITION_OFFSET_FACTOR),
                ..t.clone()
            }),
            PayloadData::Position(p) => {
                PayloadData::Position(p.offset_by(theirs, POSITION_OFFSET_FACTOR))
            }
            _ => return Ok(self.clone()),
        };
        Self::from_data(data).map_err(|e| SyncError::TransformationFailure(e.to_string()))
    }

    /// Union of both payloads' fields; `other` wins on key collisions. The
    /// result keeps this payload's kind.
    fn content_merge(&self, other: &OperationPayload) -> Result<Self, SyncError> {
        let compatible = self.kind() == other.kind()
            || self.kind() == PayloadKind::Generic
            || other.kind() == PayloadKind::Generic;
        if !compatible {
            return Err(SyncError::TransformationFailure(format!(
                "cannot content-merge a {} payload into a {} payload",
                other.kind().name(),
                self.kind().name()
            )));
        }

        let mut merged = match self.to_json()? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if let Value::Object(theirs) = other.to_json()? {
            for (key, value) in theirs {
                merged.insert(key, value);
            }
        }

        parse_kind(self.kind(), Value::Object(merged))
            .and_then(Self::from_data)
            .map_err(|e| SyncError::TransformationFailure(format!("content merge: {}", e)))
    }

    /// Adopt `other`'s value for the same key, remembering ours as
    /// `previousValue`. Different keys or non-metadata payloads are left alone.
    /// Carrying both values can push the result over the size ceiling.
    fn metadata_merge(&self, other: &OperationPayload) -> Result<Self, SyncError> {
        match (&self.data, &other.data) {
            (PayloadData::Metadata(ours), PayloadData::Metadata(theirs)) if ours.key == theirs.key => {
                Self::from_data(PayloadData::Metadata(MetadataData {
                    key: ours.key.clone(),
                    value: theirs.value.clone(),
                    previous_value: Some(ours.value.clone()),
                }))
                .map_err(|e| SyncError::TransformationFailure(format!("metadata merge: {}", e)))
            }
            _ => Ok(self.clone()),
        }
    }
}

impl TryFrom<PayloadData> for OperationPayload {
    type Error = SyncError;

    fn try_from(data: PayloadData) -> Result<Self, Self::Error> {
        OperationPayload::from_data(data)
    }
}

impl From<OperationPayload> for PayloadData {
    fn from(payload: OperationPayload) -> Self {
        payload.data
    }
}
