//! Convergent Operation Sync
//!
//! Leaderless synchronization for a collaborative argument-mapping
//! document. Devices broadcast immutable operations stamped with vector
//! clocks; replicas apply them in any order and converge. Concurrent edits
//! to the same element are transformed against each other or, when their
//! meaning clashes, parked for a user decision.

mod clock;
mod conflict;
mod coordination;
mod device;
mod operation;
mod payload;
mod resolution;
mod state;

pub use clock::{CausalOrder, LogicalTimestamp, VectorClock};
pub use conflict::{Conflict, ConflictType};
pub use coordination::{ApplyOutcome, Disposition, OperationCoordinationService};
pub use device::{DeviceId, MAX_DEVICE_ID_LEN};
pub use operation::{ElementKind, Operation, OperationId, OperationRecord, OperationType};
pub use payload::{
    ArgumentData, ConnectionData, MetadataData, OperationPayload, PayloadData, PayloadKind,
    Position, StatementData, TransformStrategy, TreeData, MAX_PAYLOAD_BYTES,
    POSITION_OFFSET_FACTOR,
};
pub use resolution::{
    ConflictResolution, ConflictResolutionService, ResolutionComplexity, ResolutionMethod,
    UserDecision,
};
pub use state::{PendingConflict, SyncSnapshot, SyncState, SNAPSHOT_VERSION};
