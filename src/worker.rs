//! Per-device sync worker
//!
//! Each device's `SyncState` is owned by a single tokio task. Callers talk
//! to it through a cloneable `SyncHandle`; commands are processed one at a
//! time, so state transitions for a device are serialized without locks.
//! Locally issued operations are published on a broadcast channel for
//! whatever transport relays them to peers.

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::convergent::{
    Disposition, Operation, OperationCoordinationService, OperationPayload, OperationType,
    SyncSnapshot, SyncState, UserDecision,
};
use crate::error::SyncError;

type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

enum SyncCommand {
    Apply {
        operation: Operation,
        reply: Reply<Disposition>,
    },
    IssueLocal {
        operation_type: OperationType,
        target_path: String,
        payload: OperationPayload,
        reply: Reply<Operation>,
    },
    ResolvePending {
        conflict_id: String,
        decision: UserDecision,
        reply: Reply<Disposition>,
    },
    Snapshot {
        reply: oneshot::Sender<SyncSnapshot>,
    },
}

/// Owns one device's state and applies commands in arrival order
pub struct DeviceSyncWorker {
    state: SyncState,
    coordinator: OperationCoordinationService,
    commands: mpsc::Receiver<SyncCommand>,
    outbound: broadcast::Sender<Operation>,
}

impl DeviceSyncWorker {
    /// Spawn a worker for `state` and return a handle to it. Fails before
    /// spawning anything if the config is invalid.
    pub fn spawn(
        state: SyncState,
        config: SyncConfig,
    ) -> Result<(SyncHandle, JoinHandle<SyncState>), SyncError> {
        let depth = config.worker_queue_depth;
        let coordinator = OperationCoordinationService::new(config)?;
        let (tx, rx) = mpsc::channel(depth);
        let (outbound, _) = broadcast::channel(depth);
        let device = state.device_id().to_string();
        let worker = DeviceSyncWorker {
            state,
            coordinator,
            commands: rx,
            outbound: outbound.clone(),
        };
        let task = tokio::spawn(worker.run());
        let handle = SyncHandle {
            device,
            commands: tx,
            outbound,
        };
        Ok((handle, task))
    }

    /// Process commands until every handle is dropped, then return the
    /// final state.
    async fn run(mut self) -> SyncState {
        log::info!("Sync worker for {} started", self.state.device_id());
        while let Some(command) = self.commands.recv().await {
            self.handle(command);
        }
        log::info!(
            "Sync worker for {} stopped after absorbing {} operations",
            self.state.device_id(),
            self.state.absorbed_count()
        );
        self.state
    }

    fn handle(&mut self, command: SyncCommand) {
        match command {
            SyncCommand::Apply { operation, reply } => {
                let result = self
                    .coordinator
                    .apply_operation(&operation, &self.state)
                    .map(|outcome| {
                        self.state = outcome.state;
                        outcome.disposition
                    });
                let _ = reply.send(result);
            }
            SyncCommand::IssueLocal {
                operation_type,
                target_path,
                payload,
                reply,
            } => {
                let result = self
                    .coordinator
                    .issue_local_operation(&self.state, operation_type, &target_path, payload)
                    .map(|(operation, outcome)| {
                        self.state = outcome.state;
                        // No subscribers is fine; the operation stays in the log
                        let _ = self.outbound.send(operation.clone());
                        operation
                    });
                let _ = reply.send(result);
            }
            SyncCommand::ResolvePending {
                conflict_id,
                decision,
                reply,
            } => {
                let result = self
                    .coordinator
                    .resolve_pending(&conflict_id, decision, &self.state)
                    .map(|outcome| {
                        self.state = outcome.state;
                        outcome.disposition
                    });
                let _ = reply.send(result);
            }
            SyncCommand::Snapshot { reply } => {
                let _ = reply.send(self.state.snapshot());
            }
        }
    }
}

/// Cloneable handle to a running `DeviceSyncWorker`
#[derive(Clone)]
pub struct SyncHandle {
    device: String,
    commands: mpsc::Sender<SyncCommand>,
    outbound: broadcast::Sender<Operation>,
}

impl SyncHandle {
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Operations this device issues from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Operation> {
        self.outbound.subscribe()
    }

    pub async fn apply(&self, operation: Operation) -> Result<Disposition, SyncError> {
        self.request(|reply| SyncCommand::Apply { operation, reply })
            .await?
    }

    pub async fn issue_local(
        &self,
        operation_type: OperationType,
        target_path: impl Into<String>,
        payload: OperationPayload,
    ) -> Result<Operation, SyncError> {
        let target_path = target_path.into();
        self.request(|reply| SyncCommand::IssueLocal {
            operation_type,
            target_path,
            payload,
            reply,
        })
        .await?
    }

    pub async fn resolve_pending(
        &self,
        conflict_id: impl Into<String>,
        decision: UserDecision,
    ) -> Result<Disposition, SyncError> {
        let conflict_id = conflict_id.into();
        self.request(|reply| SyncCommand::ResolvePending {
            conflict_id,
            decision,
            reply,
        })
        .await?
    }

    pub async fn snapshot(&self) -> Result<SyncSnapshot, SyncError> {
        self.request(|reply| SyncCommand::Snapshot { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SyncCommand,
    ) -> Result<T, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| SyncError::WorkerUnavailable(self.device.clone()))?;
        rx.await
            .map_err(|_| SyncError::WorkerUnavailable(self.device.clone()))
    }
}
