//! Multi-device convergence simulation
//!
//! Run with: cargo run --bin sync_simulation [config.json]
//!
//! Three devices edit one argument map concurrently, some edits on their own
//! elements and some on a shared statement. Every operation is then
//! delivered to every other device in a shuffled order, with duplicates,
//! and the replicas' content digests are compared.

use anyhow::{bail, Context, Result};
use rand::seq::SliceRandom;

use proof_sync::convergent::{
    DeviceId, Disposition, Operation, OperationPayload, OperationType, Position, SyncState,
};
use proof_sync::{DeviceSyncWorker, SyncConfig, SyncHandle};

const DEVICES: [&str; 3] = ["laptop", "phone", "tablet"];

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {}", path))?;
            SyncConfig::from_json_str(&raw)?
        }
        None => SyncConfig::default(),
    };

    println!("\n🔄 Convergent sync simulation");
    println!("==============================");

    let mut handles = Vec::new();
    let mut tasks = Vec::new();
    for name in DEVICES {
        let state = SyncState::new(DeviceId::new(name)?);
        let (handle, task) = DeviceSyncWorker::spawn(state, config.clone())?;
        handles.push(handle);
        tasks.push(task);
    }

    let mut issued: Vec<(usize, Operation)> = Vec::new();
    for (index, handle) in handles.iter().enumerate() {
        for op in edit_session(handle, index).await? {
            issued.push((index, op));
        }
    }
    println!("📝 {} operations issued across {} devices", issued.len(), handles.len());

    let mut rng = rand::thread_rng();
    let mut resolved = 0;
    let mut escalated = 0;
    for (index, handle) in handles.iter().enumerate() {
        let mut inbox: Vec<Operation> = issued
            .iter()
            .filter(|(origin, _)| *origin != index)
            .map(|(_, op)| op.clone())
            .collect();
        // At-least-once delivery
        let redelivered: Vec<Operation> = inbox.choose_multiple(&mut rng, 3).cloned().collect();
        inbox.extend(redelivered);
        inbox.shuffle(&mut rng);

        for op in inbox {
            match handle.apply(op).await? {
                Disposition::Resolved(_) => resolved += 1,
                Disposition::Escalated(conflict) => {
                    escalated += 1;
                    println!("⚠️  {} escalated conflict {}", handle.device(), conflict.id());
                }
                _ => {}
            }
        }
    }
    println!("🤝 {} conflicts resolved automatically, {} escalated", resolved, escalated);

    let mut digests = Vec::new();
    for handle in &handles {
        let snapshot = handle.snapshot().await?;
        let digest = snapshot.state.content_digest()?;
        println!(
            "   {:<8} absorbed {:>2} operations, digest {}",
            handle.device(),
            snapshot.state.absorbed_count(),
            &digest[..16]
        );
        digests.push(digest);
    }

    drop(handles);
    for task in tasks {
        task.await.context("sync worker panicked")?;
    }

    if digests.windows(2).any(|pair| pair[0] != pair[1]) {
        bail!("replicas diverged");
    }
    println!("✅ All replicas converged");
    Ok(())
}

/// One device's local edits: its own statement, tree and metadata, plus
/// an edit to the shared statement everyone touches.
async fn edit_session(handle: &SyncHandle, index: usize) -> Result<Vec<Operation>> {
    let device = handle.device().to_string();
    let statement_path = format!("/statements/{}", device);
    let tree_path = format!("/trees/{}", device);
    let offset = index as f64 * 10.0;

    let mut ops = Vec::new();
    ops.push(
        handle
            .issue_local(
                OperationType::CreateStatement,
                statement_path.clone(),
                OperationPayload::statement(device.clone(), format!("{} says P", device))?,
            )
            .await?,
    );
    ops.push(
        handle
            .issue_local(
                OperationType::UpdateStatement,
                statement_path,
                OperationPayload::statement(device.clone(), format!("{} says P and Q", device))?,
            )
            .await?,
    );
    ops.push(
        handle
            .issue_local(
                OperationType::CreateTree,
                tree_path.clone(),
                OperationPayload::tree(device.clone(), device.clone(), Position::new(offset, 0.0))?,
            )
            .await?,
    );
    ops.push(
        handle
            .issue_local(
                OperationType::UpdateMetadata,
                tree_path,
                OperationPayload::metadata("author", serde_json::json!(device))?,
            )
            .await?,
    );
    ops.push(
        handle
            .issue_local(
                OperationType::UpdateStatement,
                "/statements/shared",
                OperationPayload::statement("shared", format!("edited on {}", device))?,
            )
            .await?,
    );
    Ok(ops)
}
