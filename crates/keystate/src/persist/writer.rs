//! Background writer: the only task that touches the storage slot.
//!
//! Commands arrive over an unbounded channel in request order. A save either
//! writes at once (zero debounce) or parks as the pending snapshot and
//! restarts the quiet-period timer; the timer firing writes whatever is
//! pending. Writes are awaited inside the loop, so they never overlap.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error};

use super::{CustomSave, Shared};
use crate::bus::panic_message;
use crate::error::StateError;
use crate::value::Snapshot;

pub(super) enum Command {
    Save(Snapshot),
    Flush(oneshot::Sender<()>),
    Cancel,
    Purge(oneshot::Sender<()>),
}

pub(super) async fn run(shared: Arc<Shared>, mut commands: mpsc::UnboundedReceiver<Command>) {
    let debounce = shared.config.debounce;
    let mut pending: Option<Snapshot> = None;
    let mut deadline = Instant::now();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Save(snapshot)) => {
                    if debounce.is_zero() {
                        write(&shared, snapshot).await;
                    } else {
                        pending = Some(snapshot);
                        deadline = Instant::now() + debounce;
                    }
                }
                Some(Command::Flush(done)) => {
                    if let Some(snapshot) = pending.take() {
                        write(&shared, snapshot).await;
                    }
                    let _ = done.send(());
                }
                Some(Command::Cancel) => {
                    if pending.take().is_some() {
                        debug!(key = %shared.storage_key, "pending save cancelled");
                    }
                }
                Some(Command::Purge(done)) => {
                    pending = None;
                    purge(&shared).await;
                    let _ = done.send(());
                }
                None => {
                    if let Some(snapshot) = pending.take() {
                        write(&shared, snapshot).await;
                    }
                    debug!(key = %shared.storage_key, "persistence writer stopped");
                    break;
                }
            },
            () = sleep_until(deadline), if pending.is_some() => {
                if let Some(snapshot) = pending.take() {
                    write(&shared, snapshot).await;
                }
            }
        }
    }
}

async fn write(shared: &Shared, snapshot: Snapshot) {
    let unchanged = shared.baseline().as_ref() == Some(&snapshot);
    if unchanged {
        debug!(key = %shared.storage_key, "stored state unchanged, write skipped");
        return;
    }

    let config = &shared.config;
    let outcome = match &config.custom_save {
        Some(save) => custom_save(save, shared, &snapshot).await,
        None => match serde_json::to_string(&snapshot) {
            Ok(payload) => config
                .adapter
                .set_item(&shared.storage_key, &payload)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(format!("cannot serialize snapshot: {e}")),
        },
    };

    match outcome {
        Ok(()) => {
            debug!(key = %shared.storage_key, keys = snapshot.len(), "state persisted");
            *shared.baseline() = Some(snapshot);
        }
        Err(reason) => {
            let err = StateError::PersistenceWrite {
                key: shared.storage_key.clone(),
                reason,
            };
            error!(key = %shared.storage_key, error = %err, "failed to persist state");
            shared.report_save_error(&err, &snapshot);
        }
    }
}

/// Run a user-supplied save. A panic, whether building the future or while
/// it runs, becomes an ordinary write failure and the writer keeps going.
async fn custom_save(save: &CustomSave, shared: &Shared, snapshot: &Snapshot) -> Result<(), String> {
    let config = &shared.config;
    let future = catch_unwind(AssertUnwindSafe(|| {
        save(
            snapshot.clone(),
            Arc::clone(&config.adapter),
            config.key_prefix.clone(),
        )
    }))
    .map_err(|payload| format!("custom save panicked: {}", panic_message(payload.as_ref())))?;

    match tokio::spawn(future).await {
        Ok(outcome) => outcome.map_err(|e| e.to_string()),
        Err(e) if e.is_panic() => Err(format!(
            "custom save panicked: {}",
            panic_message(e.into_panic().as_ref())
        )),
        Err(e) => Err(format!("custom save did not finish: {e}")),
    }
}

async fn purge(shared: &Shared) {
    match shared.config.adapter.remove_item(&shared.storage_key).await {
        Ok(()) => {
            *shared.baseline() = None;
            debug!(key = %shared.storage_key, "stored state removed");
        }
        Err(e) => {
            let err = StateError::PersistenceWrite {
                key: shared.storage_key.clone(),
                reason: e.to_string(),
            };
            error!(key = %shared.storage_key, error = %err, "failed to remove stored state");
            shared.report_save_error(&err, &Snapshot::new());
        }
    }
}
