//! Background rotation and reaping of signing keys.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::debug;

use super::{KeyManager, SigningKey};
use crate::config::{RotationPolicy, RotationTrigger};

/// Whether `active` must be replaced under `policy` at `now`.
#[must_use]
pub fn rotation_due(policy: &RotationPolicy, active: &SigningKey, now: DateTime<Utc>) -> bool {
    match policy.trigger {
        RotationTrigger::Time => now.signed_duration_since(active.created_at) >= policy.max_age(),
        RotationTrigger::Count => active.tokens_issued >= policy.max_tokens_per_key,
    }
}

/// Spawn the rotation ticker. Each tick rotates the active key if due and
/// then runs the reaper.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_rotation_task(
    manager: Arc<KeyManager>,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    let interval = manager.policy().check_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    manager.tick().await;
                }
                _ = shutdown.recv() => {
                    debug!("Key rotation task shutting down");
                    break;
                }
            }
        }
    })
}
