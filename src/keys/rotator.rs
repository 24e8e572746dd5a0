//! Scheduled key rotation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{KeyError, KeyManager, KeyPair};

/// Rotates the active key once it is older than the rotation window.
pub struct KeyRotator {
    manager: Arc<KeyManager>,
    rotation_window: Duration,
    check_interval: Duration,
}

impl KeyRotator {
    /// Create a rotator. `check_interval` is how often the active key's age is
    /// inspected (daily in production).
    #[must_use]
    pub fn new(manager: Arc<KeyManager>, rotation_window: Duration, check_interval: Duration) -> Self {
        Self {
            manager,
            rotation_window,
            check_interval,
        }
    }

    /// Run one check at the current time.
    pub async fn check_once(&self) -> Result<Option<KeyPair>, KeyError> {
        self.check_at(Utc::now()).await
    }

    /// Run one check as of `now`.
    ///
    /// Rotation happens once `now - created` of the newest key reaches the
    /// rotation window. The insert uses a slot named after the key being
    /// replaced, so several instances that see the same stale key produce one
    /// successor between them. An empty store is bootstrapped.
    pub async fn check_at(&self, now: DateTime<Utc>) -> Result<Option<KeyPair>, KeyError> {
        let Some(active) = self.manager.latest_key().await? else {
            warn!("Key store is empty, bootstrapping");
            return self.manager.bootstrap().await.map(Some);
        };

        let window = TimeDelta::from_std(self.rotation_window).unwrap_or(TimeDelta::MAX);
        if now.signed_duration_since(active.created_at) < window {
            debug!(kid = %active.id, created = %active.created_at, "Active key within rotation window");
            return Ok(None);
        }

        let slot = rotation_slot(&active.id);
        info!(kid = %active.id, created = %active.created_at, "Active key reached its rotation window");
        self.manager.rotate_in_slot(&slot, "scheduled").await
    }

    /// Spawn the periodic check. The task exits when `shutdown` fires.
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.check_once().await {
                            warn!(error = %e, "Key rotation check failed, retrying next tick");
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Key rotator shutting down");
                        break;
                    }
                }
            }
        })
    }
}

/// Idempotency slot for the successor of `kid`.
fn rotation_slot(kid: &str) -> String {
    format!("rotation-after-{kid}")
}
