//! Poll-until-ready reconciliation over a single MeshRootCertificate.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{ComponentStatus, MeshRootCertificate, MrcState};
use crate::errors::{Error, Result};
use crate::store::MrcClient;

/// How a [`MrcReconciler::check_and_update`] loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Updated,
    /// The check rejected the MRC; nothing was written
    Aborted(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct MrcReconciler {
    client: Arc<dyn MrcClient>,
    interval: Duration,
}

impl MrcReconciler {
    pub fn new(client: Arc<dyn MrcClient>, interval: Duration) -> Self {
        Self { client, interval }
    }

    /// Poll the MRC called `name` until `check` returns true, then run `update`
    /// once and stop.
    ///
    /// An error from `check` means another actor already moved the MRC past
    /// what this loop expects: the loop ends without calling `update`. A
    /// failed fetch or update is logged and retried on the next tick.
    pub async fn check_and_update<C, U, Fut>(
        &self,
        name: &str,
        mut check: C,
        mut update: U,
        cancel: &CancellationToken,
    ) -> ReconcileOutcome
    where
        C: FnMut(&MeshRootCertificate) -> Result<bool>,
        U: FnMut(MeshRootCertificate) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(mrc = %name, "Reconciliation cancelled");
                    return ReconcileOutcome::Cancelled;
                }
                _ = ticker.tick() => {}
            }

            let mrc = match self.client.get_mesh_root_certificate(name).await {
                Ok(mrc) => mrc,
                Err(e) => {
                    warn!(mrc = %name, error = %e, "Failed to fetch MRC during reconciliation");
                    continue;
                }
            };

            match check(&mrc) {
                Err(e) => {
                    info!(mrc = %name, error = %e, "MRC moved past the expected status, aborting reconciliation");
                    return ReconcileOutcome::Aborted(e.to_string());
                }
                Ok(false) => continue,
                Ok(true) => {}
            }

            match update(mrc).await {
                Ok(()) => {
                    info!(mrc = %name, "Reconciled MRC");
                    return ReconcileOutcome::Updated;
                }
                Err(e) => warn!(mrc = %name, error = %e, "Failed to update MRC, retrying"),
            }
        }
    }
}

/// Check for [`MrcReconciler::check_and_update`]: ready once every component
/// reports `target`, and an error once the MRC has left `expected`.
pub fn components_reached(
    expected: MrcState,
    target: ComponentStatus,
) -> impl FnMut(&MeshRootCertificate) -> Result<bool> {
    move |mrc| {
        if mrc.status.state != expected {
            return Err(Error::validation(format!(
                "MRC '{}' is in state {}, expected {}",
                mrc.name(),
                mrc.status.state,
                expected
            )));
        }
        Ok(mrc.status.component_statuses.all_equal(target))
    }
}
