//! Periodic housekeeping: expired invites, audit retention, and the
//! in-memory rate-limit and lockout tables.

use std::sync::Arc;
use std::time::Instant;

use chrono::Duration as ChronoDuration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use magebox_storage::{StoreError, now};

use crate::state::AppState;

/// What one maintenance pass removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub invites_purged: u64,
    pub audit_purged: u64,
    pub rate_entries_dropped: usize,
    pub lockouts_dropped: usize,
}

/// Run one maintenance pass.
///
/// # Errors
///
/// Returns the first storage error; the in-memory sweeps still run.
pub async fn run_once(state: &AppState) -> Result<SweepReport, StoreError> {
    let instant = Instant::now();
    let mut report = SweepReport {
        rate_entries_dropped: state.rate_limiter.sweep(instant),
        lockouts_dropped: state.login_attempts.sweep(instant)
            + state.mfa_attempts.sweep(instant),
        ..SweepReport::default()
    };

    let at = now();
    report.invites_purged = state.store.purge_expired_invites(at).await?;

    let retention_days = state.config.audit_retention_days;
    if retention_days > 0 {
        let cutoff = at - ChronoDuration::days(i64::from(retention_days));
        report.audit_purged = state.store.purge_audit_before(cutoff).await?;
    }
    Ok(report)
}

/// Background worker that runs [`run_once`] every
/// `config.maintenance_interval` until shutdown is signalled.
pub async fn maintenance_worker(state: Arc<AppState>, shutdown: &mut watch::Receiver<bool>) {
    let period = state.config.maintenance_interval;
    let mut interval = tokio::time::interval(period);
    let mut consecutive_failures: u32 = 0;
    info!(interval_secs = period.as_secs(), "maintenance worker started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match run_once(&state).await {
                    Ok(report) => {
                        consecutive_failures = 0;
                        if report.invites_purged > 0 || report.audit_purged > 0 {
                            info!(
                                invites = report.invites_purged,
                                audit_entries = report.audit_purged,
                                "maintenance purged expired records"
                            );
                        }
                        debug!(
                            rate_entries = report.rate_entries_dropped,
                            lockouts = report.lockouts_dropped,
                            "maintenance tick complete"
                        );
                    }
                    Err(e) => {
                        consecutive_failures = consecutive_failures.saturating_add(1);
                        if consecutive_failures >= 5 {
                            tracing::error!(
                                error = %e,
                                consecutive_failures,
                                "maintenance persistently failing, storage may be unavailable"
                            );
                        } else {
                            warn!(error = %e, consecutive_failures, "maintenance tick failed");
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("maintenance worker shutting down");
                return;
            }
        }
    }
}
