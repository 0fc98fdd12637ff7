use std::time::Duration;

use chrono::Utc;

use crate::services::session_service::SessionService;

/// Server-side liveness watchdog. Every tick it scans active sessions and
/// escalates the ones whose last heartbeat is older than the timeout; the
/// escalation itself goes through the session state machine, so racing
/// ticks and client heartbeats serialize on the store version.
#[derive(Clone)]
pub struct HeartbeatMonitor {
    sessions: SessionService,
    tick: Duration,
    timeout: chrono::Duration,
}

impl HeartbeatMonitor {
    pub fn new(sessions: SessionService, tick_secs: u64, timeout_secs: i64) -> Self {
        Self {
            sessions,
            tick: Duration::from_secs(tick_secs.max(1)),
            timeout: chrono::Duration::seconds(timeout_secs.max(1)),
        }
    }

    pub async fn run(self) {
        tracing::info!(
            tick_secs = self.tick.as_secs(),
            timeout_secs = self.timeout.num_seconds(),
            "heartbeat monitor started"
        );
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            self.sweep_once().await;
        }
    }

    /// One monitoring pass. Stale sessions are escalated concurrently so a
    /// slow store write for one session cannot delay timeout detection for
    /// the rest; individual failures are logged and skipped.
    pub async fn sweep_once(&self) {
        let active = match self.sessions.list_active().await {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::error!(error = ?e, "heartbeat sweep failed to list sessions");
                return;
            }
        };

        let cutoff = Utc::now() - self.timeout;
        let mut handles = Vec::new();
        for session in active {
            if session.heartbeat_last_received > cutoff {
                continue;
            }
            let sessions = self.sessions.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = sessions.heartbeat_timeout(&session.session_id).await {
                    tracing::error!(
                        session_id = %session.session_id,
                        error = ?e,
                        "failed to record heartbeat timeout"
                    );
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}
