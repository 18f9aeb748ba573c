//! Explicit, rate-limited process restarts.
//!
//! Components never exit the process themselves. They hand a `RestartReason`
//! back to `main`, which records it in a persisted ledger, waits out any
//! backoff, and then exits for the service manager or re-executes itself.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{RestartConfig, RestartMode};
use crate::state::{read_json, write_json_durable};

/// Exit status asking the service manager to start us again.
pub const RESTART_EXIT_CODE: i32 = 75;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartReason {
    /// A sibling proved the mesh master moved.
    MasterChanged { from: String, to: String },
    /// Credentials were revoked; the next boot pairs again.
    Unpaired,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::MasterChanged { from, to } => write!(f, "master changed from {from} to {to}"),
            RestartReason::Unpaired => f.write_str("node unpaired"),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    /// Unix seconds of recent restarts, oldest first.
    restarts: Vec<i64>,
}

/// Delay before restarting when `recent` restarts (including this one) fall
/// inside the window. `jitter` is a fraction in `[0, 1)`.
pub fn backoff_delay(policy: &RestartConfig, recent: usize, jitter: f64) -> Duration {
    if recent <= policy.max_restarts {
        return Duration::ZERO;
    }
    let exponent = (recent - policy.max_restarts - 1).min(16) as u32;
    let base = policy.base_backoff_secs.saturating_mul(1u64 << exponent);
    let jittered = base as f64 * (1.0 + jitter.clamp(0.0, 1.0) / 4.0);
    Duration::from_secs_f64(jittered.min(policy.max_backoff_secs as f64))
}

pub struct RestartLedger {
    path: PathBuf,
    policy: RestartConfig,
}

impl RestartLedger {
    pub fn new(path: PathBuf, policy: RestartConfig) -> Self {
        Self { path, policy }
    }

    /// Record a restart at `now` and return how long to wait before performing it.
    pub fn record(&self, now: i64, jitter: f64) -> std::io::Result<Duration> {
        let mut ledger: LedgerFile = read_json(&self.path).unwrap_or_else(|e| {
            warn!(path=%self.path.display(), error=%e, "unreadable restart ledger, starting fresh");
            None
        }).unwrap_or_default();
        let horizon = now - self.policy.window_secs as i64;
        ledger.restarts.retain(|t| *t > horizon);
        ledger.restarts.push(now);
        write_json_durable(&self.path, &ledger)?;
        Ok(backoff_delay(&self.policy, ledger.restarts.len(), jitter))
    }
}

/// Carry out a restart. Returns the exit status for the current process.
pub async fn perform_restart(reason: &RestartReason, ledger: &RestartLedger) -> anyhow::Result<i32> {
    let now = chrono::Utc::now().timestamp();
    let jitter = rand::thread_rng().gen::<f64>();
    let delay = match ledger.record(now, jitter) {
        Ok(d) => d,
        Err(e) => {
            warn!(error=%e, "could not persist restart ledger");
            Duration::ZERO
        }
    };
    if !delay.is_zero() {
        warn!(reason=%reason, delay=?delay, "restarting too often, backing off");
        tokio::time::sleep(delay).await;
    }

    match ledger.policy.mode {
        RestartMode::Exit => {
            info!(reason=%reason, code = RESTART_EXIT_CODE, "exiting for restart");
            Ok(RESTART_EXIT_CODE)
        }
        RestartMode::Respawn => {
            let exe = std::env::current_exe()?;
            info!(reason=%reason, exe=%exe.display(), "re-executing agent");
            std::process::Command::new(&exe)
                .args(std::env::args().skip(1))
                .spawn()?;
            Ok(0)
        }
    }
}
