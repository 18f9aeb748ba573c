use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::config::RestartConfig;

const UNIT_NAME: &str = "mesh-agent";

/// Render the unit. The service manager restarts us after a requested
/// restart (exit status 75) and gives up on restart storms.
fn render_unit(exec_start: &str, policy: &RestartConfig, system: bool) -> String {
    let (after, wanted_by) = if system {
        ("After=network-online.target\nWants=network-online.target\n", "multi-user.target")
    } else {
        ("", "default.target")
    };
    format!(
        "[Unit]\nDescription=Mesh Agent\n{after}StartLimitIntervalSec={window}\nStartLimitBurst={burst}\n\n\
         [Service]\nExecStart={exec_start} run\nRestart=always\nRestartSec={delay}\n\n\
         [Install]\nWantedBy={wanted_by}\n",
        window = policy.window_secs,
        burst = policy.max_restarts.saturating_mul(3).max(5),
        delay = policy.base_backoff_secs.clamp(1, 10),
    )
}

fn exec_start(binary: &Path, config_path: Option<&Path>) -> String {
    match config_path {
        Some(cfg) => format!("{} --config {}", binary.display(), cfg.display()),
        None => binary.display().to_string(),
    }
}

pub async fn install(system: bool, config_path: Option<PathBuf>, policy: &RestartConfig) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let binary = std::env::current_exe().unwrap_or_else(|_| PathBuf::from(UNIT_NAME));
    if system {
        let target = Path::new("/usr/local/bin").join(UNIT_NAME);
        if tokio::fs::copy(&binary, &target).await.is_err() {
            println!("failed to copy agent to {}. try again with sudo", target.display());
            return Ok(());
        }
        let _ = tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755)).await;

        let unit_path = Path::new("/etc/systemd/system").join(format!("{UNIT_NAME}.service"));
        let unit = render_unit(&exec_start(&target, config_path.as_deref()), policy, true);
        if tokio::fs::write(&unit_path, unit).await.is_err() {
            println!("failed to write {}. try again with sudo", unit_path.display());
            return Ok(());
        }
        let _ = std::process::Command::new("systemctl").args(["daemon-reload"]).status();
        let _ = std::process::Command::new("systemctl").args(["enable", "--now", UNIT_NAME]).status();
        println!("installed and started system service {UNIT_NAME}");
        return Ok(());
    }

    let bin_dir = dirs::home_dir().context("home dir")?.join(".local/bin");
    tokio::fs::create_dir_all(&bin_dir).await?;
    let target = bin_dir.join(UNIT_NAME);
    if target != binary {
        tokio::fs::copy(&binary, &target)
            .await
            .with_context(|| format!("copying agent to {}", target.display()))?;
        let _ = tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755)).await;
    }

    let systemd_dir = dirs::config_dir().context("config dir")?.join("systemd/user");
    tokio::fs::create_dir_all(&systemd_dir).await?;
    let service_path = systemd_dir.join(format!("{UNIT_NAME}.service"));
    let unit = render_unit(&exec_start(&target, config_path.as_deref()), policy, false);
    tokio::fs::write(&service_path, unit).await?;

    if std::process::Command::new("systemctl").args(["--user", "daemon-reload"]).status().is_ok() {
        let _ = std::process::Command::new("systemctl").args(["--user", "enable", "--now", UNIT_NAME]).status();
        println!("installed and started systemd user service {UNIT_NAME}");
    } else {
        println!("service file written to {}. enable with: systemctl --user enable --now {UNIT_NAME}", service_path.display());
    }
    println!("note: user services do not start at boot without a user session. to enable lingering: 'loginctl enable-linger $(whoami)'");
    Ok(())
}
