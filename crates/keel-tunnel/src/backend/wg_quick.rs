//! Backend that drives the `wg-quick` tool.
//!
//! The configuration is rendered to `<runtime_dir>/<tunnel>.conf` (mode 0600)
//! and handed to `wg-quick up`/`wg-quick down`. Link presence is read from
//! sysfs. While a tunnel is up a monitor task polls sysfs and pushes `Down`
//! to the listeners when the interface disappears.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BackendError, TunnelBackend, TunnelListener};
use crate::config::TunnelConfiguration;
use crate::state::{LinkState, PermissionKind, PermissionRequest};
use crate::types::TunnelId;
use crate::wgconf;

/// Bit index of `CAP_NET_ADMIN` in the capability sets.
const CAP_NET_ADMIN: u32 = 12;

/// Configuration for [`WgQuickBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgQuickConfig {
    /// Directory holding rendered configuration files.
    pub runtime_dir: PathBuf,
    /// Path or name of the `wg-quick` executable.
    pub wg_quick_path: PathBuf,
    /// Directory listing network interfaces.
    pub sysfs_net_dir: PathBuf,
    /// How often the link monitor checks the interface.
    pub poll_interval: Duration,
}

impl Default for WgQuickConfig {
    fn default() -> Self {
        Self {
            runtime_dir: PathBuf::from("/run/keel"),
            wg_quick_path: PathBuf::from("wg-quick"),
            sysfs_net_dir: PathBuf::from("/sys/class/net"),
            poll_interval: Duration::from_secs(2),
        }
    }
}

impl WgQuickConfig {
    /// Sets the runtime directory.
    #[must_use]
    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    /// Sets the `wg-quick` executable.
    #[must_use]
    pub fn with_wg_quick_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.wg_quick_path = path.into();
        self
    }

    /// Sets the sysfs network directory.
    #[must_use]
    pub fn with_sysfs_net_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sysfs_net_dir = dir.into();
        self
    }

    /// Sets the link monitor poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

type Listeners = Arc<Mutex<Vec<Arc<dyn TunnelListener>>>>;

/// Linux backend built on `wg-quick`.
pub struct WgQuickBackend {
    config: WgQuickConfig,
    listeners: Listeners,
    monitors: Mutex<HashMap<TunnelId, JoinHandle<()>>>,
}

impl WgQuickBackend {
    /// Creates a backend with the given configuration.
    #[must_use]
    pub fn new(config: WgQuickConfig) -> Self {
        Self {
            config,
            listeners: Arc::new(Mutex::new(Vec::new())),
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the backend configuration.
    #[must_use]
    pub const fn config(&self) -> &WgQuickConfig {
        &self.config
    }

    /// Path of the rendered configuration file for `tunnel`.
    #[must_use]
    pub fn config_path(&self, tunnel: &TunnelId) -> PathBuf {
        self.config.runtime_dir.join(format!("{tunnel}.conf"))
    }

    /// Renders `config` to the tunnel's configuration file, readable by the
    /// owner only.
    pub async fn write_config(
        &self,
        tunnel: &TunnelId,
        config: &TunnelConfiguration,
    ) -> Result<PathBuf, BackendError> {
        tokio::fs::create_dir_all(&self.config.runtime_dir).await?;
        let path = self.config_path(tunnel);
        write_private(&path, wgconf::render(config).as_bytes()).await?;
        debug!(tunnel = %tunnel, path = %path.display(), "wrote tunnel configuration");
        Ok(path)
    }

    async fn link_present(&self, tunnel: &TunnelId) -> Result<bool, BackendError> {
        let path = self.config.sysfs_net_dir.join(tunnel.as_str());
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn wg_quick(&self, action: &str, target: &Path) -> Result<(), BackendError> {
        let command = format!(
            "{} {action} {}",
            self.config.wg_quick_path.display(),
            target.display()
        );
        debug!(command = %command, "running wg-quick");

        let output = Command::new(&self.config.wg_quick_path)
            .arg(action)
            .arg(target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::Command {
                command,
                detail: format!("{}: {}", output.status, stderr.trim()),
            });
        }
        Ok(())
    }

    fn start_monitor(&self, tunnel: &TunnelId) {
        let path = self.config.sysfs_net_dir.join(tunnel.as_str());
        let interval = self.config.poll_interval;
        let listeners = Arc::clone(&self.listeners);
        let name = tunnel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    warn!(tunnel = %name, "interface disappeared");
                    let listeners = listeners.lock().clone();
                    for listener in listeners.iter().filter(|l| l.name() == name.as_str()) {
                        listener.on_state_change(LinkState::Down);
                    }
                    break;
                }
            }
        });

        if let Some(previous) = self.monitors.lock().insert(tunnel.clone(), handle) {
            previous.abort();
        }
    }

    fn stop_monitor(&self, tunnel: &TunnelId) {
        if let Some(handle) = self.monitors.lock().remove(tunnel) {
            handle.abort();
        }
    }

    async fn bring_up(
        &self,
        tunnel: &TunnelId,
        config: &TunnelConfiguration,
    ) -> Result<LinkState, BackendError> {
        let path = self.write_config(tunnel, config).await?;

        if self.link_present(tunnel).await? {
            info!(tunnel = %tunnel, "interface already present, replacing it");
            self.stop_monitor(tunnel);
            self.wg_quick("down", &path).await?;
        }

        self.wg_quick("up", &path).await?;

        if !self.link_present(tunnel).await? {
            return Err(BackendError::Other(format!(
                "wg-quick reported success but {tunnel} does not exist"
            )));
        }

        self.start_monitor(tunnel);
        info!(tunnel = %tunnel, "interface up");
        Ok(LinkState::Up)
    }

    async fn bring_down(&self, tunnel: &TunnelId) -> Result<LinkState, BackendError> {
        self.stop_monitor(tunnel);

        if !self.link_present(tunnel).await? {
            debug!(tunnel = %tunnel, "interface already absent");
            return Ok(LinkState::Down);
        }

        let path = self.config_path(tunnel);
        let target = if tokio::fs::try_exists(&path).await? {
            path.clone()
        } else {
            PathBuf::from(tunnel.as_str())
        };
        self.wg_quick("down", &target).await?;

        if let Err(error) = tokio::fs::remove_file(&path).await {
            if error.kind() != std::io::ErrorKind::NotFound {
                warn!(tunnel = %tunnel, error = %error, "failed to remove configuration file");
            }
        }

        info!(tunnel = %tunnel, "interface down");
        Ok(LinkState::Down)
    }
}

impl Drop for WgQuickBackend {
    fn drop(&mut self) {
        for (_, handle) in self.monitors.lock().drain() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for WgQuickBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgQuickBackend")
            .field("config", &self.config)
            .field("monitors", &self.monitors.lock().len())
            .finish_non_exhaustive()
    }
}

impl TunnelBackend for WgQuickBackend {
    fn register_listener(&self, listener: Arc<dyn TunnelListener>) {
        self.listeners.lock().push(listener);
    }

    async fn current_state(&self, tunnel: &TunnelId) -> Result<LinkState, BackendError> {
        Ok(if self.link_present(tunnel).await? {
            LinkState::Up
        } else {
            LinkState::Down
        })
    }

    async fn apply(
        &self,
        tunnel: &TunnelId,
        desired: LinkState,
        config: Option<&TunnelConfiguration>,
    ) -> Result<LinkState, BackendError> {
        match desired {
            LinkState::Up => {
                let config = config.ok_or(BackendError::MissingConfiguration)?;
                self.bring_up(tunnel, config).await
            }
            LinkState::Down => self.bring_down(tunnel).await,
        }
    }

    fn request_permission(&self) -> Option<PermissionRequest> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        match has_net_admin(&status) {
            Some(false) => Some(PermissionRequest::new(
                PermissionKind::NetAdmin,
                "creating a WireGuard interface requires CAP_NET_ADMIN",
            )),
            Some(true) | None => None,
        }
    }
}

/// Reads the effective capability set from `/proc/<pid>/status` contents.
///
/// Returns `None` when the `CapEff` line is missing or malformed.
fn has_net_admin(status: &str) -> Option<bool> {
    let value = status
        .lines()
        .find_map(|line| line.strip_prefix("CapEff:"))?
        .trim();
    let caps = u64::from_str_radix(value, 16).ok()?;
    Some(caps & (1 << CAP_NET_ADMIN) != 0)
}

#[cfg(unix)]
async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .await?;
    // An existing file keeps its old mode on open.
    file.set_permissions(std::fs::Permissions::from_mode(0o600)).await?;
    file.write_all(contents).await?;
    file.flush().await
}

#[cfg(not(unix))]
async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    tokio::fs::write(path, contents).await
}
