//! Desktop Backend
//!
//! Hands the rendered profile to the system WireGuard tooling:
//! `wg-quick up|down` on Linux and macOS, the `wireguard.exe` tunnel
//! service on Windows. Needs the privileges those tools need.

use super::{BackendError, Platform, TransferCounters, TunnelBackend};
use crate::profile::TunnelProfile;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Longest interface name the kernel accepts
const MAX_INTERFACE_LEN: usize = 15;

/// Tunnel driven through the WireGuard command line tools
pub struct DesktopBackend {
    interface: String,
    config_dir: PathBuf,
    /// Profile file of the tunnel that is up
    active: Mutex<Option<PathBuf>>,
}

impl DesktopBackend {
    /// Create a backend for `interface` (also the profile file stem)
    pub fn new(interface: &str) -> Result<Self, BackendError> {
        let valid = !interface.is_empty()
            && interface.len() <= MAX_INTERFACE_LEN
            && interface
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(BackendError::Unavailable(format!(
                "invalid interface name {:?}",
                interface
            )));
        }

        Ok(Self {
            interface: interface.to_string(),
            config_dir: default_config_dir(),
            active: Mutex::new(None),
        })
    }

    /// Store profile files somewhere other than the per-user default
    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = dir.into();
        self
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    fn profile_path(&self) -> PathBuf {
        self.config_dir.join(format!("{}.conf", self.interface))
    }

    /// Create the profile directory, owner-only, refusing a symlinked one
    async fn prepare_dir(&self) -> Result<(), BackendError> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);
        builder.create(&self.config_dir).await.map_err(io_error)?;

        let meta = tokio::fs::symlink_metadata(&self.config_dir)
            .await
            .map_err(io_error)?;
        if !meta.is_dir() {
            return Err(BackendError::Io(format!(
                "{} is not a directory",
                self.config_dir.display()
            )));
        }

        // An existing directory keeps its old mode
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if meta.permissions().mode() & 0o077 != 0 {
                let owner_only = std::fs::Permissions::from_mode(0o700);
                tokio::fs::set_permissions(&self.config_dir, owner_only)
                    .await
                    .map_err(io_error)?;
            }
        }

        Ok(())
    }

    /// Write the profile to a freshly created 0600 file
    ///
    /// Whatever sits at the path is unlinked first and the new file is
    /// opened with `create_new`, so a planted symlink is never followed.
    async fn write_profile(&self, profile: &TunnelProfile) -> Result<PathBuf, BackendError> {
        self.prepare_dir().await?;

        let path = self.profile_path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("Replacing stale {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(e)),
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&path).await.map_err(io_error)?;
        file.write_all(profile.render().as_bytes())
            .await
            .map_err(io_error)?;
        file.flush().await.map_err(io_error)?;

        Ok(path)
    }

    fn up_command(&self, path: &Path) -> Command {
        if cfg!(windows) {
            let mut cmd = Command::new("wireguard.exe");
            cmd.arg("/installtunnelservice").arg(path);
            cmd
        } else {
            let mut cmd = Command::new("wg-quick");
            cmd.arg("up").arg(path);
            cmd
        }
    }

    fn down_command(&self, path: &Path) -> Command {
        if cfg!(windows) {
            let mut cmd = Command::new("wireguard.exe");
            cmd.arg("/uninstalltunnelservice").arg(&self.interface);
            cmd
        } else {
            let mut cmd = Command::new("wg-quick");
            cmd.arg("down").arg(path);
            cmd
        }
    }
}

fn io_error(e: std::io::Error) -> BackendError {
    BackendError::Io(e.to_string())
}

/// Per-user directory for profile files
///
/// `$XDG_RUNTIME_DIR/svpn` when set, else `~/.local/state/svpn`
/// (`%LOCALAPPDATA%\svpn` on Windows), else a user-suffixed temp dir.
fn default_config_dir() -> PathBuf {
    let var = |name: &str| {
        std::env::var_os(name)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    };

    if let Some(runtime) = var("XDG_RUNTIME_DIR") {
        return runtime.join("svpn");
    }
    if cfg!(windows) {
        if let Some(local) = var("LOCALAPPDATA") {
            return local.join("svpn");
        }
    } else if let Some(home) = var("HOME") {
        return home.join(".local").join("state").join("svpn");
    }

    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "user".into());
    std::env::temp_dir().join(format!("svpn-{}", user))
}

async fn run(mut cmd: Command) -> Result<Output, BackendError> {
    cmd.kill_on_drop(true);
    debug!("Running {:?}", cmd.as_std());
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();

    cmd.output()
        .await
        .map_err(|e| BackendError::Unavailable(format!("{}: {}", program, e)))
}

fn stderr_of(output: &Output) -> String {
    let text = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if text.is_empty() {
        format!("exited with {}", output.status)
    } else {
        text
    }
}

/// Sum `wg show <iface> transfer` lines (`<peer>\t<rx>\t<tx>`)
fn parse_transfer(stdout: &str) -> TransferCounters {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let _peer = parts.next()?;
            let rx = parts.next()?.parse::<u64>().ok()?;
            let tx = parts.next()?.parse::<u64>().ok()?;
            Some((rx, tx))
        })
        .fold(TransferCounters::default(), |acc, (rx, tx)| TransferCounters {
            bytes_received: acc.bytes_received + rx,
            bytes_sent: acc.bytes_sent + tx,
        })
}

#[async_trait]
impl TunnelBackend for DesktopBackend {
    fn platform(&self) -> Platform {
        Platform::Desktop
    }

    async fn establish(&self, profile: &TunnelProfile) -> Result<(), BackendError> {
        let mut active = self.active.lock().await;
        let path = self.write_profile(profile).await?;

        info!(
            "Bringing up {} towards {}",
            self.interface,
            profile.endpoint().network_address
        );
        let output = run(self.up_command(&path)).await?;
        if !output.status.success() {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(BackendError::Establish(stderr_of(&output)));
        }

        *active = Some(path);
        Ok(())
    }

    async fn teardown(&self) -> Result<(), BackendError> {
        let mut active = self.active.lock().await;
        let path = match active.clone() {
            Some(path) => path,
            None => {
                // A failed establish may still have left the file behind
                let leftover = self.profile_path();
                if !tokio::fs::try_exists(&leftover).await.unwrap_or(false) {
                    return Ok(());
                }
                leftover
            }
        };

        info!("Tearing down {}", self.interface);
        let output = run(self.down_command(&path)).await?;

        if !output.status.success() && active.is_some() {
            return Err(BackendError::Teardown(stderr_of(&output)));
        }

        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!("Could not remove {}: {}", path.display(), e);
        }
        *active = None;
        Ok(())
    }

    async fn transfer(&self) -> Option<TransferCounters> {
        if self.active.lock().await.is_none() {
            return None;
        }

        let mut cmd = Command::new("wg");
        cmd.args(["show", self.interface.as_str(), "transfer"]);
        let output = run(cmd).await.ok()?;
        if !output.status.success() {
            return None;
        }

        Some(parse_transfer(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_name() {
        assert!(DesktopBackend::new("svpn0").is_ok());
        assert!(DesktopBackend::new("").is_err());
        assert!(DesktopBackend::new("this-name-is-too-long").is_err());
        assert!(DesktopBackend::new("../etc").is_err());
    }

    #[test]
    fn test_parse_transfer() {
        let out = "peerA=\t1024\t2048\npeerB=\t10\t20\n";
        let counters = parse_transfer(out);

        assert_eq!(counters.bytes_received, 1034);
        assert_eq!(counters.bytes_sent, 2068);
        assert_eq!(parse_transfer(""), TransferCounters::default());
    }

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("svpn-{}-{}", name, std::process::id()))
    }

    fn profile() -> TunnelProfile {
        crate::profile::ProfileBuilder::default()
            .build(
                &crate::keys::KeyMaterial::new("SecretKey==", "PublicKey=="),
                &crate::endpoint::Endpoint::new("Germany", "192.0.2.30:51820", "ServerKey=="),
                "10.8.0.2/24".parse().unwrap(),
                &["1.1.1.1".parse().unwrap()],
            )
            .unwrap()
    }

    #[test]
    fn test_default_dir_is_per_user() {
        assert_ne!(default_config_dir(), std::env::temp_dir().join("svpn"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_profile_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = scratch_dir("private");
        let backend = DesktopBackend::new("svpntest1").unwrap().with_config_dir(&dir);

        let path = backend.write_profile(&profile()).await.unwrap();
        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode();
        let dir_mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);
        assert_eq!(dir_mode & 0o777, 0o700);
        assert!(std::fs::read_to_string(&path).unwrap().contains("PrivateKey = SecretKey=="));

        // Rewriting replaces the old file
        backend.write_profile(&profile()).await.unwrap();

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_planted_symlink_not_followed() {
        let dir = scratch_dir("symlink");
        let target = scratch_dir("symlink-target");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(&target, "untouched").unwrap();

        let backend = DesktopBackend::new("svpntest2").unwrap().with_config_dir(&dir);
        std::os::unix::fs::symlink(&target, backend.profile_path()).unwrap();

        let path = backend.write_profile(&profile()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "untouched");
        assert!(!std::fs::symlink_metadata(&path).unwrap().file_type().is_symlink());

        std::fs::remove_dir_all(&dir).unwrap();
        std::fs::remove_file(&target).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_dir_refused() {
        let real = scratch_dir("real-dir");
        let link = scratch_dir("linked-dir");
        std::fs::create_dir_all(&real).unwrap();
        let _ = std::fs::remove_file(&link);
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let backend = DesktopBackend::new("svpntest3").unwrap().with_config_dir(&link);
        let err = backend.write_profile(&profile()).await.unwrap_err();
        assert!(matches!(err, BackendError::Io(_)));

        std::fs::remove_file(&link).unwrap();
        std::fs::remove_dir_all(&real).unwrap();
    }

    #[tokio::test]
    async fn test_teardown_without_tunnel() {
        let dir = std::env::temp_dir().join(format!("svpn-desktop-{}", std::process::id()));
        let backend = DesktopBackend::new("svpntest0").unwrap().with_config_dir(&dir);

        // Nothing up and no leftover file: no command is run
        assert!(backend.teardown().await.is_ok());
        assert!(backend.transfer().await.is_none());
    }
}
