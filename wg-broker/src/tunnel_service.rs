// Tunnel backend process control

//! Tunnel backend service
//!
//! The [`TunnelBackend`] trait is what the control plane drives: start and
//! stop the tunnel from a rendered config, resolve its link identifier, and
//! run one control-protocol round trip. [`WgQuickBackend`] implements it with
//! `wg-quick` and the backend's UAPI Unix socket. When `wg-quick` picked the
//! Linux kernel module there is no socket, and the same messages are applied
//! over netlink instead.

use anyhow::{Context, Result};
use futures::future::{BoxFuture, FutureExt};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Command;

use crate::config::BackendConfig;

/// Kernel link identity of a running tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkId {
    pub name: String,
    pub index: u32,
}

/// Tunnel backend capability contract
pub trait TunnelBackend: Send + Sync {
    /// Bring the tunnel up from a rendered `[Interface]` config
    fn start<'a>(&'a self, name: &'a str, config: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Tear the tunnel down
    fn stop<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Whether the tunnel and its control socket are still present
    fn is_running<'a>(&'a self, name: &'a str) -> BoxFuture<'a, bool>;

    /// Resolve the link identifier of a started tunnel
    fn link_id<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<LinkId>>;

    /// Send one control-protocol message and return the raw reply
    fn uapi_command<'a>(&'a self, name: &'a str, message: &'a str) -> BoxFuture<'a, Result<String>>;
}

/// Validates that a name is safe to use in shell commands and file paths.
/// Only allows alphanumeric characters, hyphens, and underscores to prevent command injection.
fn validate_name(name: &str, field_name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("{} cannot be empty", field_name);
    }

    // Linux IFNAMSIZ minus the terminator
    if name.len() > 15 {
        anyhow::bail!("{} is longer than 15 characters: '{}'", field_name, name);
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        anyhow::bail!(
            "{} contains invalid characters: '{}'. Only alphanumeric, hyphens, and underscores are allowed",
            field_name,
            name
        );
    }

    Ok(())
}

/// Public wrapper for validating interface names.
///
/// # Errors
///
/// Returns an error if the interface name is empty, too long, or contains
/// characters other than alphanumerics, hyphens, and underscores.
pub fn validate_interface_name(name: &str) -> Result<()> {
    validate_name(name, "Interface name")
}

/// Resolve an interface index by name
pub fn resolve_link_index(name: &str) -> Result<u32> {
    let sys_path = format!("/sys/class/net/{}/ifindex", name);
    if let Ok(contents) = std::fs::read_to_string(&sys_path) {
        if let Ok(index) = contents.trim().parse::<u32>() {
            return Ok(index);
        }
    }

    // No sysfs (or not Linux): fall back to getifaddrs
    let interfaces = if_addrs::get_if_addrs().context("Failed to get interface addresses")?;
    interfaces
        .into_iter()
        .find(|iface| iface.name == name)
        .and_then(|iface| iface.index)
        .with_context(|| format!("No link index found for {}", name))
}

/// `wg-quick` driven backend with a UAPI socket per interface
pub struct WgQuickBackend {
    wg_quick: String,
    userspace_implementation: Option<String>,
    config_dir: PathBuf,
    uapi_socket_dir: PathBuf,
}

impl WgQuickBackend {
    /// Create a backend writing rendered configs into `config_dir`
    pub fn new(config: &BackendConfig, config_dir: &Path) -> Self {
        Self {
            wg_quick: config.wg_quick.clone(),
            userspace_implementation: config.userspace_implementation.clone(),
            config_dir: config_dir.to_path_buf(),
            uapi_socket_dir: config.uapi_socket_dir.clone(),
        }
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.config_dir.join(format!("{}.conf", name))
    }

    /// Real link name; wg-quick on macOS maps `wg0` to a `utunN` link
    fn link_name(&self, name: &str) -> String {
        let name_file = self.uapi_socket_dir.join(format!("{}.name", name));
        match std::fs::read_to_string(&name_file) {
            Ok(contents) if validate_interface_name(contents.trim()).is_ok() => {
                contents.trim().to_string()
            }
            _ => name.to_string(),
        }
    }

    fn socket_path(&self, name: &str) -> PathBuf {
        self.uapi_socket_dir
            .join(format!("{}.sock", self.link_name(name)))
    }

    fn wg_quick_command(&self, action: &str, path: &Path) -> Command {
        let mut cmd = Command::new(&self.wg_quick);
        cmd.arg(action).arg(path);
        if let Some(implementation) = &self.userspace_implementation {
            cmd.env("WG_QUICK_USERSPACE_IMPLEMENTATION", implementation);
        }
        cmd
    }

    async fn write_config(&self, name: &str, config: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.config_dir)
            .await
            .context("Failed to create config directory")?;

        let path = self.config_path(name);
        tokio::fs::write(&path, config)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        // Holds the private key
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .await
            .context("Failed to restrict config permissions")?;
        Ok(path)
    }

    async fn bring_up(&self, name: &str, config: &str) -> Result<()> {
        validate_interface_name(name)?;
        let path = self.write_config(name, config).await?;

        log::info!("Bringing up WireGuard interface: {}", name);

        let output = self
            .wg_quick_command("up", &path)
            .output()
            .await
            .context("Failed to execute wg-quick up")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("wg-quick up failed: {}", stderr);
        }

        log::info!("WireGuard interface {} is up", name);
        Ok(())
    }

    async fn bring_down(&self, name: &str) -> Result<()> {
        validate_interface_name(name)?;
        let path = self.config_path(name);

        log::info!("Bringing down WireGuard interface: {}", name);

        let output = self
            .wg_quick_command("down", &path)
            .output()
            .await
            .context("Failed to execute wg-quick down")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Don't fail if interface is already down
            if !stderr.contains("is not a WireGuard interface") {
                anyhow::bail!("wg-quick down failed: {}", stderr);
            }
        }

        let _ = tokio::fs::remove_file(&path).await;
        log::info!("WireGuard interface {} is down", name);
        Ok(())
    }

    async fn link_is_up(&self, name: &str) -> bool {
        let link = self.link_name(name);
        if !link_present(&link) {
            return false;
        }
        if self.socket_path(name).exists() {
            return true;
        }
        kernel::is_device(&link).await
    }

    async fn round_trip(&self, name: &str, message: &str) -> Result<String> {
        let path = self.socket_path(name);
        if !path.exists() {
            log::debug!("No UAPI socket for {}, using the kernel backend", name);
            return kernel::command(&self.link_name(name), message).await;
        }
        let stream = UnixStream::connect(&path)
            .await
            .with_context(|| format!("Failed to connect to UAPI socket {}", path.display()))?;
        let (reader, mut writer) = stream.into_split();

        // A blank line terminates the request
        let mut request = message.trim_end_matches('\n').to_string();
        request.push_str("\n\n");
        writer
            .write_all(request.as_bytes())
            .await
            .context("Failed to send UAPI command")?;

        read_reply(BufReader::new(reader)).await
    }
}

#[cfg(target_os = "linux")]
fn link_present(name: &str) -> bool {
    Path::new("/sys/class/net").join(name).exists()
}

#[cfg(not(target_os = "linux"))]
fn link_present(name: &str) -> bool {
    resolve_link_index(name).is_ok()
}

/// Kernel WireGuard control over netlink
#[cfg(target_os = "linux")]
mod kernel {
    use crate::uapi::{self, PeerCommand, PeerCounters};
    use anyhow::{Context, Result};
    use std::time::UNIX_EPOCH;
    use wireguard_control::{Backend, Device, DeviceUpdate, InterfaceName, PeerConfigBuilder};

    /// Reported when netlink gives no OS error code
    const EIO: i32 = 5;

    fn interface(name: &str) -> Result<InterfaceName> {
        name.parse()
            .with_context(|| format!("Invalid interface name: {}", name))
    }

    pub async fn is_device(name: &str) -> bool {
        let Ok(iface) = interface(name) else {
            return false;
        };
        tokio::task::spawn_blocking(move || Device::get(&iface, Backend::Kernel).is_ok())
            .await
            .unwrap_or(false)
    }

    /// Apply a control-protocol message and answer in the same format
    pub async fn command(name: &str, message: &str) -> Result<String> {
        let iface = interface(name)?;
        let message = message.to_string();
        tokio::task::spawn_blocking(move || apply(&iface, &message))
            .await
            .context("Netlink task panicked")?
    }

    fn apply(iface: &InterfaceName, message: &str) -> Result<String> {
        if message == uapi::GET {
            let device = Device::get(iface, Backend::Kernel)
                .context("Failed to get WireGuard device info")?;
            let peers: Vec<PeerCounters> = device
                .peers
                .iter()
                .map(|peer| PeerCounters {
                    public_key: peer.config.public_key.clone(),
                    rx_bytes: peer.stats.rx_bytes,
                    tx_bytes: peer.stats.tx_bytes,
                    last_handshake: peer
                        .stats
                        .last_handshake_time
                        .and_then(|t| t.duration_since(UNIX_EPOCH).ok()),
                })
                .collect();
            return Ok(uapi::render_status(&peers));
        }

        let command = uapi::parse_peer_command(message)?;
        let update = if command.remove {
            DeviceUpdate::new().remove_peer_by_key(&command.public_key)
        } else {
            DeviceUpdate::new().add_peer(peer_builder(&command))
        };
        match update.apply(iface, Backend::Kernel) {
            Ok(()) => Ok("errno=0\n".to_string()),
            Err(e) => {
                log::error!("Netlink update of {} failed: {}", iface, e);
                Ok(format!("errno={}\n", e.raw_os_error().unwrap_or(EIO)))
            }
        }
    }

    fn peer_builder(command: &PeerCommand) -> PeerConfigBuilder {
        let mut builder = PeerConfigBuilder::new(&command.public_key);
        if let Some(psk) = &command.preshared_key {
            builder = builder.set_preshared_key(psk.clone());
        }
        if let Some(endpoint) = command.endpoint {
            builder = builder.set_endpoint(endpoint);
        }
        if let Some(keepalive) = command.keepalive {
            builder = builder.set_persistent_keepalive_interval(keepalive);
        }
        if command.replace_allowed_ips {
            builder = builder.replace_allowed_ips();
        }
        for ip in &command.allowed_ips {
            builder = builder.add_allowed_ip(ip.address(), ip.prefix_len());
        }
        builder
    }
}

/// No kernel module outside Linux; the userspace socket is the only control path
#[cfg(not(target_os = "linux"))]
mod kernel {
    use anyhow::Result;

    pub async fn is_device(_name: &str) -> bool {
        false
    }

    pub async fn command(name: &str, _message: &str) -> Result<String> {
        anyhow::bail!("No UAPI socket for {}", name)
    }
}

/// Read reply lines up to the terminating blank line (or EOF)
async fn read_reply<R: tokio::io::AsyncBufRead + Unpin>(reader: R) -> Result<String> {
    let mut lines = reader.lines();
    let mut reply = String::new();
    while let Some(line) = lines
        .next_line()
        .await
        .context("Failed to read UAPI reply")?
    {
        if line.is_empty() {
            break;
        }
        reply.push_str(&line);
        reply.push('\n');
    }
    Ok(reply)
}

impl TunnelBackend for WgQuickBackend {
    fn start<'a>(&'a self, name: &'a str, config: &'a str) -> BoxFuture<'a, Result<()>> {
        self.bring_up(name, config).boxed()
    }

    fn stop<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
        self.bring_down(name).boxed()
    }

    fn is_running<'a>(&'a self, name: &'a str) -> BoxFuture<'a, bool> {
        self.link_is_up(name).boxed()
    }

    fn link_id<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<LinkId>> {
        async move {
            let link = self.link_name(name);
            let index = resolve_link_index(&link)?;
            Ok(LinkId { name: link, index })
        }
        .boxed()
    }

    fn uapi_command<'a>(&'a self, name: &'a str, message: &'a str) -> BoxFuture<'a, Result<String>> {
        self.round_trip(name, message).boxed()
    }
}
