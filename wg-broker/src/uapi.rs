// WireGuard cross-platform userspace API (UAPI) messages

//! Control protocol codec
//!
//! Builds the newline-separated `key=value` messages the tunnel backend
//! understands and parses its replies into peer telemetry.

use crate::types::{IpPrefix, PeerStatus};
use anyhow::{Context, Result};
use std::fmt::Write;
use std::net::SocketAddr;
use std::time::Duration;
use wireguard_control::Key;

/// Status query
pub const GET: &str = "get=1\n";

/// Peer (re)installation request
pub struct PeerUpdate<'a> {
    pub public_key: &'a Key,
    pub preshared_key: Option<&'a Key>,
    pub endpoint: SocketAddr,
    pub keepalive: u16,
    pub allowed_ips: &'a [IpPrefix],
}

/// Lowercase hex form used by the control protocol
pub fn key_hex(key: &Key) -> String {
    key.as_bytes().iter().map(|b| format!("{:02x}", b)).collect()
}

/// Decode a base64 key from an `InterfaceConfig` field
pub fn parse_key(base64: &str, field: &str) -> Result<Key> {
    Key::from_base64(base64.trim()).map_err(|e| anyhow::anyhow!("Invalid {}: {}", field, e))
}

/// Render a `set=1` message that replaces the peer's allowed IPs
pub fn set_peer(update: &PeerUpdate<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "set=1");
    let _ = writeln!(out, "public_key={}", key_hex(update.public_key));
    if let Some(psk) = update.preshared_key {
        let _ = writeln!(out, "preshared_key={}", key_hex(psk));
    }
    // SocketAddr brackets IPv6 hosts
    let _ = writeln!(out, "endpoint={}", update.endpoint);
    let _ = writeln!(out, "replace_allowed_ips=true");
    let _ = writeln!(out, "persistent_keepalive_interval={}", update.keepalive);
    for ip in update.allowed_ips {
        let _ = writeln!(out, "allowed_ip={}", ip);
    }
    out
}

/// Render a peer removal message
pub fn remove_peer(public_key: &Key) -> String {
    format!("set=1\npublic_key={}\nremove=true\n", key_hex(public_key))
}

/// A decoded `set=1` peer message
#[derive(Debug, Clone, PartialEq)]
pub struct PeerCommand {
    pub public_key: Key,
    pub remove: bool,
    pub preshared_key: Option<Key>,
    pub endpoint: Option<SocketAddr>,
    pub keepalive: Option<u16>,
    pub replace_allowed_ips: bool,
    pub allowed_ips: Vec<IpPrefix>,
}

/// Decode a `set=1` message carrying exactly one peer
pub fn parse_peer_command(message: &str) -> Result<PeerCommand> {
    let mut lines = message.lines().filter(|l| !l.is_empty());
    if lines.next() != Some("set=1") {
        anyhow::bail!("Not a set command");
    }

    let mut command: Option<PeerCommand> = None;
    for line in lines {
        let (name, value) = line
            .split_once('=')
            .with_context(|| format!("Malformed line in set command: {}", line))?;

        if name == "public_key" {
            if command.is_some() {
                anyhow::bail!("Set command names more than one peer");
            }
            let key = Key::from_hex(value)
                .map_err(|e| anyhow::anyhow!("Invalid public_key: {}", e))?;
            command = Some(PeerCommand {
                public_key: key,
                remove: false,
                preshared_key: None,
                endpoint: None,
                keepalive: None,
                replace_allowed_ips: false,
                allowed_ips: Vec::new(),
            });
            continue;
        }

        let peer = command.as_mut().context("Set command has no peer")?;
        match name {
            "remove" => peer.remove = value == "true",
            "preshared_key" => {
                let key = Key::from_hex(value)
                    .map_err(|e| anyhow::anyhow!("Invalid preshared_key: {}", e))?;
                peer.preshared_key = Some(key);
            }
            "endpoint" => peer.endpoint = Some(value.parse().context("Invalid endpoint")?),
            "persistent_keepalive_interval" => {
                peer.keepalive = Some(value.parse().context("Invalid keepalive")?)
            }
            "replace_allowed_ips" => peer.replace_allowed_ips = value == "true",
            "allowed_ip" => peer.allowed_ips.push(value.parse()?),
            _ => anyhow::bail!("Unsupported key in set command: {}", name),
        }
    }

    command.context("Set command has no peer")
}

/// Counters of one peer as read from the kernel
#[derive(Debug, Clone)]
pub struct PeerCounters {
    pub public_key: Key,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Time since the epoch of the last handshake
    pub last_handshake: Option<Duration>,
}

/// Render counters as a `get=1` reply
pub fn render_status(peers: &[PeerCounters]) -> String {
    let mut out = String::new();
    for peer in peers {
        let handshake = peer.last_handshake.unwrap_or_default();
        let _ = writeln!(out, "public_key={}", key_hex(&peer.public_key));
        let _ = writeln!(out, "tx_bytes={}", peer.tx_bytes);
        let _ = writeln!(out, "rx_bytes={}", peer.rx_bytes);
        let _ = writeln!(out, "last_handshake_time_sec={}", handshake.as_secs());
        let _ = writeln!(out, "last_handshake_time_nsec={}", handshake.subsec_nanos());
    }
    let _ = writeln!(out, "errno=0");
    out
}

/// Fail if the reply carries a non-zero `errno`
pub fn check_errno(reply: &str) -> Result<()> {
    for line in reply.lines() {
        if let Some(value) = line.strip_prefix("errno=") {
            let errno: i64 = value.trim().parse().context("Malformed errno in reply")?;
            if errno != 0 {
                anyhow::bail!("Backend rejected command (errno={})", errno);
            }
        }
    }
    Ok(())
}

/// Parse a `get=1` reply into one record per `public_key` block
///
/// Unknown keys are skipped and malformed numbers count as zero.
#[doc(hidden)]
pub fn parse_peer_status(reply: &str) -> Vec<PeerStatus> {
    let mut peers = Vec::new();
    let mut current: Option<PeerStatus> = None;

    for line in reply.lines() {
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        if name.is_empty() {
            continue;
        }

        if name == "public_key" {
            if let Some(done) = current.take() {
                peers.push(done);
            }
            current = Some(PeerStatus {
                public_key: hex_to_base64(value),
                ..Default::default()
            });
            continue;
        }

        // Interface-level keys precede the first peer
        let Some(status) = current.as_mut() else {
            continue;
        };
        match name {
            "tx_bytes" => status.tx_bytes = value.parse().unwrap_or(0),
            "rx_bytes" => status.rx_bytes = value.parse().unwrap_or(0),
            "last_handshake_time_sec" => {
                let secs: u64 = value.parse().unwrap_or(0);
                status.last_handshake_ms = status
                    .last_handshake_ms
                    .saturating_add(secs.saturating_mul(1000));
            }
            "last_handshake_time_nsec" => {
                let nsecs: u64 = value.parse().unwrap_or(0);
                status.last_handshake_ms = status.last_handshake_ms.saturating_add(nsecs / 1_000_000);
            }
            _ => {}
        }
    }

    if let Some(done) = current {
        peers.push(done);
    }
    peers
}

fn hex_to_base64(value: &str) -> String {
    match Key::from_hex(value.trim()) {
        Ok(key) => key.to_base64(),
        Err(_) => {
            log::warn!("Peer key in status reply is not valid hex: {}", value);
            value.to_string()
        }
    }
}
