// Shared types between the broker, the control plane and the client

//! Shared data structures
//!
//! This module defines the records that cross the IPC boundary: tunnel
//! interface intent, peer telemetry, firewall payloads, address prefixes and
//! the error-code taxonomy reported to the unprivileged caller.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Address plus prefix length.
///
/// Identity is the `(address, prefix_len)` pair; host bits are not masked, so
/// `10.0.0.1/24` and `10.0.0.0/24` are distinct entries for bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpPrefix {
    address: IpAddr,
    prefix_len: u8,
}

impl IpPrefix {
    /// Create a prefix, rejecting lengths longer than the address family allows
    pub fn new(address: IpAddr, prefix_len: u8) -> anyhow::Result<Self> {
        let max = Self::max_len(&address);
        if prefix_len > max {
            anyhow::bail!("Prefix length must be <= {}", max);
        }
        Ok(Self {
            address,
            prefix_len,
        })
    }

    /// Single-host prefix (/32 or /128)
    pub fn host(address: IpAddr) -> Self {
        Self {
            prefix_len: Self::max_len(&address),
            address,
        }
    }

    fn max_len(address: &IpAddr) -> u8 {
        match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }

    /// The address part
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// The prefix length
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// True for a zero-length mask (a default route)
    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }

    /// True for IPv6 prefixes
    pub fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }

    /// Network address with host bits cleared
    pub fn network(&self) -> IpAddr {
        match self.address {
            IpAddr::V4(ip) => {
                let mask = if self.prefix_len == 0 {
                    0u32
                } else {
                    !0u32 << (32 - self.prefix_len)
                };
                IpAddr::V4(Ipv4Addr::from(u32::from(ip) & mask))
            }
            IpAddr::V6(ip) => {
                let mask = if self.prefix_len == 0 {
                    0u128
                } else {
                    !0u128 << (128 - self.prefix_len)
                };
                IpAddr::V6(Ipv6Addr::from(u128::from(ip) & mask))
            }
        }
    }

    /// Check whether `ip` falls inside this prefix
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network(), ip) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                IpPrefix {
                    address: ip,
                    prefix_len: self.prefix_len,
                }
                .network()
                    == self.network()
            }
            _ => false,
        }
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = anyhow::Error;

    /// Parses `addr/len`; a bare address is taken as a host prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use anyhow::Context;

        match s.split_once('/') {
            Some((addr, len)) => {
                let address: IpAddr = addr.trim().parse().context("Invalid IP address")?;
                let prefix_len: u8 = len.trim().parse().context("Invalid prefix length")?;
                Self::new(address, prefix_len)
            }
            None => {
                let address: IpAddr = s.trim().parse().context("Invalid IP address")?;
                Ok(Self::host(address))
            }
        }
    }
}

impl TryFrom<String> for IpPrefix {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IpPrefix> for String {
    fn from(value: IpPrefix) -> Self {
        value.to_string()
    }
}

/// Position of a peer in a multi-hop chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HopRole {
    #[default]
    Single,
    MultiHopEntry,
    MultiHopExit,
}

impl HopRole {
    /// Whether the peer's server address must bypass the tunnel
    pub fn needs_exclusion(&self) -> bool {
        !matches!(self, HopRole::MultiHopExit)
    }
}

/// Tunnel interface intent, passed by value into every operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InterfaceConfig {
    pub interface_name: String,
    /// Base64 private key of the local interface
    pub private_key: String,
    pub addresses: Vec<IpPrefix>,
    pub listen_port: Option<u16>,
    pub mtu: Option<u16>,
    pub dns_servers: Vec<IpAddr>,
    /// Base64 public key of the peer
    pub server_public_key: String,
    /// Base64 pre-shared key of the peer
    pub server_psk_key: Option<String>,
    pub server_ipv4_addr_in: Option<Ipv4Addr>,
    pub server_ipv6_addr_in: Option<Ipv6Addr>,
    pub server_port: u16,
    #[serde(rename = "allowedIPAddressRanges")]
    pub allowed_ip_address_ranges: Vec<IpPrefix>,
    pub hop_role: HopRole,
    pub kill_switch_enabled: bool,
}

impl InterfaceConfig {
    /// Render a wg-quick style config file.
    ///
    /// `extra` entries are appended to the `[Interface]` section in order.
    /// Returns an empty string when the private key is missing or when any
    /// rendered text field spans more than one line.
    pub fn to_wg_conf(&self, extra: &[(&str, &str)]) -> String {
        use std::fmt::Write;

        if self.private_key.is_empty() {
            log::error!("Cannot render config for {}: no private key", self.interface_name);
            return String::new();
        }
        if let Some(field) = self.multiline_field(extra) {
            log::error!(
                "Cannot render config for {}: {} contains a line break",
                self.interface_name,
                field
            );
            return String::new();
        }

        let mut out = String::new();
        let _ = writeln!(out, "[Interface]");
        let _ = writeln!(out, "PrivateKey = {}", self.private_key);
        if !self.addresses.is_empty() {
            let _ = writeln!(out, "Address = {}", join(&self.addresses));
        }
        if let Some(port) = self.listen_port {
            let _ = writeln!(out, "ListenPort = {}", port);
        }
        if let Some(mtu) = self.mtu {
            let _ = writeln!(out, "MTU = {}", mtu);
        }
        if !self.dns_servers.is_empty() {
            let _ = writeln!(out, "DNS = {}", join(&self.dns_servers));
        }
        for (key, value) in extra {
            let _ = writeln!(out, "{} = {}", key, value);
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "[Peer]");
        let _ = writeln!(out, "PublicKey = {}", self.server_public_key);
        if let Some(psk) = &self.server_psk_key {
            let _ = writeln!(out, "PresharedKey = {}", psk);
        }
        if !self.allowed_ip_address_ranges.is_empty() {
            let _ = writeln!(out, "AllowedIPs = {}", join(&self.allowed_ip_address_ranges));
        }
        if let Some(ip) = self.server_ipv4_addr_in {
            let _ = writeln!(out, "Endpoint = {}:{}", ip, self.server_port);
        } else if let Some(ip) = self.server_ipv6_addr_in {
            let _ = writeln!(out, "Endpoint = [{}]:{}", ip, self.server_port);
        }
        out
    }

    /// Name of the first rendered text field holding `\n` or `\r`
    pub fn multiline_field(&self, extra: &[(&str, &str)]) -> Option<String> {
        let breaks = |s: &str| s.contains(['\n', '\r']);
        let fields = [
            ("interfaceName", Some(self.interface_name.as_str())),
            ("privateKey", Some(self.private_key.as_str())),
            ("serverPublicKey", Some(self.server_public_key.as_str())),
            ("serverPskKey", self.server_psk_key.as_deref()),
        ];
        if let Some((name, _)) = fields
            .iter()
            .find(|(_, value)| value.is_some_and(breaks))
        {
            return Some(name.to_string());
        }
        extra
            .iter()
            .find(|(key, value)| breaks(key) || breaks(value))
            .map(|(key, _)| key.trim().to_string())
    }

    /// Server endpoint addresses that are present, IPv4 first
    pub fn server_addresses(&self) -> Vec<IpAddr> {
        self.server_ipv4_addr_in
            .map(IpAddr::V4)
            .into_iter()
            .chain(self.server_ipv6_addr_in.map(IpAddr::V6))
            .collect()
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Per-peer telemetry, recomputed on every status query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    /// Base64 public key
    pub public_key: String,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    /// Milliseconds since epoch, 0 if the peer never completed a handshake
    pub last_handshake_ms: u64,
}

/// Split-tunnel selector of the firewall payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SplitTunnelType {
    /// Block everything except the VPN server
    #[default]
    AppBased,
    /// Block only the site list
    SiteList,
    /// Block everything except the VPN server and the site list
    Hybrid,
}

/// Firewall/route configuration payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FirewallConfig {
    pub split_tunnel_type: SplitTunnelType,
    pub vpn_server: Option<IpAddr>,
    pub split_tunnel_sites: Vec<IpPrefix>,
    pub split_tunnel_apps: Vec<String>,
    pub dns1: Option<IpAddr>,
    pub dns2: Option<IpAddr>,
    pub kill_switch_enabled: bool,
    pub vpn_adapter_index: Option<u32>,
    pub inet_adapter_index: Option<u32>,
}

/// Unsolicited notification pushed to connected sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DaemonEvent {
    /// The tunnel backend exited or stopped answering
    BackendFailure { interface: String },
}

/// Error codes shared with the unprivileged caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    NoError,
    InternalError,
    PermissionError,
    NotFoundError,
    BackendFailure,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::NoError => "no error",
            ErrorCode::InternalError => "internal error",
            ErrorCode::PermissionError => "permission error",
            ErrorCode::NotFoundError => "not found",
            ErrorCode::BackendFailure => "backend failure",
        };
        f.write_str(s)
    }
}
