//! Firewall policy engine
//!
//! Keeps a priority-ordered set of named rule anchors and derives their
//! desired content from kill-switch, interface, peer and LAN-bypass intent.
//! The packet filter behind it is a [`PacketFilter`] variant chosen per
//! platform; every anchor write is skipped when the filter already holds the
//! same content, so repeated enables and disables are no-ops.

pub mod iptables;
pub mod pf;

use anyhow::Result;
use futures::future::{BoxFuture, FutureExt};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use crate::config::FirewallBackendKind;
use crate::tunnel_service::LinkId;
use crate::types::{FirewallConfig, InterfaceConfig, IpPrefix, SplitTunnelType};

/// Address family an anchor applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
    Both,
}

impl Family {
    pub fn includes_v4(self) -> bool {
        matches!(self, Family::V4 | Family::Both)
    }

    pub fn includes_v6(self) -> bool {
        matches!(self, Family::V6 | Family::Both)
    }
}

/// Named rule group; declaration order is evaluation priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Anchor {
    AllowLoopback,
    BlockAll,
    AllowNets,
    BlockNets,
    AllowVpn,
    BlockIpv6,
    AllowDhcp,
    AllowLan,
    BlockDns,
    AllowDns,
}

impl Anchor {
    pub const ALL: [Anchor; 10] = [
        Anchor::AllowLoopback,
        Anchor::BlockAll,
        Anchor::AllowNets,
        Anchor::BlockNets,
        Anchor::AllowVpn,
        Anchor::BlockIpv6,
        Anchor::AllowDhcp,
        Anchor::AllowLan,
        Anchor::BlockDns,
        Anchor::AllowDns,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Anchor::AllowLoopback => "000.allowLoopback",
            Anchor::BlockAll => "100.blockAll",
            Anchor::AllowNets => "110.allowNets",
            Anchor::BlockNets => "120.blockNets",
            Anchor::AllowVpn => "200.allowVPN",
            Anchor::BlockIpv6 => "250.blockIPv6",
            Anchor::AllowDhcp => "290.allowDHCP",
            Anchor::AllowLan => "300.allowLAN",
            Anchor::BlockDns => "310.blockDNS",
            Anchor::AllowDns => "320.allowDNS",
        }
    }

    pub fn family(self) -> Family {
        match self {
            Anchor::AllowLoopback | Anchor::BlockAll | Anchor::AllowDhcp | Anchor::AllowLan => {
                Family::Both
            }
            Anchor::BlockIpv6 => Family::V6,
            Anchor::AllowNets
            | Anchor::BlockNets
            | Anchor::AllowVpn
            | Anchor::BlockDns
            | Anchor::AllowDns => Family::V4,
        }
    }

    /// Whether the anchor drops traffic rather than accepting it
    pub fn is_block(self) -> bool {
        matches!(
            self,
            Anchor::BlockAll | Anchor::BlockNets | Anchor::BlockIpv6 | Anchor::BlockDns
        )
    }

    /// Catch-all anchors that only apply when nothing else matched
    pub fn is_fallback(self) -> bool {
        matches!(self, Anchor::BlockAll | Anchor::BlockIpv6)
    }
}

/// Desired content of one anchor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnchorRules {
    pub enabled: bool,
    /// Address table the anchor filters against
    pub table: Vec<IpPrefix>,
    /// Interfaces the anchor's accept is scoped to
    pub interfaces: Vec<String>,
}

impl AnchorRules {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_table(enabled: bool, table: Vec<IpPrefix>) -> Self {
        Self {
            enabled,
            table,
            interfaces: Vec::new(),
        }
    }
}

/// Platform packet filter contract
pub trait PacketFilter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create the root hook and the empty anchors
    fn install(&self) -> BoxFuture<'_, Result<()>>;

    /// Remove the root hook and every anchor
    fn uninstall(&self) -> BoxFuture<'_, Result<()>>;

    /// Replace an anchor's rules; a disabled anchor is flushed
    fn apply<'a>(&'a self, anchor: Anchor, rules: &'a AnchorRules) -> BoxFuture<'a, Result<()>>;
}

/// Filter for hosts without a packet filter
#[derive(Debug, Default)]
pub struct NoopFilter;

impl PacketFilter for NoopFilter {
    fn name(&self) -> &'static str {
        "none"
    }

    fn install(&self) -> BoxFuture<'_, Result<()>> {
        async {
            log::warn!("No packet filter configured, kill switch is not enforced");
            Ok(())
        }
        .boxed()
    }

    fn uninstall(&self) -> BoxFuture<'_, Result<()>> {
        async { Ok(()) }.boxed()
    }

    fn apply<'a>(&'a self, anchor: Anchor, rules: &'a AnchorRules) -> BoxFuture<'a, Result<()>> {
        async move {
            log::debug!("Anchor {} enabled={} (not enforced)", anchor.name(), rules.enabled);
            Ok(())
        }
        .boxed()
    }
}

/// Pick the packet filter variant
pub fn select_filter(kind: FirewallBackendKind) -> Arc<dyn PacketFilter> {
    match kind {
        FirewallBackendKind::Iptables => Arc::new(iptables::IptablesFilter::default()),
        FirewallBackendKind::Pf => Arc::new(pf::PfFilter::default()),
        FirewallBackendKind::None => Arc::new(NoopFilter),
        FirewallBackendKind::Auto => {
            if cfg!(target_os = "linux") {
                Arc::new(iptables::IptablesFilter::default())
            } else if cfg!(target_os = "macos") {
                Arc::new(pf::PfFilter::default())
            } else {
                Arc::new(NoopFilter)
            }
        }
    }
}

/// Loopback resolvers that stay reachable under the DNS block
const LOCAL_RESOLVERS: [IpAddr; 2] = [
    IpAddr::V4(Ipv4Addr::LOCALHOST),
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 53)),
];

/// Link-local, private and multicast ranges accepted by `300.allowLAN`
fn private_ranges() -> Vec<IpPrefix> {
    let v4 = [
        (Ipv4Addr::new(10, 0, 0, 0), 8),
        (Ipv4Addr::new(172, 16, 0, 0), 12),
        (Ipv4Addr::new(192, 168, 0, 0), 16),
        (Ipv4Addr::new(169, 254, 0, 0), 16),
        (Ipv4Addr::new(224, 0, 0, 0), 4),
        (Ipv4Addr::BROADCAST, 32),
    ];
    let v6 = [
        (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),
        (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),
        (Ipv6Addr::new(0xff00, 0, 0, 0, 0, 0, 0, 0), 8),
    ];
    v4.iter()
        .map(|(a, l)| (IpAddr::V4(*a), *l))
        .chain(v6.iter().map(|(a, l)| (IpAddr::V6(*a), *l)))
        .filter_map(|(a, l)| IpPrefix::new(a, l).ok())
        .collect()
}

/// Anchor contents implied by a kill-switch configuration
pub fn kill_switch_plan(config: &FirewallConfig) -> BTreeMap<Anchor, AnchorRules> {
    let server: Vec<IpPrefix> = config.vpn_server.map(IpPrefix::host).into_iter().collect();

    let (block_all, allow_nets, block_nets) = match config.split_tunnel_type {
        SplitTunnelType::AppBased => (true, Some(server), None),
        SplitTunnelType::SiteList => (false, None, Some(config.split_tunnel_sites.clone())),
        SplitTunnelType::Hybrid => {
            let mut allowed = server;
            allowed.extend(config.split_tunnel_sites.iter().copied());
            (true, Some(allowed), None)
        }
    };

    let resolvers: Vec<IpPrefix> = config
        .dns1
        .into_iter()
        .chain(config.dns2)
        .chain(LOCAL_RESOLVERS)
        .map(IpPrefix::host)
        .collect();

    let mut plan = BTreeMap::new();
    plan.insert(Anchor::AllowLoopback, AnchorRules::enabled());
    plan.insert(
        Anchor::BlockAll,
        if block_all { AnchorRules::enabled() } else { AnchorRules::disabled() },
    );
    plan.insert(
        Anchor::AllowNets,
        allow_nets.map_or_else(AnchorRules::disabled, |t| AnchorRules::with_table(true, t)),
    );
    plan.insert(
        Anchor::BlockNets,
        block_nets.map_or_else(AnchorRules::disabled, |t| AnchorRules::with_table(true, t)),
    );
    plan.insert(Anchor::BlockIpv6, AnchorRules::enabled());
    plan.insert(Anchor::AllowDhcp, AnchorRules::enabled());
    plan.insert(Anchor::BlockDns, AnchorRules::enabled());
    plan.insert(Anchor::AllowDns, AnchorRules::with_table(true, resolvers));
    plan
}

/// Stateful owner of the host's anchors
pub struct FirewallEngine {
    filter: Arc<dyn PacketFilter>,
    installed: bool,
    applied: BTreeMap<Anchor, AnchorRules>,
    /// Set by `enable_kill_switch`, cleared only by `disable_kill_switch`
    kill_switch: bool,
    /// Protected tunnel interfaces
    tunnels: BTreeSet<String>,
    /// Peer endpoint allowances by base64 public key
    peers: BTreeMap<String, PeerAllowance>,
    lan_bypass: BTreeSet<IpPrefix>,
}

/// Endpoint addresses one tunnel's peer may reach outside the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAllowance {
    pub interface: String,
    pub addresses: Vec<IpAddr>,
}

/// Engine shared between the broker and every tunnel controller
pub type SharedFirewall = Arc<tokio::sync::Mutex<FirewallEngine>>;

impl FirewallEngine {
    pub fn new(filter: Arc<dyn PacketFilter>) -> Self {
        Self {
            filter,
            installed: false,
            applied: BTreeMap::new(),
            kill_switch: false,
            tunnels: BTreeSet::new(),
            peers: BTreeMap::new(),
            lan_bypass: BTreeSet::new(),
        }
    }

    pub fn shared(filter: Arc<dyn PacketFilter>) -> SharedFirewall {
        Arc::new(tokio::sync::Mutex::new(Self::new(filter)))
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Rules currently held by the filter
    pub fn anchor(&self, anchor: Anchor) -> Option<&AnchorRules> {
        self.applied.get(&anchor)
    }

    async fn ensure_installed(&mut self) -> Result<()> {
        if !self.installed {
            log::info!("Installing {} firewall anchors", self.filter.name());
            self.filter.install().await?;
            self.installed = true;
            self.applied.clear();
        }
        Ok(())
    }

    async fn set(&mut self, anchor: Anchor, rules: AnchorRules) -> Result<()> {
        let current = self.applied.get(&anchor);
        // A never-written anchor is empty after install
        if current == Some(&rules) || (current.is_none() && rules == AnchorRules::disabled()) {
            return Ok(());
        }
        self.filter.apply(anchor, &rules).await?;
        log::debug!("Anchor {} enabled={}", anchor.name(), rules.enabled);
        self.applied.insert(anchor, rules);
        Ok(())
    }

    fn vpn_rules(&self) -> AnchorRules {
        let table: BTreeSet<IpPrefix> = self
            .peers
            .values()
            .flat_map(|peer| peer.addresses.iter().copied())
            .map(IpPrefix::host)
            .collect();
        AnchorRules {
            enabled: !self.tunnels.is_empty() || !table.is_empty(),
            table: table.into_iter().collect(),
            interfaces: self.tunnels.iter().cloned().collect(),
        }
    }

    fn lan_rules(&self) -> AnchorRules {
        let mut table = private_ranges();
        table.extend(self.lan_bypass.iter().copied());
        table.sort();
        table.dedup();
        AnchorRules::with_table(true, table)
    }

    /// Install the anchors implied by the split-tunnel mode
    pub async fn enable_kill_switch(&mut self, config: &FirewallConfig) -> Result<()> {
        self.ensure_installed().await?;
        self.kill_switch = true;
        log::info!(
            "Enabling kill switch ({:?}, {} sites)",
            config.split_tunnel_type,
            config.split_tunnel_sites.len()
        );

        for (anchor, rules) in kill_switch_plan(config) {
            self.set(anchor, rules).await?;
        }
        let vpn = self.vpn_rules();
        self.set(Anchor::AllowVpn, AnchorRules { enabled: true, ..vpn }).await?;
        let lan = self.lan_rules();
        self.set(Anchor::AllowLan, lan).await?;
        Ok(())
    }

    /// Remove every anchor; calling it with nothing installed succeeds
    pub async fn disable_kill_switch(&mut self) -> Result<()> {
        self.kill_switch = false;
        self.tunnels.clear();
        self.peers.clear();
        self.uninstall().await
    }

    async fn uninstall(&mut self) -> Result<()> {
        if !self.installed {
            return Ok(());
        }
        log::info!("Disabling kill switch");
        self.filter.uninstall().await?;
        self.installed = false;
        self.applied.clear();
        Ok(())
    }

    /// Protect a tunnel interface: everything but the tunnel is blocked
    pub async fn enable_interface(&mut self, link: &LinkId) -> Result<()> {
        self.ensure_installed().await?;
        log::info!("Protecting interface {} (index {})", link.name, link.index);
        self.tunnels.insert(link.name.clone());

        self.set(Anchor::AllowLoopback, AnchorRules::enabled()).await?;
        self.set(Anchor::BlockAll, AnchorRules::enabled()).await?;
        let vpn = self.vpn_rules();
        self.set(Anchor::AllowVpn, vpn).await?;
        self.set(Anchor::AllowDhcp, AnchorRules::enabled()).await?;
        self.set(Anchor::BlockIpv6, AnchorRules::enabled()).await?;
        Ok(())
    }

    /// Drop one interface's protection and its peers' allowances.
    ///
    /// Anchors are removed once no protected interface is left, unless the
    /// kill switch was enabled on its own.
    pub async fn disable_interface(&mut self, name: &str) -> Result<()> {
        let was_protected = self.tunnels.remove(name);
        let peers_before = self.peers.len();
        self.peers.retain(|_, peer| peer.interface != name);
        if !was_protected && self.peers.len() == peers_before {
            return Ok(());
        }

        if self.tunnels.is_empty() && !self.kill_switch {
            return self.uninstall().await;
        }
        log::info!("Interface {} no longer protected", name);
        if !self.installed {
            return Ok(());
        }
        let vpn = self.vpn_rules();
        let vpn = AnchorRules {
            enabled: vpn.enabled || self.kill_switch,
            ..vpn
        };
        self.set(Anchor::AllowVpn, vpn).await
    }

    /// Allow the peer's endpoint addresses outside the tunnel
    pub async fn enable_peer_traffic(
        &mut self,
        interface: &str,
        config: &InterfaceConfig,
    ) -> Result<()> {
        self.ensure_installed().await?;
        self.peers.insert(
            config.server_public_key.clone(),
            PeerAllowance {
                interface: interface.to_string(),
                addresses: config.server_addresses(),
            },
        );
        let vpn = self.vpn_rules();
        self.set(Anchor::AllowVpn, vpn).await
    }

    pub fn peer_allowance(&self, public_key: &str) -> Option<PeerAllowance> {
        self.peers.get(public_key).cloned()
    }

    /// Put back an allowance read with [`Self::peer_allowance`]
    pub async fn restore_peer_traffic(
        &mut self,
        public_key: &str,
        previous: Option<PeerAllowance>,
    ) -> Result<()> {
        match previous {
            None => self.disable_peer_traffic(public_key).await,
            Some(allowance) => {
                self.ensure_installed().await?;
                self.peers.insert(public_key.to_string(), allowance);
                let vpn = self.vpn_rules();
                self.set(Anchor::AllowVpn, vpn).await
            }
        }
    }

    /// Drop the allowance for one peer; unknown keys are ignored
    pub async fn disable_peer_traffic(&mut self, public_key: &str) -> Result<()> {
        if self.peers.remove(public_key).is_none() || !self.installed {
            return Ok(());
        }
        let vpn = self.vpn_rules();
        let vpn = AnchorRules {
            enabled: vpn.enabled || self.kill_switch,
            ..vpn
        };
        self.set(Anchor::AllowVpn, vpn).await
    }

    /// Permit traffic to the given LAN prefixes
    pub async fn enable_lan_bypass(&mut self, prefixes: &[IpPrefix]) -> Result<()> {
        self.lan_bypass.extend(prefixes.iter().copied());
        if !self.installed {
            // Applied with the next kill-switch enable
            return Ok(());
        }
        let lan = self.lan_rules();
        self.set(Anchor::AllowLan, lan).await
    }
}
