// WireGuard tunnel lifecycle controller

//! Tunnel control plane
//!
//! One [`WgController`] owns one tunnel interface: it starts the backend from
//! the rendered config, attaches a [`RouteManager`] to the resulting link,
//! configures peers over the control protocol and keeps exclusion routes and
//! firewall peer allowances in step with the peer set.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::BackendConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::firewall::SharedFirewall;
use crate::route_manager::{RouteManager, RouteSnapshot, RouteTable};
use crate::tunnel_service::{validate_interface_name, LinkId, TunnelBackend};
use crate::types::{DaemonEvent, InterfaceConfig, IpPrefix, PeerStatus};
use crate::uapi::{self, PeerUpdate};

/// Tunables taken from the `[backend]` config section
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub keepalive: u16,
    pub monitor_routes: bool,
    pub health_check_interval: Duration,
}

impl From<&BackendConfig> for ControllerSettings {
    fn from(config: &BackendConfig) -> Self {
        Self {
            keepalive: config.keepalive_interval,
            monitor_routes: config.monitor_routes,
            health_check_interval: Duration::from_secs(config.health_check_interval),
        }
    }
}

/// Shared collaborators handed to every controller
#[derive(Clone)]
pub struct ControllerContext {
    pub backend: Arc<dyn TunnelBackend>,
    pub routes: Arc<dyn RouteTable>,
    pub firewall: SharedFirewall,
    pub events: broadcast::Sender<DaemonEvent>,
    pub settings: ControllerSettings,
}

/// Render the backend config: interface section only, routing left to us
pub fn render_interface(config: &InterfaceConfig) -> String {
    let conf = config.to_wg_conf(&[("Table", "off")]);
    match conf.find("[Peer]") {
        Some(pos) => format!("{}\n", conf[..pos].trim_end()),
        None => conf,
    }
}

struct ActiveInterface {
    link: LinkId,
    routes: RouteManager,
    watcher: JoinHandle<()>,
    /// Exclusion routes registered per peer public key
    peer_exclusions: HashMap<String, Vec<IpPrefix>>,
}

/// Controller for one tunnel interface
pub struct WgController {
    interface: String,
    ctx: ControllerContext,
    active: Option<ActiveInterface>,
}

impl WgController {
    /// Create a controller for `interface`; nothing is started yet
    ///
    /// # Errors
    ///
    /// Returns an error if the interface name contains characters other than
    /// alphanumerics, hyphens and underscores, or is too long.
    pub fn new(interface: String, ctx: ControllerContext) -> DaemonResult<Self> {
        validate_interface_name(&interface).map_err(|e| DaemonError::Invalid(e.to_string()))?;
        Ok(Self {
            interface,
            ctx,
            active: None,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn link(&self) -> Option<&LinkId> {
        self.active.as_ref().map(|a| &a.link)
    }

    fn active(&self) -> DaemonResult<&ActiveInterface> {
        match &self.active {
            Some(active) => Ok(active),
            None => {
                log::error!("No active interface {}", self.interface);
                Err(DaemonError::NoInterface(self.interface.clone()))
            }
        }
    }

    async fn send(&self, message: &str) -> DaemonResult<String> {
        let reply = self
            .ctx
            .backend
            .uapi_command(&self.interface, message)
            .await
            .map_err(|e| DaemonError::Backend(format!("{:#}", e)))?;
        uapi::check_errno(&reply).map_err(|e| DaemonError::Backend(format!("{:#}", e)))?;
        Ok(reply)
    }

    /// Start the backend and attach route management to its link
    pub async fn add_interface(&mut self, config: &InterfaceConfig) -> DaemonResult<()> {
        if config.interface_name != self.interface {
            return Err(DaemonError::Invalid(format!(
                "config is for {}, controller owns {}",
                config.interface_name, self.interface
            )));
        }

        // The backend config is rendered from the decoded key, never the caller's text
        let private_key = uapi::parse_key(&config.private_key, "private key")
            .map_err(|e| DaemonError::Invalid(e.to_string()))?;
        let mut sanitized = config.clone();
        sanitized.private_key = private_key.to_base64();
        if let Some(field) = sanitized.multiline_field(&[]) {
            return Err(DaemonError::Invalid(format!("{} contains a line break", field)));
        }

        if self.active.is_some() {
            log::warn!("Interface {} already active, tearing it down first", self.interface);
            self.delete_interface().await?;
        }

        let rendered = render_interface(&sanitized);
        if rendered.is_empty() {
            return Err(DaemonError::Invalid("interface config could not be rendered".into()));
        }

        self.ctx
            .backend
            .start(&self.interface, &rendered)
            .await
            .map_err(|e| DaemonError::Backend(format!("{:#}", e)))?;

        let link = match self.ctx.backend.link_id(&self.interface).await {
            Ok(link) => link,
            Err(e) => {
                log::error!("Failed to resolve link of {}: {:#}", self.interface, e);
                self.stop_backend().await;
                return Err(DaemonError::Backend(format!("{:#}", e)));
            }
        };

        let routes = match RouteManager::spawn(
            self.ctx.routes.clone(),
            link.clone(),
            self.ctx.settings.monitor_routes,
        ) {
            Ok(routes) => routes,
            Err(e) => {
                log::error!("Failed to start route manager for {}: {:#}", self.interface, e);
                self.stop_backend().await;
                return Err(DaemonError::Internal(e));
            }
        };

        if config.kill_switch_enabled {
            let protected = self.ctx.firewall.lock().await.enable_interface(&link).await;
            if let Err(e) = protected {
                log::error!("Failed to protect {}: {:#}", self.interface, e);
                routes.dispose().await;
                self.stop_backend().await;
                return Err(DaemonError::Internal(e));
            }
        }

        let watcher = spawn_health_watcher(
            self.ctx.backend.clone(),
            self.interface.clone(),
            self.ctx.settings.health_check_interval,
            self.ctx.events.clone(),
        );

        log::info!("Interface {} is up (index {})", link.name, link.index);
        self.active = Some(ActiveInterface {
            link,
            routes,
            watcher,
            peer_exclusions: HashMap::new(),
        });
        Ok(())
    }

    async fn stop_backend(&self) {
        if let Err(e) = self.ctx.backend.stop(&self.interface).await {
            log::warn!("Failed to stop backend for {}: {:#}", self.interface, e);
        }
    }

    /// Best-effort teardown; every step runs and the call always succeeds
    pub async fn delete_interface(&mut self) -> DaemonResult<()> {
        let Some(active) = self.active.take() else {
            log::debug!("Interface {} is not active", self.interface);
            return Ok(());
        };

        active.watcher.abort();
        active.routes.dispose().await;

        let disabled = self
            .ctx
            .firewall
            .lock()
            .await
            .disable_interface(&active.link.name)
            .await;
        if let Err(e) = disabled {
            log::warn!("Failed to drop firewall protection of {}: {:#}", active.link.name, e);
        }

        self.stop_backend().await;
        log::info!("Interface {} removed", self.interface);
        Ok(())
    }

    /// Install or replace a peer
    pub async fn update_peer(&mut self, config: &InterfaceConfig) -> DaemonResult<()> {
        let addresses = config.server_addresses();
        let Some(endpoint_ip) = addresses.first().copied() else {
            log::error!("Peer {} has no endpoint address", config.server_public_key);
            return Err(DaemonError::Invalid("peer has no endpoint address".into()));
        };

        let public_key = uapi::parse_key(&config.server_public_key, "server public key")
            .map_err(|e| DaemonError::Invalid(e.to_string()))?;
        let preshared_key = config
            .server_psk_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .map(|k| uapi::parse_key(k, "pre-shared key"))
            .transpose()
            .map_err(|e| DaemonError::Invalid(e.to_string()))?;

        let active = self.active()?;
        let link = active.link.name.clone();
        let previous_exclusions = active
            .peer_exclusions
            .get(&config.server_public_key)
            .cloned()
            .unwrap_or_default();

        let previous_allowance = if config.kill_switch_enabled {
            let mut firewall = self.ctx.firewall.lock().await;
            let previous = firewall.peer_allowance(&config.server_public_key);
            firewall.enable_peer_traffic(&link, config).await?;
            Some(previous)
        } else {
            None
        };

        let wanted = if config.hop_role.needs_exclusion() {
            config
                .server_addresses()
                .into_iter()
                .map(IpPrefix::host)
                .collect()
        } else {
            Vec::new()
        };
        self.set_peer_exclusions(&config.server_public_key, wanted).await;

        let message = uapi::set_peer(&PeerUpdate {
            public_key: &public_key,
            preshared_key: preshared_key.as_ref(),
            endpoint: SocketAddr::new(endpoint_ip, config.server_port),
            keepalive: self.ctx.settings.keepalive,
            allowed_ips: &config.allowed_ip_address_ranges,
        });
        if let Err(e) = self.send(&message).await {
            log::warn!("Rolling back peer {} after failed update", config.server_public_key);
            self.set_peer_exclusions(&config.server_public_key, previous_exclusions)
                .await;
            if let Some(previous) = previous_allowance {
                let restored = self
                    .ctx
                    .firewall
                    .lock()
                    .await
                    .restore_peer_traffic(&config.server_public_key, previous)
                    .await;
                if let Err(e) = restored {
                    log::warn!("Failed to restore firewall allowance: {:#}", e);
                }
            }
            return Err(e);
        }

        log::info!(
            "Peer {} configured with {} allowed IPs",
            config.server_public_key,
            config.allowed_ip_address_ranges.len()
        );
        Ok(())
    }

    /// Make `wanted` the exact set of exclusion routes held for a peer
    async fn set_peer_exclusions(&mut self, public_key: &str, wanted: Vec<IpPrefix>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        let previous = active
            .peer_exclusions
            .remove(public_key)
            .unwrap_or_default();

        for prefix in previous.iter().filter(|p| !wanted.contains(p)) {
            if let Err(e) = active.routes.delete_exclusion_route(*prefix).await {
                log::warn!("Failed to remove stale exclusion {}: {}", prefix, e);
            }
        }

        let mut registered = Vec::new();
        for prefix in wanted {
            if previous.contains(&prefix) {
                registered.push(prefix);
                continue;
            }
            match active.routes.add_exclusion_route(prefix).await {
                Ok(()) => registered.push(prefix),
                Err(e) => log::error!("Failed to exclude server {}: {}", prefix, e),
            }
        }

        if !registered.is_empty() {
            active
                .peer_exclusions
                .insert(public_key.to_string(), registered);
        }
    }

    /// Remove a peer with its exclusions and firewall allowance
    pub async fn delete_peer(&mut self, config: &InterfaceConfig) -> DaemonResult<()> {
        let public_key = uapi::parse_key(&config.server_public_key, "server public key")
            .map_err(|e| DaemonError::Invalid(e.to_string()))?;
        self.active()?;

        if let Some(active) = self.active.as_mut() {
            let exclusions = active
                .peer_exclusions
                .remove(&config.server_public_key)
                .unwrap_or_default();
            for prefix in exclusions {
                if let Err(e) = active.routes.delete_exclusion_route(prefix).await {
                    log::warn!("Failed to remove exclusion {}: {}", prefix, e);
                }
            }
        }

        let disabled = self
            .ctx
            .firewall
            .lock()
            .await
            .disable_peer_traffic(&config.server_public_key)
            .await;
        if let Err(e) = disabled {
            log::warn!("Failed to drop firewall allowance: {:#}", e);
        }

        self.send(&uapi::remove_peer(&public_key)).await?;
        log::info!("Peer {} removed", config.server_public_key);
        Ok(())
    }

    /// Query per-peer telemetry
    pub async fn get_peer_status(&self) -> DaemonResult<Vec<PeerStatus>> {
        self.active()?;
        let reply = self.send(uapi::GET).await?;
        Ok(uapi::parse_peer_status(&reply))
    }

    pub async fn update_route_prefix(&self, prefix: IpPrefix) -> DaemonResult<()> {
        self.active()?.routes.update_route_prefix(prefix).await
    }

    pub async fn delete_route_prefix(&self, prefix: IpPrefix) -> DaemonResult<()> {
        self.active()?.routes.delete_route_prefix(prefix).await
    }

    pub async fn add_exclusion_route(&self, prefix: IpPrefix) -> DaemonResult<()> {
        self.active()?.routes.add_exclusion_route(prefix).await
    }

    pub async fn delete_exclusion_route(&self, prefix: IpPrefix) -> DaemonResult<()> {
        self.active()?.routes.delete_exclusion_route(prefix).await
    }

    /// Exclude every LAN prefix and permit LAN traffic in the firewall.
    ///
    /// Every prefix is attempted; the call fails if any step failed.
    pub async fn exclude_local_networks(&self, prefixes: &[IpPrefix]) -> DaemonResult<()> {
        let active = self.active()?;

        let mut failures = 0usize;
        for prefix in prefixes {
            if let Err(e) = active.routes.add_exclusion_route(*prefix).await {
                log::error!("Failed to exclude local network {}: {}", prefix, e);
                failures += 1;
            }
        }

        let bypass = self
            .ctx
            .firewall
            .lock()
            .await
            .enable_lan_bypass(prefixes)
            .await;
        if let Err(e) = bypass {
            log::error!("Failed to enable LAN bypass: {:#}", e);
            failures += 1;
        }

        if failures > 0 {
            return Err(DaemonError::Internal(anyhow::anyhow!(
                "{} of {} local network steps failed",
                failures,
                prefixes.len() + 1
            )));
        }
        Ok(())
    }

    /// Route bookkeeping of the active interface
    pub async fn route_snapshot(&self) -> DaemonResult<RouteSnapshot> {
        self.active()?.routes.snapshot().await
    }
}

/// Poll backend liveness and report the first failure
fn spawn_health_watcher(
    backend: Arc<dyn TunnelBackend>,
    interface: String,
    period: Duration,
    events: broadcast::Sender<DaemonEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !backend.is_running(&interface).await {
                log::error!("Tunnel backend for {} is no longer running", interface);
                let _ = events.send(DaemonEvent::BackendFailure {
                    interface: interface.clone(),
                });
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::{Anchor, FirewallEngine};
    use crate::testing::{FakeTunnelBackend, MemoryRouteTable, RecordingFilter};
    use crate::types::HopRole;
    use std::net::Ipv4Addr;
    use wireguard_control::Key;

    struct Harness {
        backend: Arc<FakeTunnelBackend>,
        table: Arc<MemoryRouteTable>,
        firewall: SharedFirewall,
        events: broadcast::Sender<DaemonEvent>,
        controller: WgController,
    }

    fn harness() -> Harness {
        let backend = Arc::new(FakeTunnelBackend::default());
        let table = Arc::new(MemoryRouteTable::with_uplink("192.168.1.1", "eth0"));
        let firewall = FirewallEngine::shared(Arc::new(RecordingFilter::default()));
        let (events, _) = broadcast::channel(8);
        let ctx = ControllerContext {
            backend: backend.clone(),
            routes: table.clone(),
            firewall: firewall.clone(),
            events: events.clone(),
            settings: ControllerSettings {
                keepalive: 25,
                monitor_routes: false,
                health_check_interval: Duration::from_millis(20),
            },
        };
        let controller = WgController::new("wg0".to_string(), ctx).unwrap();
        Harness {
            backend,
            table,
            firewall,
            events,
            controller,
        }
    }

    fn key(byte: u8) -> String {
        Key::from_hex(&format!("{:02x}", byte).repeat(32))
            .unwrap()
            .to_base64()
    }

    fn config() -> InterfaceConfig {
        InterfaceConfig {
            interface_name: "wg0".to_string(),
            private_key: key(0x10),
            addresses: vec!["10.8.0.2/32".parse().unwrap()],
            server_public_key: key(0x20),
            server_ipv4_addr_in: Some(Ipv4Addr::new(203, 0, 113, 7)),
            server_port: 51820,
            allowed_ip_address_ranges: vec!["0.0.0.0/0".parse().unwrap()],
            ..Default::default()
        }
    }

    fn prefix(s: &str) -> IpPrefix {
        s.parse().unwrap()
    }

    #[test]
    fn test_render_interface_drops_peer_section() {
        let rendered = render_interface(&config());
        assert!(rendered.starts_with("[Interface]\n"));
        assert!(rendered.contains("Table = off\n"));
        assert!(!rendered.contains("[Peer]"));
        assert!(!rendered.contains("Endpoint"));
    }

    #[test]
    fn test_new_rejects_bad_name() {
        let h = harness();
        assert!(WgController::new("wg0; reboot".to_string(), h.controller.ctx.clone()).is_err());
    }

    #[tokio::test]
    async fn test_add_interface_starts_backend() {
        let mut h = harness();
        h.controller.add_interface(&config()).await.unwrap();

        assert!(h.controller.is_active());
        assert_eq!(h.controller.link().unwrap().index, 42);
        let starts = h.backend.starts();
        assert_eq!(starts.len(), 1);
        assert!(starts[0].1.contains("Table = off"));

        h.controller.delete_interface().await.unwrap();
        assert_eq!(h.backend.stops(), vec!["wg0".to_string()]);
    }

    #[tokio::test]
    async fn test_add_interface_rejects_injected_private_key() {
        let mut h = harness();
        let mut cfg = config();
        cfg.private_key = "x\nPostUp = touch /tmp/owned".to_string();
        let err = h.controller.add_interface(&cfg).await.unwrap_err();
        assert!(matches!(err, DaemonError::Invalid(_)));

        let mut cfg = config();
        cfg.server_psk_key = Some(format!("{}\nPostUp = id", key(0x30)));
        let err = h.controller.add_interface(&cfg).await.unwrap_err();
        assert!(matches!(err, DaemonError::Invalid(_)));

        assert!(h.backend.starts().is_empty());
        assert!(!h.controller.is_active());
    }

    #[tokio::test]
    async fn test_add_interface_renders_decoded_key() {
        let mut h = harness();
        let mut cfg = config();
        cfg.private_key = format!("  {}\t", key(0x10));
        h.controller.add_interface(&cfg).await.unwrap();

        let starts = h.backend.starts();
        assert!(starts[0].1.contains(&format!("PrivateKey = {}\n", key(0x10))));
        assert!(!starts[0].1.contains('\t'));
    }

    #[tokio::test]
    async fn test_add_interface_link_failure_stops_backend() {
        let mut h = harness();
        h.backend.fail_link(true);
        let err = h.controller.add_interface(&config()).await.unwrap_err();
        assert!(matches!(err, DaemonError::Backend(_)));
        assert!(!h.controller.is_active());
        assert_eq!(h.backend.stops().len(), 1);
    }

    #[tokio::test]
    async fn test_add_interface_twice_tears_down_first() {
        let mut h = harness();
        h.controller.add_interface(&config()).await.unwrap();
        h.controller.add_interface(&config()).await.unwrap();
        assert_eq!(h.backend.starts().len(), 2);
        assert_eq!(h.backend.stops().len(), 1);
    }

    #[tokio::test]
    async fn test_kill_switch_protects_interface() {
        let mut h = harness();
        let mut cfg = config();
        cfg.kill_switch_enabled = true;
        h.controller.add_interface(&cfg).await.unwrap();
        {
            let fw = h.firewall.lock().await;
            assert_eq!(fw.anchor(Anchor::AllowVpn).unwrap().interfaces, vec!["wg0".to_string()]);
        }

        h.controller.delete_interface().await.unwrap();
        assert!(!h.firewall.lock().await.is_installed());
    }

    #[tokio::test]
    async fn test_deleting_one_protected_tunnel_keeps_the_other() {
        let mut h = harness();
        let mut second = WgController::new("wg1".to_string(), h.controller.ctx.clone()).unwrap();
        let mut cfg = config();
        cfg.kill_switch_enabled = true;
        h.controller.add_interface(&cfg).await.unwrap();
        cfg.interface_name = "wg1".to_string();
        second.add_interface(&cfg).await.unwrap();

        second.delete_interface().await.unwrap();
        {
            let fw = h.firewall.lock().await;
            assert!(fw.is_installed());
            assert_eq!(fw.anchor(Anchor::AllowVpn).unwrap().interfaces, vec!["wg0".to_string()]);
        }

        h.controller.delete_interface().await.unwrap();
        assert!(!h.firewall.lock().await.is_installed());
    }

    #[tokio::test]
    async fn test_update_peer_with_kill_switch_allows_endpoint() {
        let mut h = harness();
        let mut cfg = config();
        cfg.kill_switch_enabled = true;
        h.controller.add_interface(&cfg).await.unwrap();
        h.controller.update_peer(&cfg).await.unwrap();

        {
            let fw = h.firewall.lock().await;
            let vpn = fw.anchor(Anchor::AllowVpn).unwrap();
            assert!(vpn.enabled);
            assert_eq!(vpn.table, vec![prefix("203.0.113.7/32")]);
            assert_eq!(vpn.interfaces, vec!["wg0".to_string()]);
        }

        h.controller.delete_peer(&cfg).await.unwrap();
        let fw = h.firewall.lock().await;
        assert!(fw.anchor(Anchor::AllowVpn).unwrap().table.is_empty());
    }

    #[tokio::test]
    async fn test_failed_update_peer_rolls_back() {
        let mut h = harness();
        let mut cfg = config();
        cfg.kill_switch_enabled = true;
        h.controller.add_interface(&cfg).await.unwrap();
        let before = h.table.routes();

        h.backend.push_reply("errno=22\n");
        assert!(h.controller.update_peer(&cfg).await.is_err());
        assert_eq!(h.table.routes(), before);
        {
            let fw = h.firewall.lock().await;
            assert!(fw.anchor(Anchor::AllowVpn).unwrap().table.is_empty());
            assert!(fw.peer_allowance(&cfg.server_public_key).is_none());
        }

        // A failed change of an installed peer restores its previous exclusion
        h.controller.update_peer(&cfg).await.unwrap();
        let installed = h.table.routes();
        assert_eq!(installed.len(), before.len() + 1);
        let mut exit = cfg.clone();
        exit.hop_role = HopRole::MultiHopExit;
        h.backend.push_reply("errno=22\n");
        assert!(h.controller.update_peer(&exit).await.is_err());
        assert_eq!(h.table.routes(), installed);
        let fw = h.firewall.lock().await;
        assert_eq!(
            fw.anchor(Anchor::AllowVpn).unwrap().table,
            vec![prefix("203.0.113.7/32")]
        );
    }

    #[tokio::test]
    async fn test_delete_interface_when_inactive_succeeds() {
        let mut h = harness();
        assert!(h.controller.delete_interface().await.is_ok());
    }

    #[tokio::test]
    async fn test_update_peer_message_matches_allowed_ips() {
        let mut h = harness();
        h.controller.add_interface(&config()).await.unwrap();

        let mut cfg = config();
        h.controller.update_peer(&cfg).await.unwrap();
        cfg.allowed_ip_address_ranges = vec![prefix("10.0.0.0/8"), prefix("::/0")];
        h.controller.update_peer(&cfg).await.unwrap();

        let commands = h.backend.commands();
        let last = commands.last().unwrap();
        let allowed: Vec<&str> = last
            .lines()
            .filter_map(|l| l.strip_prefix("allowed_ip="))
            .collect();
        assert_eq!(allowed, vec!["10.0.0.0/8", "::/0"]);
        assert!(last.contains("replace_allowed_ips=true"));
        assert!(last.contains("endpoint=203.0.113.7:51820"));
        assert!(last.contains("persistent_keepalive_interval=25"));
    }

    #[tokio::test]
    async fn test_update_peer_without_endpoint_sends_nothing() {
        let mut h = harness();
        h.controller.add_interface(&config()).await.unwrap();

        let mut cfg = config();
        cfg.server_ipv4_addr_in = None;
        cfg.server_ipv6_addr_in = None;
        assert!(h.controller.update_peer(&cfg).await.is_err());
        assert!(h.backend.commands().is_empty());
    }

    #[tokio::test]
    async fn test_update_peer_errno_is_failure() {
        let mut h = harness();
        h.controller.add_interface(&config()).await.unwrap();
        h.backend.push_reply("errno=22\n");
        let err = h.controller.update_peer(&config()).await.unwrap_err();
        assert!(matches!(err, DaemonError::Backend(_)));
    }

    #[tokio::test]
    async fn test_exclusion_symmetry() {
        let mut h = harness();
        h.controller.add_interface(&config()).await.unwrap();
        let before = h.table.routes();

        for role in [HopRole::Single, HopRole::MultiHopEntry] {
            let mut cfg = config();
            cfg.hop_role = role;
            h.controller.update_peer(&cfg).await.unwrap();
            assert_eq!(h.table.routes().len(), before.len() + 1);
            h.controller.delete_peer(&cfg).await.unwrap();
            assert_eq!(h.table.routes(), before);
        }

        let mut cfg = config();
        cfg.hop_role = HopRole::MultiHopExit;
        h.controller.update_peer(&cfg).await.unwrap();
        assert_eq!(h.table.routes(), before);
        h.controller.delete_peer(&cfg).await.unwrap();
        assert_eq!(h.table.routes(), before);
    }

    #[tokio::test]
    async fn test_hop_role_change_removes_exclusion() {
        let mut h = harness();
        h.controller.add_interface(&config()).await.unwrap();

        let mut cfg = config();
        h.controller.update_peer(&cfg).await.unwrap();
        assert_eq!(h.table.routes().len(), 1);

        cfg.hop_role = HopRole::MultiHopExit;
        h.controller.update_peer(&cfg).await.unwrap();
        assert!(h.table.routes().is_empty());
    }

    #[tokio::test]
    async fn test_delete_peer_sends_remove() {
        let mut h = harness();
        h.controller.add_interface(&config()).await.unwrap();
        h.controller.delete_peer(&config()).await.unwrap();
        let commands = h.backend.commands();
        assert!(commands.last().unwrap().ends_with("remove=true\n"));
    }

    #[tokio::test]
    async fn test_get_peer_status() {
        let mut h = harness();
        h.controller.add_interface(&config()).await.unwrap();
        h.backend.push_reply(&format!(
            "public_key={}\ntx_bytes=10\nrx_bytes=20\nerrno=0\n",
            "20".repeat(32)
        ));
        let peers = h.controller.get_peer_status().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].public_key, key(0x20));
        assert_eq!(h.backend.commands(), vec![uapi::GET.to_string()]);
    }

    #[tokio::test]
    async fn test_route_ops_without_interface() {
        let h = harness();
        let err = h
            .controller
            .update_route_prefix(prefix("10.0.0.0/8"))
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::NoInterface(_)));
    }

    #[tokio::test]
    async fn test_default_route_capture_scenario() {
        let mut h = harness();
        h.controller.add_interface(&config()).await.unwrap();
        h.controller
            .update_route_prefix(prefix("0.0.0.0/0"))
            .await
            .unwrap();

        let snap = h.controller.route_snapshot().await.unwrap();
        assert!(snap.default_route_capture);
        assert!(h
            .table
            .routes()
            .iter()
            .any(|r| r.device == "wg0" && r.destination == prefix("0.0.0.0/1")));
    }

    #[tokio::test]
    async fn test_exclude_local_networks_continues_after_failure() {
        let mut h = harness();
        h.controller.add_interface(&config()).await.unwrap();
        h.table.fail_adds(true);

        let lans = [prefix("192.168.1.0/24"), prefix("10.10.0.0/16")];
        assert!(h.controller.exclude_local_networks(&lans).await.is_err());

        h.table.fail_adds(false);
        h.controller.exclude_local_networks(&lans).await.unwrap();
        assert_eq!(h.table.routes().len(), 2);
    }

    #[tokio::test]
    async fn test_health_watcher_reports_backend_failure() {
        let mut h = harness();
        let mut events = h.events.subscribe();
        h.controller.add_interface(&config()).await.unwrap();

        h.backend.crash("wg0");
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            DaemonEvent::BackendFailure {
                interface: "wg0".to_string()
            }
        );
    }
}
