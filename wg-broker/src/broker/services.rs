//! Privileged operations behind the session channel
//!
//! [`PrivilegedServices::dispatch`] is the single entry point every session
//! uses. It owns the tunnel registry (one controller per interface name) and
//! serializes registry mutations, so concurrent `addInterface` calls for the
//! same name run one after the other.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use super::protocol::Call;
use crate::dns::DnsControl;
use crate::error::{DaemonError, DaemonResult};
use crate::logging::LogControl;
use crate::system;
use crate::tunnel_service::{resolve_link_index, validate_interface_name};
use crate::types::{DaemonEvent, IpPrefix};
use crate::wg_controller::{ControllerContext, WgController};

fn reply<T: Serialize>(value: T) -> DaemonResult<Value> {
    serde_json::to_value(value).map_err(|e| DaemonError::Internal(e.into()))
}

/// Pick the controller a route call applies to
fn select_tunnel<'a>(
    tunnels: &'a HashMap<String, WgController>,
    interface: Option<&str>,
) -> DaemonResult<&'a WgController> {
    if let Some(name) = interface {
        return tunnels
            .get(name)
            .filter(|c| c.is_active())
            .ok_or_else(|| DaemonError::NoInterface(name.to_string()));
    }

    let mut active = tunnels.values().filter(|c| c.is_active());
    match (active.next(), active.next()) {
        (Some(only), None) => Ok(only),
        (None, _) => Err(DaemonError::NoInterface("(none)".to_string())),
        (Some(_), Some(_)) => Err(DaemonError::Invalid(
            "several interfaces are active, name one".to_string(),
        )),
    }
}

/// Everything a session may ask the daemon to do
pub struct PrivilegedServices {
    tunnels: Mutex<HashMap<String, WgController>>,
    ctx: ControllerContext,
    dns: Arc<dyn DnsControl>,
    logs: LogControl,
}

impl PrivilegedServices {
    pub fn new(ctx: ControllerContext, dns: Arc<dyn DnsControl>, logs: LogControl) -> Self {
        Self {
            tunnels: Mutex::new(HashMap::new()),
            ctx,
            dns,
            logs,
        }
    }

    /// Receive backend failure notifications
    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.ctx.events.subscribe()
    }

    /// Execute one call, logging mutating calls before and after
    pub async fn dispatch(&self, call: Call) -> DaemonResult<Value> {
        let method = call.method();
        let mutating = call.is_mutating();
        if mutating {
            log::info!("{}: executing", method);
        }

        let result = self.execute(call).await;

        if mutating {
            match &result {
                Ok(_) => log::info!("{}: succeeded", method),
                Err(e) => log::error!("{}: failed ({}): {}", method, e.code(), e),
            }
        }
        result
    }

    async fn execute(&self, call: Call) -> DaemonResult<Value> {
        match call {
            Call::Ping => reply("pong"),
            Call::CreateSession => Err(DaemonError::Invalid(
                "createSession is served on the bootstrap endpoint".to_string(),
            )),

            Call::AddInterface { config } => {
                let name = config.interface_name.clone();
                let mut tunnels = self.tunnels.lock().await;
                if !tunnels.contains_key(&name) {
                    let controller = WgController::new(name.clone(), self.ctx.clone())?;
                    tunnels.insert(name.clone(), controller);
                }
                let controller = tunnels
                    .get_mut(&name)
                    .ok_or_else(|| DaemonError::NoInterface(name.clone()))?;
                let added = controller.add_interface(&config).await;
                if added.is_err() && !controller.is_active() {
                    tunnels.remove(&name);
                }
                added?;
                reply(true)
            }
            Call::DeleteInterface { interface } => {
                let removed = self.tunnels.lock().await.remove(&interface);
                if let Some(mut controller) = removed {
                    controller.delete_interface().await?;
                }
                reply(true)
            }
            Call::UpdatePeer { config } => {
                let mut tunnels = self.tunnels.lock().await;
                let controller = tunnels
                    .get_mut(&config.interface_name)
                    .ok_or_else(|| DaemonError::NoInterface(config.interface_name.clone()))?;
                controller.update_peer(&config).await?;
                reply(true)
            }
            Call::DeletePeer { config } => {
                let mut tunnels = self.tunnels.lock().await;
                let controller = tunnels
                    .get_mut(&config.interface_name)
                    .ok_or_else(|| DaemonError::NoInterface(config.interface_name.clone()))?;
                controller.delete_peer(&config).await?;
                reply(true)
            }
            Call::GetPeerStatus { interface } => {
                let tunnels = self.tunnels.lock().await;
                let peers = select_tunnel(&tunnels, Some(&interface))?
                    .get_peer_status()
                    .await?;
                reply(peers)
            }

            Call::UpdateRoutePrefix { interface, prefix } => {
                let tunnels = self.tunnels.lock().await;
                select_tunnel(&tunnels, interface.as_deref())?
                    .update_route_prefix(prefix)
                    .await?;
                reply(true)
            }
            Call::DeleteRoutePrefix { interface, prefix } => {
                let tunnels = self.tunnels.lock().await;
                select_tunnel(&tunnels, interface.as_deref())?
                    .delete_route_prefix(prefix)
                    .await?;
                reply(true)
            }
            Call::AddExclusionRoute { interface, prefix } => {
                let tunnels = self.tunnels.lock().await;
                select_tunnel(&tunnels, interface.as_deref())?
                    .add_exclusion_route(prefix)
                    .await?;
                reply(true)
            }
            Call::DeleteExclusionRoute { interface, prefix } => {
                let tunnels = self.tunnels.lock().await;
                select_tunnel(&tunnels, interface.as_deref())?
                    .delete_exclusion_route(prefix)
                    .await?;
                reply(true)
            }
            Call::ExcludeLocalNetworks {
                interface,
                prefixes,
            } => {
                let tunnels = self.tunnels.lock().await;
                select_tunnel(&tunnels, interface.as_deref())?
                    .exclude_local_networks(&prefixes)
                    .await?;
                reply(true)
            }

            Call::FlushDns => {
                self.dns.flush().await?;
                reply(Value::Null)
            }
            Call::UpdateResolvers {
                interface,
                resolvers,
            } => {
                validate_interface_name(&interface)
                    .map_err(|e| DaemonError::Invalid(e.to_string()))?;
                let index = resolve_link_index(&interface)
                    .map_err(|e| DaemonError::NotFound(format!("{:#}", e)))?;
                self.dns.set_link_resolvers(index, &resolvers).await?;
                reply(true)
            }

            Call::EnableKillSwitch { config } => {
                self.ctx
                    .firewall
                    .lock()
                    .await
                    .enable_kill_switch(&config)
                    .await?;
                reply(true)
            }
            Call::DisableKillSwitch => {
                self.ctx.firewall.lock().await.disable_kill_switch().await?;
                reply(true)
            }
            Call::EnablePeerTraffic { config } => {
                self.ctx
                    .firewall
                    .lock()
                    .await
                    .enable_peer_traffic(&config.interface_name, &config)
                    .await?;
                reply(true)
            }
            Call::DisablePeerTraffic { public_key } => {
                self.ctx
                    .firewall
                    .lock()
                    .await
                    .disable_peer_traffic(&public_key)
                    .await?;
                reply(true)
            }

            Call::GetTapList => reply(system::tap_list()?),
            Call::CheckAndInstallDriver => reply(system::check_and_install_driver().await?),

            Call::SetLogsEnabled { enabled } => {
                self.logs.set_enabled(enabled);
                reply(Value::Null)
            }
            Call::ClearLogs => {
                self.logs.clear()?;
                reply(Value::Null)
            }
            Call::CleanUp => {
                self.logs.set_enabled(false);
                self.logs.clear()?;
                reply(Value::Null)
            }

            Call::InstallApp { path } => reply(system::install_app(&path).await?),
            Call::MountDmg { path, mount } => reply(system::mount_image(&path, mount).await?),
        }
    }

    /// Names of interfaces with a running tunnel
    pub async fn active_interfaces(&self) -> Vec<String> {
        let tunnels = self.tunnels.lock().await;
        let mut names: Vec<String> = tunnels
            .values()
            .filter(|c| c.is_active())
            .map(|c| c.interface().to_string())
            .collect();
        names.sort();
        names
    }

    /// Exclusion routes currently held by the named tunnel
    pub async fn exclusion_snapshot(&self, interface: &str) -> DaemonResult<Vec<IpPrefix>> {
        let tunnels = self.tunnels.lock().await;
        let snapshot = select_tunnel(&tunnels, Some(interface))?
            .route_snapshot()
            .await?;
        Ok(snapshot.exclusions.into_iter().collect())
    }

    /// Tear down every tunnel, best effort
    pub async fn shutdown(&self) {
        let tunnels: Vec<WgController> = self.tunnels.lock().await.drain().map(|(_, c)| c).collect();
        for mut controller in tunnels {
            log::info!("Tearing down {}", controller.interface());
            let _ = controller.delete_interface().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::privileged_services as services;
    use crate::types::{ErrorCode, FirewallConfig, InterfaceConfig};
    use std::net::Ipv4Addr;
    use wireguard_control::Key;

    fn key(byte: u8) -> String {
        Key::from_hex(&format!("{:02x}", byte).repeat(32))
            .unwrap()
            .to_base64()
    }

    fn config(name: &str) -> InterfaceConfig {
        InterfaceConfig {
            interface_name: name.to_string(),
            private_key: key(0x10),
            server_public_key: key(0x20),
            server_ipv4_addr_in: Some(Ipv4Addr::new(203, 0, 113, 7)),
            server_port: 51820,
            allowed_ip_address_ranges: vec!["0.0.0.0/0".parse().unwrap()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ping() {
        let (_, _, services) = services();
        assert_eq!(services.dispatch(Call::Ping).await.unwrap(), Value::from("pong"));
    }

    #[tokio::test]
    async fn test_route_call_before_add_interface_fails() {
        let (_, _, services) = services();
        let err = services
            .dispatch(Call::UpdateRoutePrefix {
                interface: None,
                prefix: "10.0.0.0/8".parse().unwrap(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::NoInterface(_)));
        assert_eq!(err.code(), ErrorCode::InternalError);
    }

    #[tokio::test]
    async fn test_interface_lifecycle() {
        let (backend, _, services) = services();
        services
            .dispatch(Call::AddInterface { config: config("wg0") })
            .await
            .unwrap();
        assert_eq!(services.active_interfaces().await, vec!["wg0"]);

        services
            .dispatch(Call::UpdatePeer { config: config("wg0") })
            .await
            .unwrap();
        assert_eq!(
            services.exclusion_snapshot("wg0").await.unwrap(),
            vec!["203.0.113.7/32".parse::<IpPrefix>().unwrap()]
        );

        services
            .dispatch(Call::UpdateRoutePrefix {
                interface: None,
                prefix: "0.0.0.0/0".parse().unwrap(),
            })
            .await
            .unwrap();

        services
            .dispatch(Call::DeleteInterface {
                interface: "wg0".to_string(),
            })
            .await
            .unwrap();
        assert!(services.active_interfaces().await.is_empty());
        assert_eq!(backend.stops(), vec!["wg0".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_add_leaves_no_controller() {
        let (backend, _, services) = services();
        backend.fail_start(true);
        let err = services
            .dispatch(Call::AddInterface { config: config("wg0") })
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Backend(_)));
        assert_eq!(err.code(), ErrorCode::InternalError);
        assert!(services.active_interfaces().await.is_empty());
    }

    #[tokio::test]
    async fn test_add_interface_with_injected_key_is_refused() {
        let (backend, _, services) = services();
        let mut cfg = config("wg0");
        cfg.private_key = "x\nPostUp = touch /tmp/owned".to_string();
        let err = services
            .dispatch(Call::AddInterface { config: cfg })
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Invalid(_)));
        assert!(backend.starts().is_empty());
        assert!(services.active_interfaces().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_add_interface_same_name() {
        let (backend, _, services) = services();
        let (first, second) = tokio::join!(
            services.dispatch(Call::AddInterface { config: config("wg0") }),
            services.dispatch(Call::AddInterface { config: config("wg0") }),
        );
        first.unwrap();
        second.unwrap();

        // The second call replaced the first instance
        assert_eq!(services.active_interfaces().await, vec!["wg0"]);
        assert_eq!(backend.starts().len(), 2);
        assert_eq!(backend.stops(), vec!["wg0".to_string()]);
    }

    #[tokio::test]
    async fn test_deleting_one_kill_switch_tunnel_keeps_protection() {
        let (_, _, services) = services();
        for name in ["wg0", "wg1"] {
            let mut cfg = config(name);
            cfg.kill_switch_enabled = true;
            services
                .dispatch(Call::AddInterface { config: cfg })
                .await
                .unwrap();
        }

        services
            .dispatch(Call::DeleteInterface {
                interface: "wg1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(services.active_interfaces().await, vec!["wg0"]);
        assert!(services.ctx.firewall.lock().await.is_installed());

        services.shutdown().await;
        assert!(!services.ctx.firewall.lock().await.is_installed());
    }

    #[tokio::test]
    async fn test_route_call_needs_name_with_two_tunnels() {
        let (_, _, services) = services();
        for name in ["wg0", "wg1"] {
            services
                .dispatch(Call::AddInterface { config: config(name) })
                .await
                .unwrap();
        }
        let err = services
            .dispatch(Call::AddExclusionRoute {
                interface: None,
                prefix: "198.51.100.1/32".parse().unwrap(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Invalid(_)));

        services
            .dispatch(Call::AddExclusionRoute {
                interface: Some("wg1".to_string()),
                prefix: "198.51.100.1/32".parse().unwrap(),
            })
            .await
            .unwrap();

        services.shutdown().await;
        assert!(services.active_interfaces().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_session_not_served_here() {
        let (_, _, services) = services();
        assert!(services.dispatch(Call::CreateSession).await.is_err());
    }

    #[tokio::test]
    async fn test_flush_dns_and_kill_switch() {
        let (_, dns, services) = services();
        assert_eq!(services.dispatch(Call::FlushDns).await.unwrap(), Value::Null);
        assert_eq!(dns.flushes(), 1);

        let enabled = services
            .dispatch(Call::EnableKillSwitch {
                config: FirewallConfig {
                    vpn_server: Some("203.0.113.7".parse().unwrap()),
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        assert_eq!(enabled, Value::Bool(true));
        assert!(services.ctx.firewall.lock().await.is_installed());

        services.dispatch(Call::DisableKillSwitch).await.unwrap();
        assert!(!services.ctx.firewall.lock().await.is_installed());
    }

    #[tokio::test]
    async fn test_update_resolvers_rejects_bad_name() {
        let (_, dns, services) = services();
        let err = services
            .dispatch(Call::UpdateResolvers {
                interface: "wg0 && reboot".to_string(),
                resolvers: vec!["1.1.1.1".parse().unwrap()],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Invalid(_)));
        assert!(dns.links().is_empty());
    }

    #[tokio::test]
    async fn test_log_calls() {
        let (_, _, services) = services();
        assert!(services.dispatch(Call::ClearLogs).await.is_ok());
        assert!(services.dispatch(Call::CleanUp).await.is_ok());
        assert!(services
            .dispatch(Call::SetLogsEnabled { enabled: true })
            .await
            .is_ok());
    }
}
