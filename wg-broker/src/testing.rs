//! Recording doubles for the system seams

use anyhow::Result;
use futures::future::{BoxFuture, FutureExt};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::firewall::{Anchor, AnchorRules, FirewallEngine, PacketFilter};
use crate::logging::LogControl;
use crate::route_manager::{Gateway, RouteChange, RouteEntry, RouteOutcome, RouteTable};
use crate::tunnel_service::{LinkId, TunnelBackend};
use crate::wg_controller::{ControllerContext, ControllerSettings};

#[derive(Default)]
struct BackendState {
    starts: Vec<(String, String)>,
    stops: Vec<String>,
    commands: Vec<String>,
    running: HashSet<String>,
    replies: VecDeque<String>,
    fail_start: bool,
    fail_link: bool,
}

/// Tunnel backend that records every call
#[derive(Default)]
pub struct FakeTunnelBackend {
    state: Mutex<BackendState>,
}

impl FakeTunnelBackend {
    pub fn fail_start(&self, fail: bool) {
        self.state.lock().unwrap().fail_start = fail;
    }

    pub fn fail_link(&self, fail: bool) {
        self.state.lock().unwrap().fail_link = fail;
    }

    /// Queue a reply for the next control command; `errno=0` otherwise
    pub fn push_reply(&self, reply: &str) {
        self.state.lock().unwrap().replies.push_back(reply.to_string());
    }

    /// Simulate the backend process dying
    pub fn crash(&self, name: &str) {
        self.state.lock().unwrap().running.remove(name);
    }

    pub fn starts(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().starts.clone()
    }

    pub fn stops(&self) -> Vec<String> {
        self.state.lock().unwrap().stops.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }
}

impl TunnelBackend for FakeTunnelBackend {
    fn start<'a>(&'a self, name: &'a str, config: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            let mut state = self.state.lock().unwrap();
            state.starts.push((name.to_string(), config.to_string()));
            if state.fail_start {
                anyhow::bail!("backend refused to start");
            }
            state.running.insert(name.to_string());
            Ok(())
        }
        .boxed()
    }

    fn stop<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            let mut state = self.state.lock().unwrap();
            state.stops.push(name.to_string());
            state.running.remove(name);
            Ok(())
        }
        .boxed()
    }

    fn is_running<'a>(&'a self, name: &'a str) -> BoxFuture<'a, bool> {
        async move { self.state.lock().unwrap().running.contains(name) }.boxed()
    }

    fn link_id<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<LinkId>> {
        async move {
            if self.state.lock().unwrap().fail_link {
                anyhow::bail!("no such link");
            }
            Ok(LinkId {
                name: name.to_string(),
                index: 42,
            })
        }
        .boxed()
    }

    fn uapi_command<'a>(&'a self, _name: &'a str, message: &'a str) -> BoxFuture<'a, Result<String>> {
        async move {
            let mut state = self.state.lock().unwrap();
            state.commands.push(message.to_string());
            Ok(state
                .replies
                .pop_front()
                .unwrap_or_else(|| "errno=0\n".to_string()))
        }
        .boxed()
    }
}

#[derive(Default)]
struct TableState {
    routes: BTreeSet<RouteEntry>,
    uplink: Option<Gateway>,
    fail_adds: bool,
    fail_deletes: bool,
}

/// In-memory kernel route table with an injectable change stream
#[derive(Default)]
pub struct MemoryRouteTable {
    state: Mutex<TableState>,
    monitor: Mutex<Option<mpsc::Sender<RouteChange>>>,
}

impl MemoryRouteTable {
    pub fn with_uplink(gateway: &str, device: &str) -> Self {
        let table = Self::default();
        table.set_uplink(gateway, device);
        table
    }

    pub fn set_uplink(&self, gateway: &str, device: &str) {
        self.state.lock().unwrap().uplink = Some(Gateway {
            address: Some(gateway.parse().unwrap()),
            device: device.to_string(),
            metric: 100,
        });
    }

    pub fn fail_adds(&self, fail: bool) {
        self.state.lock().unwrap().fail_adds = fail;
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.state.lock().unwrap().fail_deletes = fail;
    }

    pub fn routes(&self) -> Vec<RouteEntry> {
        self.state.lock().unwrap().routes.iter().cloned().collect()
    }

    /// Delete routes behind the daemon's back
    pub fn remove_all_on(&self, device: &str) {
        self.state
            .lock()
            .unwrap()
            .routes
            .retain(|r| r.device != device);
    }

    /// Deliver a route-table change notification
    pub async fn notify(&self, raw: &str) {
        let tx = self.monitor.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx
                .send(RouteChange {
                    raw: raw.to_string(),
                })
                .await;
        }
    }
}

impl RouteTable for MemoryRouteTable {
    fn add_route<'a>(&'a self, route: &'a RouteEntry) -> BoxFuture<'a, Result<RouteOutcome>> {
        async move {
            let mut state = self.state.lock().unwrap();
            if state.fail_adds {
                anyhow::bail!("RTNETLINK answers: Operation not permitted");
            }
            if state.routes.insert(route.clone()) {
                Ok(RouteOutcome::Created)
            } else {
                Ok(RouteOutcome::AlreadyExists)
            }
        }
        .boxed()
    }

    fn delete_route<'a>(&'a self, route: &'a RouteEntry) -> BoxFuture<'a, Result<RouteOutcome>> {
        async move {
            let mut state = self.state.lock().unwrap();
            if state.fail_deletes {
                anyhow::bail!("RTNETLINK answers: No such process");
            }
            if state.routes.remove(route) {
                Ok(RouteOutcome::Deleted)
            } else {
                Ok(RouteOutcome::NotFound)
            }
        }
        .boxed()
    }

    fn uplink<'a>(
        &'a self,
        ipv6: bool,
        exclude_device: &'a str,
    ) -> BoxFuture<'a, Result<Option<Gateway>>> {
        async move {
            if ipv6 {
                return Ok(None);
            }
            Ok(self
                .state
                .lock()
                .unwrap()
                .uplink
                .clone()
                .filter(|gw| gw.device != exclude_device))
        }
        .boxed()
    }

    fn watch(&self) -> Result<mpsc::Receiver<RouteChange>> {
        let (tx, rx) = mpsc::channel(16);
        *self.monitor.lock().unwrap() = Some(tx);
        Ok(rx)
    }
}

#[derive(Default)]
struct FilterState {
    installs: usize,
    uninstalls: usize,
    applied: Vec<(Anchor, AnchorRules)>,
}

/// Packet filter that records anchor writes
#[derive(Default)]
pub struct RecordingFilter {
    state: Mutex<FilterState>,
}

impl RecordingFilter {
    pub fn installs(&self) -> usize {
        self.state.lock().unwrap().installs
    }

    pub fn uninstalls(&self) -> usize {
        self.state.lock().unwrap().uninstalls
    }

    pub fn applied(&self) -> Vec<(Anchor, AnchorRules)> {
        self.state.lock().unwrap().applied.clone()
    }
}

impl PacketFilter for RecordingFilter {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn install(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            self.state.lock().unwrap().installs += 1;
            Ok(())
        }
        .boxed()
    }

    fn uninstall(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            self.state.lock().unwrap().uninstalls += 1;
            Ok(())
        }
        .boxed()
    }

    fn apply<'a>(&'a self, anchor: Anchor, rules: &'a AnchorRules) -> BoxFuture<'a, Result<()>> {
        async move {
            self.state
                .lock()
                .unwrap()
                .applied
                .push((anchor, rules.clone()));
            Ok(())
        }
        .boxed()
    }
}

#[derive(Default)]
struct DnsState {
    flushes: usize,
    links: Vec<(u32, Vec<std::net::IpAddr>)>,
}

/// DNS control that records requests
#[derive(Default)]
pub struct RecordingDns {
    state: Mutex<DnsState>,
}

impl RecordingDns {
    pub fn flushes(&self) -> usize {
        self.state.lock().unwrap().flushes
    }

    pub fn links(&self) -> Vec<(u32, Vec<std::net::IpAddr>)> {
        self.state.lock().unwrap().links.clone()
    }
}

impl crate::dns::DnsControl for RecordingDns {
    fn flush(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            self.state.lock().unwrap().flushes += 1;
            Ok(())
        }
        .boxed()
    }

    fn set_link_resolvers<'a>(
        &'a self,
        ifindex: u32,
        resolvers: &'a [std::net::IpAddr],
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            self.state
                .lock()
                .unwrap()
                .links
                .push((ifindex, resolvers.to_vec()));
            Ok(())
        }
        .boxed()
    }
}

/// Services wired to fresh doubles
pub fn privileged_services() -> (
    Arc<FakeTunnelBackend>,
    Arc<RecordingDns>,
    crate::broker::services::PrivilegedServices,
) {
    let backend = Arc::new(FakeTunnelBackend::default());
    let dns = Arc::new(RecordingDns::default());
    let (events, _) = tokio::sync::broadcast::channel(8);
    let ctx = ControllerContext {
        backend: backend.clone(),
        routes: Arc::new(MemoryRouteTable::with_uplink("192.168.1.1", "eth0")),
        firewall: FirewallEngine::shared(Arc::new(RecordingFilter::default())),
        events,
        settings: ControllerSettings {
            keepalive: 25,
            monitor_routes: false,
            health_check_interval: Duration::from_millis(50),
        },
    };
    let services = crate::broker::services::PrivilegedServices::new(
        ctx,
        dns.clone(),
        LogControl::detached(),
    );
    (backend, dns, services)
}
