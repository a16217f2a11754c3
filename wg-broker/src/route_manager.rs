//! Route table management
//!
//! Programs tunnel routes and exclusion routes idempotently. All mutations for
//! one interface go through a single owner task: broker requests arrive as
//! commands, and route-table change notifications from the system arrive on a
//! second channel, so an external change can never interleave with an
//! in-flight daemon-initiated mutation.

use anyhow::{Context, Result};
use futures::future::{BoxFuture, FutureExt};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{DaemonError, DaemonResult};
use crate::tunnel_service::LinkId;
use crate::types::IpPrefix;

/// Size of the channel buffer for route commands
const COMMAND_CHANNEL_SIZE: usize = 32;

/// Size of the channel buffer for route-table change notifications
const MONITOR_CHANNEL_SIZE: usize = 64;

/// Next hop of a kernel route
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gateway {
    pub address: Option<IpAddr>,
    pub device: String,
    pub metric: u32,
}

/// Kernel-level route resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteEntry {
    pub destination: IpPrefix,
    pub via: Option<IpAddr>,
    pub device: String,
    pub metric: u32,
}

/// Result of a kernel route call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Created,
    AlreadyExists,
    Deleted,
    NotFound,
}

/// Notification that the system routing table changed
#[derive(Debug, Clone)]
pub struct RouteChange {
    pub raw: String,
}

/// Platform route table contract
pub trait RouteTable: Send + Sync {
    fn add_route<'a>(&'a self, route: &'a RouteEntry) -> BoxFuture<'a, Result<RouteOutcome>>;

    fn delete_route<'a>(&'a self, route: &'a RouteEntry) -> BoxFuture<'a, Result<RouteOutcome>>;

    /// Lowest-metric default route of the family that is not on `exclude_device`
    fn uplink<'a>(
        &'a self,
        ipv6: bool,
        exclude_device: &'a str,
    ) -> BoxFuture<'a, Result<Option<Gateway>>>;

    /// Start delivering route-table change notifications
    fn watch(&self) -> Result<mpsc::Receiver<RouteChange>>;
}

/// Routes that realise `prefix` through the tunnel.
///
/// A default route is split into two half-space routes so it takes precedence
/// over the uplink's default without replacing it.
pub fn tunnel_routes(prefix: &IpPrefix, link: &LinkId) -> Vec<RouteEntry> {
    let destinations: Vec<IpPrefix> = if prefix.is_default() {
        let halves: [&str; 2] = if prefix.is_ipv6() {
            ["::/1", "8000::/1"]
        } else {
            ["0.0.0.0/1", "128.0.0.0/1"]
        };
        halves.iter().filter_map(|h| h.parse().ok()).collect()
    } else {
        vec![*prefix]
    };

    destinations
        .into_iter()
        .map(|destination| RouteEntry {
            destination,
            via: None,
            device: link.name.clone(),
            metric: 0,
        })
        .collect()
}

/// Route table driven through the `ip` command
#[derive(Debug, Default, Clone, Copy)]
pub struct IpRouteTable;

impl IpRouteTable {
    fn route_args(verb: &str, route: &RouteEntry) -> Vec<String> {
        let mut args = Vec::new();
        if route.destination.is_ipv6() {
            args.push("-6".to_string());
        }
        args.extend(["route".to_string(), verb.to_string(), route.destination.to_string()]);
        if let Some(via) = route.via {
            args.extend(["via".to_string(), via.to_string()]);
        }
        args.extend(["dev".to_string(), route.device.clone()]);
        if verb == "add" {
            args.extend(["metric".to_string(), route.metric.to_string()]);
        }
        args
    }

    async fn run(verb: &str, route: &RouteEntry) -> Result<std::process::Output> {
        Command::new("ip")
            .args(Self::route_args(verb, route))
            .output()
            .await
            .with_context(|| format!("Failed to execute ip route {}", verb))
    }

    async fn add(&self, route: &RouteEntry) -> Result<RouteOutcome> {
        let output = Self::run("add", route).await?;
        if output.status.success() {
            return Ok(RouteOutcome::Created);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("File exists") {
            return Ok(RouteOutcome::AlreadyExists);
        }
        anyhow::bail!("ip route add {} failed: {}", route.destination, stderr.trim())
    }

    async fn delete(&self, route: &RouteEntry) -> Result<RouteOutcome> {
        let output = Self::run("del", route).await?;
        if output.status.success() {
            return Ok(RouteOutcome::Deleted);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such process") || stderr.contains("Cannot find device") {
            return Ok(RouteOutcome::NotFound);
        }
        anyhow::bail!("ip route del {} failed: {}", route.destination, stderr.trim())
    }

    async fn find_uplink(&self, ipv6: bool, exclude_device: &str) -> Result<Option<Gateway>> {
        let family = if ipv6 { "-6" } else { "-4" };
        let output = Command::new("ip")
            .args([family, "-o", "route", "show", "default"])
            .output()
            .await
            .context("Failed to execute 'ip route show default'")?;

        anyhow::ensure!(output.status.success(), "ip route show default failed");

        Ok(parse_default_routes(&String::from_utf8_lossy(&output.stdout))
            .into_iter()
            .filter(|gw| gw.device != exclude_device)
            .min_by_key(|gw| gw.metric))
    }
}

/// Parse `ip -o route show default` output.
/// Lines look like "default via 192.168.1.1 dev eth0 proto dhcp metric 100".
#[doc(hidden)]
pub fn parse_default_routes(output: &str) -> Vec<Gateway> {
    output
        .lines()
        .filter(|line| line.trim_start().starts_with("default"))
        .filter_map(|line| {
            let words: Vec<&str> = line.split_whitespace().collect();
            let value_of = |key: &str| {
                words
                    .iter()
                    .position(|w| *w == key)
                    .and_then(|pos| words.get(pos + 1))
                    .copied()
            };
            let device = value_of("dev")?.to_string();
            Some(Gateway {
                address: value_of("via").and_then(|s| s.parse().ok()),
                device,
                metric: value_of("metric")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
            })
        })
        .collect()
}

impl RouteTable for IpRouteTable {
    fn add_route<'a>(&'a self, route: &'a RouteEntry) -> BoxFuture<'a, Result<RouteOutcome>> {
        self.add(route).boxed()
    }

    fn delete_route<'a>(&'a self, route: &'a RouteEntry) -> BoxFuture<'a, Result<RouteOutcome>> {
        self.delete(route).boxed()
    }

    fn uplink<'a>(
        &'a self,
        ipv6: bool,
        exclude_device: &'a str,
    ) -> BoxFuture<'a, Result<Option<Gateway>>> {
        self.find_uplink(ipv6, exclude_device).boxed()
    }

    fn watch(&self) -> Result<mpsc::Receiver<RouteChange>> {
        let mut child = Command::new("ip")
            .args(["-o", "monitor", "route"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn ip monitor route")?;
        let stdout = child
            .stdout
            .take()
            .context("ip monitor has no stdout")?;

        let (tx, rx) = mpsc::channel(MONITOR_CHANNEL_SIZE);
        tokio::spawn(async move {
            // Owning the child here kills it once the receiver goes away
            let _child = child;
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(RouteChange { raw: line }).await.is_err() {
                    break;
                }
            }
            log::debug!("Route monitor stream ended");
        });
        Ok(rx)
    }
}

/// One destination that must bypass the tunnel
#[derive(Debug)]
struct Exclusion {
    refs: usize,
    /// Installed kernel route; `None` while no uplink exists
    installed: Option<RouteEntry>,
}

enum RouteCommand {
    UpdatePrefix(IpPrefix, oneshot::Sender<DaemonResult<()>>),
    DeletePrefix(IpPrefix, oneshot::Sender<DaemonResult<()>>),
    AddExclusion(IpPrefix, oneshot::Sender<DaemonResult<()>>),
    DeleteExclusion(IpPrefix, oneshot::Sender<DaemonResult<()>>),
    Snapshot(oneshot::Sender<RouteSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Point-in-time view of the owner task's bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteSnapshot {
    pub default_route_capture: bool,
    pub tunnel_prefixes: BTreeSet<IpPrefix>,
    pub exclusions: BTreeSet<IpPrefix>,
}

/// State owned by the route task; never shared
struct RouteOwner {
    table: std::sync::Arc<dyn RouteTable>,
    link: LinkId,
    default_route_capture: bool,
    tunnel_prefixes: BTreeSet<IpPrefix>,
    exclusions: BTreeMap<IpPrefix, Exclusion>,
}

impl RouteOwner {
    async fn update_prefix(&mut self, prefix: IpPrefix) -> DaemonResult<()> {
        if prefix.is_default() {
            // Capture all non-excluded destinations
            self.default_route_capture = true;
        }

        let mut result = Ok(());
        for route in tunnel_routes(&prefix, &self.link) {
            match self.table.add_route(&route).await {
                Ok(RouteOutcome::AlreadyExists) => {
                    log::debug!("Route to {} already exists", route.destination);
                }
                Ok(_) => log::debug!("Created route to {} dev {}", route.destination, route.device),
                Err(e) => {
                    log::error!("Failed to create route to {}: {:#}", prefix, e);
                    result = Err(DaemonError::Internal(e));
                }
            }
        }
        if result.is_ok() {
            self.tunnel_prefixes.insert(prefix);
        }
        result
    }

    async fn delete_prefix(&mut self, prefix: IpPrefix) -> DaemonResult<()> {
        if prefix.is_default() {
            self.default_route_capture = false;
        }

        let mut result = Ok(());
        for route in tunnel_routes(&prefix, &self.link) {
            match self.table.delete_route(&route).await {
                Ok(RouteOutcome::NotFound) => {
                    log::debug!("Route to {} already absent", route.destination);
                }
                Ok(_) => log::debug!("Deleted route to {}", route.destination),
                Err(e) => {
                    log::error!("Failed to delete route to {}: {:#}", prefix, e);
                    result = Err(DaemonError::Internal(e));
                }
            }
        }
        self.tunnel_prefixes.remove(&prefix);
        result
    }

    async fn exclusion_route(&self, prefix: &IpPrefix) -> Result<Option<RouteEntry>> {
        let uplink = self.table.uplink(prefix.is_ipv6(), &self.link.name).await?;
        Ok(uplink.map(|gw| RouteEntry {
            destination: *prefix,
            via: gw.address,
            device: gw.device,
            metric: gw.metric,
        }))
    }

    async fn add_exclusion(&mut self, prefix: IpPrefix) -> DaemonResult<()> {
        if let Some(existing) = self.exclusions.get_mut(&prefix) {
            existing.refs += 1;
            return Ok(());
        }

        let route = self.exclusion_route(&prefix).await?;
        let installed = match route {
            Some(route) => match self.table.add_route(&route).await {
                Ok(_) => {
                    log::info!("Excluded {} via {}", prefix, route.device);
                    Some(route)
                }
                Err(e) => {
                    log::error!("Failed to add exclusion route for {}: {:#}", prefix, e);
                    return Err(DaemonError::Internal(e));
                }
            },
            None => {
                log::warn!("No uplink for {} yet, exclusion pending", prefix);
                None
            }
        };

        self.exclusions.insert(prefix, Exclusion { refs: 1, installed });
        Ok(())
    }

    async fn delete_exclusion(&mut self, prefix: IpPrefix) -> DaemonResult<()> {
        let Some(existing) = self.exclusions.get_mut(&prefix) else {
            return Ok(());
        };
        existing.refs -= 1;
        if existing.refs > 0 {
            return Ok(());
        }

        let installed = self.exclusions.remove(&prefix).and_then(|e| e.installed);
        if let Some(route) = installed {
            match self.table.delete_route(&route).await {
                Ok(_) => log::info!("Removed exclusion for {}", prefix),
                Err(e) => {
                    log::error!("Failed to delete exclusion route for {}: {:#}", prefix, e);
                    return Err(DaemonError::Internal(e));
                }
            }
        }
        Ok(())
    }

    /// Re-assert routing intent after an external route-table change
    async fn reconcile(&mut self) {
        let prefixes: Vec<IpPrefix> = self.exclusions.keys().copied().collect();
        for prefix in prefixes {
            let wanted = match self.exclusion_route(&prefix).await {
                Ok(route) => route,
                Err(e) => {
                    log::warn!("Failed to resolve uplink for {}: {:#}", prefix, e);
                    continue;
                }
            };
            let Some(exclusion) = self.exclusions.get_mut(&prefix) else {
                continue;
            };
            if exclusion.installed == wanted {
                continue;
            }
            if let Some(old) = exclusion.installed.take() {
                if let Err(e) = self.table.delete_route(&old).await {
                    log::warn!(
                        "Failed to remove old exclusion for {} via {}: {:#}",
                        prefix,
                        old.device,
                        e
                    );
                }
            }
            if let Some(route) = wanted {
                match self.table.add_route(&route).await {
                    Ok(_) => {
                        log::info!("Moved exclusion for {} to {}", prefix, route.device);
                        exclusion.installed = Some(route);
                    }
                    Err(e) => log::error!("Failed to re-add exclusion for {}: {:#}", prefix, e),
                }
            }
        }

        if self.default_route_capture {
            let captured: Vec<IpPrefix> = self
                .tunnel_prefixes
                .iter()
                .filter(|p| p.is_default())
                .copied()
                .collect();
            for prefix in captured {
                for route in tunnel_routes(&prefix, &self.link) {
                    if let Ok(RouteOutcome::Created) = self.table.add_route(&route).await {
                        log::info!("Restored captured route {}", route.destination);
                    }
                }
            }
        }
    }

    /// Remove every exclusion route this owner installed
    async fn flush(&mut self) {
        for (prefix, exclusion) in std::mem::take(&mut self.exclusions) {
            if let Some(route) = exclusion.installed {
                if let Err(e) = self.table.delete_route(&route).await {
                    log::warn!("Failed to remove exclusion for {}: {:#}", prefix, e);
                }
            }
        }
    }

    fn snapshot(&self) -> RouteSnapshot {
        RouteSnapshot {
            default_route_capture: self.default_route_capture,
            tunnel_prefixes: self.tunnel_prefixes.clone(),
            exclusions: self.exclusions.keys().copied().collect(),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<RouteCommand>,
        mut changes: Option<mpsc::Receiver<RouteChange>>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        RouteCommand::UpdatePrefix(p, reply) => {
                            let _ = reply.send(self.update_prefix(p).await);
                        }
                        RouteCommand::DeletePrefix(p, reply) => {
                            let _ = reply.send(self.delete_prefix(p).await);
                        }
                        RouteCommand::AddExclusion(p, reply) => {
                            let _ = reply.send(self.add_exclusion(p).await);
                        }
                        RouteCommand::DeleteExclusion(p, reply) => {
                            let _ = reply.send(self.delete_exclusion(p).await);
                        }
                        RouteCommand::Snapshot(reply) => {
                            let _ = reply.send(self.snapshot());
                        }
                        RouteCommand::Shutdown(reply) => {
                            self.flush().await;
                            let _ = reply.send(());
                            return;
                        }
                    }
                }

                change = recv_change(&mut changes) => {
                    match change {
                        Some(change) => {
                            log::debug!("Route table changed: {}", change.raw);
                            self.reconcile().await;
                        }
                        None => {
                            log::warn!("Route monitor stopped for {}", self.link.name);
                            changes = None;
                        }
                    }
                }
            }
        }
        self.flush().await;
    }
}

async fn recv_change(changes: &mut Option<mpsc::Receiver<RouteChange>>) -> Option<RouteChange> {
    match changes {
        Some(rx) => rx.recv().await,
        None => futures::future::pending().await,
    }
}

/// Handle to the route owner task of one tunnel interface
pub struct RouteManager {
    tx: mpsc::Sender<RouteCommand>,
    task: JoinHandle<()>,
    link: LinkId,
}

impl RouteManager {
    /// Start the owner task bound to `link`, optionally with a route monitor
    pub fn spawn(
        table: std::sync::Arc<dyn RouteTable>,
        link: LinkId,
        monitor: bool,
    ) -> Result<Self> {
        let changes = if monitor {
            Some(table.watch().context("Failed to start route monitor")?)
        } else {
            None
        };

        let owner = RouteOwner {
            table,
            link: link.clone(),
            default_route_capture: false,
            tunnel_prefixes: BTreeSet::new(),
            exclusions: BTreeMap::new(),
        };

        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let task = tokio::spawn(owner.run(rx, changes));
        Ok(Self { tx, task, link })
    }

    /// The link this manager programs routes for
    pub fn link(&self) -> &LinkId {
        &self.link
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<DaemonResult<()>>) -> RouteCommand,
    ) -> DaemonResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| anyhow::anyhow!("Route task for {} has stopped", self.link.name))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("Route task for {} dropped the request", self.link.name))?
    }

    /// Install a route for `prefix` via the tunnel; already existing is success
    pub async fn update_route_prefix(&self, prefix: IpPrefix) -> DaemonResult<()> {
        self.request(|r| RouteCommand::UpdatePrefix(prefix, r)).await
    }

    /// Remove the tunnel route for `prefix`; not found is success
    pub async fn delete_route_prefix(&self, prefix: IpPrefix) -> DaemonResult<()> {
        self.request(|r| RouteCommand::DeletePrefix(prefix, r)).await
    }

    /// Route `prefix` around the tunnel via the uplink
    pub async fn add_exclusion_route(&self, prefix: IpPrefix) -> DaemonResult<()> {
        self.request(|r| RouteCommand::AddExclusion(prefix, r)).await
    }

    /// Drop one reference to an exclusion route
    pub async fn delete_exclusion_route(&self, prefix: IpPrefix) -> DaemonResult<()> {
        self.request(|r| RouteCommand::DeleteExclusion(prefix, r)).await
    }

    /// Current bookkeeping of the owner task
    pub async fn snapshot(&self) -> DaemonResult<RouteSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RouteCommand::Snapshot(reply_tx))
            .await
            .map_err(|_| anyhow::anyhow!("Route task for {} has stopped", self.link.name))?;
        Ok(reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("Route task for {} dropped the request", self.link.name))?)
    }

    /// Stop the monitor and remove installed exclusion routes
    pub async fn dispose(self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(RouteCommand::Shutdown(reply_tx)).await.is_ok() {
            let _ = reply_rx.await;
        }
        let _ = self.task.await;
    }
}
