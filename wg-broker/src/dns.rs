// systemd-resolved control via D-Bus

//! DNS control
//!
//! Cache flushes and per-link resolver assignment go through
//! systemd-resolved's manager object on the system bus.

use anyhow::{Context, Result};
use futures::future::{BoxFuture, FutureExt};
use std::net::IpAddr;
use zbus::{proxy, Connection};

/// AF_INET as resolved expects it
const AF_INET: i32 = 2;
/// AF_INET6 as resolved expects it
const AF_INET6: i32 = 10;

/// D-Bus proxy for the resolved manager
#[proxy(
    interface = "org.freedesktop.resolve1.Manager",
    default_service = "org.freedesktop.resolve1",
    default_path = "/org/freedesktop/resolve1"
)]
trait Resolve1Manager {
    /// Assign DNS servers to a link
    #[zbus(name = "SetLinkDNS")]
    fn set_link_dns(&self, ifindex: i32, addresses: &[(i32, Vec<u8>)]) -> zbus::Result<()>;

    /// Drop every cached record
    fn flush_caches(&self) -> zbus::Result<()>;
}

/// DNS capability used by the broker
pub trait DnsControl: Send + Sync {
    fn flush(&self) -> BoxFuture<'_, Result<()>>;

    fn set_link_resolvers<'a>(
        &'a self,
        ifindex: u32,
        resolvers: &'a [IpAddr],
    ) -> BoxFuture<'a, Result<()>>;
}

/// Encode resolver addresses as `(family, bytes)` pairs
pub fn encode_resolvers(resolvers: &[IpAddr]) -> Vec<(i32, Vec<u8>)> {
    resolvers
        .iter()
        .map(|addr| match addr {
            IpAddr::V4(v4) => (AF_INET, v4.octets().to_vec()),
            IpAddr::V6(v6) => (AF_INET6, v6.octets().to_vec()),
        })
        .collect()
}

/// systemd-resolved backed [`DnsControl`]
#[derive(Debug, Default)]
pub struct ResolvedDns;

impl ResolvedDns {
    async fn manager(connection: &Connection) -> Result<Resolve1ManagerProxy<'_>> {
        Resolve1ManagerProxy::new(connection)
            .await
            .context("Failed to create resolve1 proxy")
    }

    async fn flush_caches(&self) -> Result<()> {
        let connection = Connection::system()
            .await
            .context("Failed to connect to system D-Bus")?;
        Self::manager(&connection)
            .await?
            .flush_caches()
            .await
            .context("FlushCaches failed")?;
        log::info!("DNS caches flushed");
        Ok(())
    }

    async fn set_link(&self, ifindex: u32, resolvers: &[IpAddr]) -> Result<()> {
        let ifindex = i32::try_from(ifindex).context("Interface index out of range")?;
        let connection = Connection::system()
            .await
            .context("Failed to connect to system D-Bus")?;
        Self::manager(&connection)
            .await?
            .set_link_dns(ifindex, &encode_resolvers(resolvers))
            .await
            .context("SetLinkDNS failed")?;
        log::info!("Set {} resolvers on link {}", resolvers.len(), ifindex);
        Ok(())
    }
}

impl DnsControl for ResolvedDns {
    fn flush(&self) -> BoxFuture<'_, Result<()>> {
        self.flush_caches().boxed()
    }

    fn set_link_resolvers<'a>(
        &'a self,
        ifindex: u32,
        resolvers: &'a [IpAddr],
    ) -> BoxFuture<'a, Result<()>> {
        self.set_link(ifindex, resolvers).boxed()
    }
}
