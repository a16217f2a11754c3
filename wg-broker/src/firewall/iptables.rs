//! iptables packet filter
//!
//! Each anchor is a chain `wgb.<anchor>` jumped from `wgb.root`, which sits at
//! the head of `OUTPUT`. iptables stops at the first match, so the jump order
//! differs from the anchor priority: DNS allow precedes DNS block, and the
//! catch-all blocks come last.

use anyhow::{Context, Result};
use futures::future::{BoxFuture, FutureExt};
use tokio::process::Command;

use super::{Anchor, AnchorRules, PacketFilter};

const ROOT_CHAIN: &str = "wgb.root";

/// Order in which `wgb.root` jumps to the anchor chains
pub const JUMP_ORDER: [Anchor; 10] = [
    Anchor::AllowLoopback,
    Anchor::AllowDns,
    Anchor::BlockDns,
    Anchor::AllowVpn,
    Anchor::BlockNets,
    Anchor::AllowDhcp,
    Anchor::AllowLan,
    Anchor::AllowNets,
    Anchor::BlockIpv6,
    Anchor::BlockAll,
];

pub fn chain_name(anchor: Anchor) -> String {
    format!("wgb.{}", anchor.name())
}

fn applies(anchor: Anchor, ipv6: bool) -> bool {
    if ipv6 {
        anchor.family().includes_v6()
    } else {
        anchor.family().includes_v4()
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Rule argument lists (after `-A <chain>`) for one anchor and family
pub fn render_rules(anchor: Anchor, rules: &AnchorRules, ipv6: bool) -> Vec<Vec<String>> {
    if !rules.enabled {
        return Vec::new();
    }

    let table: Vec<String> = rules
        .table
        .iter()
        .filter(|p| p.is_ipv6() == ipv6)
        .map(|p| p.to_string())
        .collect();
    let to_each = |verdict: &str| -> Vec<Vec<String>> {
        table
            .iter()
            .map(|dest| args(&["-d", dest.as_str(), "-j", verdict]))
            .collect()
    };

    match anchor {
        Anchor::AllowLoopback => vec![args(&["-o", "lo", "-j", "ACCEPT"])],
        Anchor::BlockAll | Anchor::BlockIpv6 => vec![args(&["-j", "REJECT"])],
        Anchor::AllowNets | Anchor::AllowLan => to_each("ACCEPT"),
        Anchor::BlockNets => to_each("REJECT"),
        Anchor::AllowVpn => {
            let mut out = Vec::new();
            for iface in &rules.interfaces {
                out.push(args(&["-o", iface.as_str(), "-j", "ACCEPT"]));
            }
            out.extend(to_each("ACCEPT"));
            out
        }
        Anchor::AllowDhcp => {
            let (sport, dport) = if ipv6 { ("546", "547") } else { ("68", "67") };
            vec![args(&["-p", "udp", "--sport", sport, "--dport", dport, "-j", "ACCEPT"])]
        }
        Anchor::BlockDns => ["udp", "tcp"]
            .iter()
            .map(|proto| args(&["-p", *proto, "--dport", "53", "-j", "REJECT"]))
            .collect(),
        Anchor::AllowDns => table
            .iter()
            .flat_map(|dest| {
                ["udp", "tcp"]
                    .into_iter()
                    .map(move |proto| args(&["-d", dest.as_str(), "-p", proto, "--dport", "53", "-j", "ACCEPT"]))
            })
            .collect(),
    }
}

/// iptables/ip6tables driven [`PacketFilter`]
#[derive(Debug, Clone)]
pub struct IptablesFilter {
    iptables: String,
    ip6tables: String,
}

impl Default for IptablesFilter {
    fn default() -> Self {
        Self {
            iptables: "iptables".to_string(),
            ip6tables: "ip6tables".to_string(),
        }
    }
}

impl IptablesFilter {
    fn binary(&self, ipv6: bool) -> &str {
        if ipv6 {
            &self.ip6tables
        } else {
            &self.iptables
        }
    }

    async fn run(&self, ipv6: bool, args: &[String]) -> Result<std::process::Output> {
        let bin = self.binary(ipv6);
        Command::new(bin)
            .arg("-w")
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", bin))
    }

    async fn run_checked(&self, ipv6: bool, args: &[String]) -> Result<()> {
        let output = self.run(ipv6, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{} {} failed: {}", self.binary(ipv6), args.join(" "), stderr.trim());
        }
        Ok(())
    }

    async fn ensure_chain(&self, ipv6: bool, chain: &str) -> Result<()> {
        let output = self.run(ipv6, &args(&["-N", chain])).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("already exists") {
                anyhow::bail!("Failed to create chain {}: {}", chain, stderr.trim());
            }
        }
        Ok(())
    }

    async fn install_family(&self, ipv6: bool) -> Result<()> {
        self.ensure_chain(ipv6, ROOT_CHAIN).await?;
        self.run_checked(ipv6, &args(&["-F", ROOT_CHAIN])).await?;

        for anchor in JUMP_ORDER.into_iter().filter(|a| applies(*a, ipv6)) {
            let chain = chain_name(anchor);
            self.ensure_chain(ipv6, &chain).await?;
            self.run_checked(ipv6, &args(&["-A", ROOT_CHAIN, "-j", chain.as_str()]))
                .await?;
        }

        let hooked = self
            .run(ipv6, &args(&["-C", "OUTPUT", "-j", ROOT_CHAIN]))
            .await?
            .status
            .success();
        if !hooked {
            self.run_checked(ipv6, &args(&["-I", "OUTPUT", "1", "-j", ROOT_CHAIN]))
                .await?;
        }
        Ok(())
    }

    async fn uninstall_family(&self, ipv6: bool) -> Result<()> {
        // Each step tolerates missing chains
        let _ = self.run(ipv6, &args(&["-D", "OUTPUT", "-j", ROOT_CHAIN])).await?;
        let _ = self.run(ipv6, &args(&["-F", ROOT_CHAIN])).await?;
        for anchor in Anchor::ALL.into_iter().filter(|a| applies(*a, ipv6)) {
            let chain = chain_name(anchor);
            let _ = self.run(ipv6, &args(&["-F", chain.as_str()])).await?;
            let _ = self.run(ipv6, &args(&["-X", chain.as_str()])).await?;
        }
        let _ = self.run(ipv6, &args(&["-X", ROOT_CHAIN])).await?;
        Ok(())
    }

    async fn apply_family(&self, ipv6: bool, anchor: Anchor, rules: &AnchorRules) -> Result<()> {
        let chain = chain_name(anchor);
        self.run_checked(ipv6, &args(&["-F", chain.as_str()])).await?;
        for rule in render_rules(anchor, rules, ipv6) {
            let mut full = args(&["-A", chain.as_str()]);
            full.extend(rule);
            self.run_checked(ipv6, &full).await?;
        }
        Ok(())
    }
}

impl PacketFilter for IptablesFilter {
    fn name(&self) -> &'static str {
        "iptables"
    }

    fn install(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            self.install_family(false).await?;
            self.install_family(true).await
        }
        .boxed()
    }

    fn uninstall(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            self.uninstall_family(false).await?;
            self.uninstall_family(true).await
        }
        .boxed()
    }

    fn apply<'a>(&'a self, anchor: Anchor, rules: &'a AnchorRules) -> BoxFuture<'a, Result<()>> {
        async move {
            if applies(anchor, false) {
                self.apply_family(false, anchor, rules).await?;
            }
            if applies(anchor, true) {
                self.apply_family(true, anchor, rules).await?;
            }
            Ok(())
        }
        .boxed()
    }
}
