//! pf packet filter
//!
//! Anchors live under `com.wgbroker/<anchor>` and are evaluated in name order.
//! Pass rules are `quick` and block rules are not, so a later allow anchor can
//! still override an earlier block anchor.

use anyhow::{Context, Result};
use futures::future::{BoxFuture, FutureExt};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{Anchor, AnchorRules, PacketFilter};

const ROOT_ANCHOR: &str = "com.wgbroker";

pub fn anchor_path(anchor: Anchor) -> String {
    format!("{}/{}", ROOT_ANCHOR, anchor.name())
}

/// Address table referenced by an anchor's rules
pub fn table_name(anchor: Anchor) -> Option<&'static str> {
    match anchor {
        Anchor::AllowNets => Some("allownets"),
        Anchor::BlockNets => Some("blocknets"),
        Anchor::AllowVpn => Some("vpnpeers"),
        Anchor::AllowLan => Some("lannets"),
        Anchor::AllowDns => Some("dnsaddr"),
        _ => None,
    }
}

/// Ruleset text loaded into one anchor
pub fn render_rules(anchor: Anchor, rules: &AnchorRules) -> String {
    if !rules.enabled {
        return String::new();
    }
    let table = table_name(anchor).unwrap_or_default();

    let lines: Vec<String> = match anchor {
        Anchor::AllowLoopback => vec!["pass quick on lo0 flags any keep state".to_string()],
        Anchor::BlockAll => vec!["block return out all flags any no state".to_string()],
        Anchor::AllowNets | Anchor::AllowLan => vec![
            format!("table <{}> persist", table),
            format!("pass out quick to <{}> flags any keep state", table),
        ],
        Anchor::BlockNets => vec![
            format!("table <{}> persist", table),
            format!("block return out to <{}> flags any no state", table),
        ],
        Anchor::AllowVpn => {
            let mut out = vec![format!("table <{}> persist", table)];
            for iface in &rules.interfaces {
                out.push(format!("pass out quick on {} flags any keep state", iface));
            }
            out.push(format!("pass out quick to <{}> flags any keep state", table));
            out
        }
        Anchor::BlockIpv6 => vec!["block return out inet6 all flags any no state".to_string()],
        Anchor::AllowDhcp => vec![
            "pass quick inet proto udp from any port 67:68 to any port 67:68 keep state".to_string(),
            "pass quick inet6 proto udp from any port 546:547 to any port 546:547 keep state"
                .to_string(),
        ],
        Anchor::BlockDns => {
            vec!["block return out proto { tcp, udp } to any port 53 flags any no state".to_string()]
        }
        Anchor::AllowDns => vec![
            format!("table <{}> persist", table),
            format!("pass out quick proto {{ tcp, udp }} to <{}> port 53 keep state", table),
        ],
    };

    let mut text = lines.join("\n");
    text.push('\n');
    text
}

/// pfctl driven [`PacketFilter`]
#[derive(Debug, Clone)]
pub struct PfFilter {
    pfctl: String,
}

impl Default for PfFilter {
    fn default() -> Self {
        Self {
            pfctl: "pfctl".to_string(),
        }
    }
}

impl PfFilter {
    async fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<()> {
        let mut child = Command::new(&self.pfctl)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to execute pfctl")?;

        if let Some(input) = stdin {
            let mut pipe = child.stdin.take().context("pfctl has no stdin")?;
            pipe.write_all(input.as_bytes())
                .await
                .context("Failed to write pf rules")?;
            // Closing stdin lets pfctl parse the ruleset
            drop(pipe);
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for pfctl")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("pfctl {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(())
    }

    fn root_ruleset() -> String {
        Anchor::ALL
            .iter()
            .map(|a| format!("anchor \"{}\"\n", a.name()))
            .collect()
    }
}

impl PacketFilter for PfFilter {
    fn name(&self) -> &'static str {
        "pf"
    }

    fn install(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            // Enabling an already enabled pf is reported on stderr only
            let _ = self.run(&["-E"], None).await;
            self.run(&["-a", ROOT_ANCHOR, "-f", "-"], Some(&Self::root_ruleset()))
                .await
        }
        .boxed()
    }

    fn uninstall(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            for anchor in Anchor::ALL {
                let path = anchor_path(anchor);
                if let Err(e) = self.run(&["-a", &path, "-F", "all"], None).await {
                    log::warn!("Failed to flush pf anchor {}: {:#}", path, e);
                }
            }
            self.run(&["-a", ROOT_ANCHOR, "-F", "all"], None).await
        }
        .boxed()
    }

    fn apply<'a>(&'a self, anchor: Anchor, rules: &'a AnchorRules) -> BoxFuture<'a, Result<()>> {
        async move {
            let path = anchor_path(anchor);
            if !rules.enabled {
                return self.run(&["-a", &path, "-F", "all"], None).await;
            }

            self.run(&["-a", &path, "-f", "-"], Some(&render_rules(anchor, rules)))
                .await?;

            if let Some(table) = table_name(anchor) {
                let entries: Vec<String> = rules.table.iter().map(|p| p.to_string()).collect();
                let mut args = vec!["-a", path.as_str(), "-t", table, "-T", "replace"];
                args.extend(entries.iter().map(String::as_str));
                self.run(&args, None).await?;
            }
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchor_path() {
        assert_eq!(anchor_path(Anchor::AllowVpn), "com.wgbroker/200.allowVPN");
    }

    #[test]
    fn test_root_ruleset_lists_all_anchors_in_order() {
        let root = PfFilter::root_ruleset();
        let lines: Vec<&str> = root.lines().collect();
        assert_eq!(lines.len(), 10);
        assert_eq!(lines[0], "anchor \"000.allowLoopback\"");
        assert_eq!(lines[9], "anchor \"320.allowDNS\"");
    }

    #[test]
    fn test_blocks_are_not_quick() {
        for anchor in Anchor::ALL {
            let text = render_rules(anchor, &AnchorRules::enabled());
            for line in text.lines().filter(|l| !l.starts_with("table")) {
                if anchor.is_block() {
                    assert!(line.starts_with("block") && !line.contains("quick"), "{}", line);
                } else {
                    assert!(line.starts_with("pass quick") || line.starts_with("pass out quick"), "{}", line);
                }
            }
        }
    }

    #[test]
    fn test_render_allow_vpn_with_interface() {
        let rules = AnchorRules {
            enabled: true,
            table: Vec::new(),
            interfaces: vec!["utun4".to_string()],
        };
        let text = render_rules(Anchor::AllowVpn, &rules);
        assert!(text.contains("table <vpnpeers> persist\n"));
        assert!(text.contains("pass out quick on utun4 flags any keep state\n"));
    }

    #[test]
    fn test_disabled_renders_empty() {
        assert!(render_rules(Anchor::AllowDns, &AnchorRules::disabled()).is_empty());
    }
}
