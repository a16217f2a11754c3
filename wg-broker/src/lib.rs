// WireGuard Privilege Broker Library
// Shared modules for the daemon, the control client and tests

//! WireGuard Privilege Broker Library
//!
//! This library provides the privileged half of a VPN client: a root daemon
//! that brings WireGuard tunnels up and down, steers routes around them,
//! enforces a kill switch and answers on local session sockets.
//!
//! # Main Components
//!
//! - [`broker`]: Bootstrap and session endpoints, call dispatch
//! - [`client`]: Unprivileged client for the broker protocol
//! - [`config`]: Configuration file parsing and validation
//! - [`dns`]: Resolver assignment and cache flushes
//! - [`firewall`]: Kill switch anchors and packet filter backends
//! - [`route_manager`]: Tunnel and exclusion route ownership
//! - [`tunnel_service`]: Tunnel backend process control
//! - [`wg_controller`]: Per-interface tunnel lifecycle

pub mod broker;
pub mod client;
pub mod config;
pub mod dns;
pub mod error;
pub mod firewall;
pub mod logging;
pub mod route_manager;
pub mod system;
pub mod tunnel_service;
pub mod types;
pub mod uapi;
pub mod wg_controller;

#[cfg(test)]
pub(crate) mod testing;
