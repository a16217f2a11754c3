//! Session wire protocol
//!
//! Newline-delimited JSON frames. A client sends [`Request`]s; the broker
//! answers each with exactly one [`ServerMessage::Response`] carrying the same
//! id, and may push [`ServerMessage::Event`]s at any time.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, Lines};

use crate::error::DaemonError;
use crate::types::{DaemonEvent, ErrorCode, FirewallConfig, InterfaceConfig, IpPrefix};

/// Remotable operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "method",
    content = "params",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Call {
    Ping,
    CreateSession,

    AddInterface { config: InterfaceConfig },
    DeleteInterface { interface: String },
    UpdatePeer { config: InterfaceConfig },
    DeletePeer { config: InterfaceConfig },
    GetPeerStatus { interface: String },

    UpdateRoutePrefix { interface: Option<String>, prefix: IpPrefix },
    DeleteRoutePrefix { interface: Option<String>, prefix: IpPrefix },
    AddExclusionRoute { interface: Option<String>, prefix: IpPrefix },
    DeleteExclusionRoute { interface: Option<String>, prefix: IpPrefix },
    ExcludeLocalNetworks { interface: Option<String>, prefixes: Vec<IpPrefix> },

    FlushDns,
    UpdateResolvers { interface: String, resolvers: Vec<IpAddr> },

    EnableKillSwitch { config: FirewallConfig },
    DisableKillSwitch,
    EnablePeerTraffic { config: InterfaceConfig },
    DisablePeerTraffic { public_key: String },

    GetTapList,
    CheckAndInstallDriver,

    SetLogsEnabled { enabled: bool },
    ClearLogs,
    CleanUp,

    InstallApp { path: PathBuf },
    MountDmg { path: PathBuf, mount: bool },
}

impl Call {
    /// Wire name of the call
    pub fn method(&self) -> &'static str {
        match self {
            Call::Ping => "ping",
            Call::CreateSession => "createSession",
            Call::AddInterface { .. } => "addInterface",
            Call::DeleteInterface { .. } => "deleteInterface",
            Call::UpdatePeer { .. } => "updatePeer",
            Call::DeletePeer { .. } => "deletePeer",
            Call::GetPeerStatus { .. } => "getPeerStatus",
            Call::UpdateRoutePrefix { .. } => "updateRoutePrefix",
            Call::DeleteRoutePrefix { .. } => "deleteRoutePrefix",
            Call::AddExclusionRoute { .. } => "addExclusionRoute",
            Call::DeleteExclusionRoute { .. } => "deleteExclusionRoute",
            Call::ExcludeLocalNetworks { .. } => "excludeLocalNetworks",
            Call::FlushDns => "flushDns",
            Call::UpdateResolvers { .. } => "updateResolvers",
            Call::EnableKillSwitch { .. } => "enableKillSwitch",
            Call::DisableKillSwitch => "disableKillSwitch",
            Call::EnablePeerTraffic { .. } => "enablePeerTraffic",
            Call::DisablePeerTraffic { .. } => "disablePeerTraffic",
            Call::GetTapList => "getTapList",
            Call::CheckAndInstallDriver => "checkAndInstallDriver",
            Call::SetLogsEnabled { .. } => "setLogsEnabled",
            Call::ClearLogs => "clearLogs",
            Call::CleanUp => "cleanUp",
            Call::InstallApp { .. } => "installApp",
            Call::MountDmg { .. } => "mountDmg",
        }
    }

    /// Whether the call changes host state and must be logged around execution
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Call::Ping | Call::CreateSession | Call::GetPeerStatus { .. } | Call::GetTapList
        )
    }
}

/// Client frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub call: Call,
}

/// Failure reported to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&DaemonError> for WireError {
    fn from(err: &DaemonError) -> Self {
        Self {
            code: err.code(),
            message: format!("{:#}", err),
        }
    }
}

/// Result of one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Ok(serde_json::Value),
    Err(WireError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub outcome: Outcome,
}

/// Server frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerMessage {
    Response(Response),
    Event(DaemonEvent),
}

/// Write one frame followed by a newline
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(frame).context("Failed to encode frame")?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .await
        .context("Failed to write frame")?;
    writer.flush().await.context("Failed to flush frame")?;
    Ok(())
}

/// Read the next frame, skipping blank lines; `None` at end of stream.
///
/// Cancel safe: only `next_line` is awaited.
pub async fn read_frame<R, T>(lines: &mut Lines<R>) -> Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    loop {
        let Some(line) = lines.next_line().await.context("Failed to read frame")? else {
            return Ok(None);
        };
        if line.trim().is_empty() {
            continue;
        }
        let frame = serde_json::from_str(line.trim()).context("Malformed frame")?;
        return Ok(Some(frame));
    }
}
