//! Unprivileged side of the broker protocol
//!
//! [`BrokerClient`] speaks to either endpoint: the bootstrap socket for
//! `createSession`, or a session socket for everything else. Events that
//! arrive while a call is pending are buffered for [`BrokerClient::take_events`].

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use crate::broker::protocol::{
    read_frame, write_frame, Call, Outcome, Request, ServerMessage, WireError,
};
use crate::types::DaemonEvent;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("transport failure: {0:#}")]
    Transport(#[from] anyhow::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("{}: {}", .0.code, .0.message)]
    Remote(WireError),

    #[error("broker closed the connection")]
    Closed,
}

/// One connection to a broker endpoint
pub struct BrokerClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    next_id: u64,
    events: VecDeque<DaemonEvent>,
}

impl BrokerClient {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| ClientError::Connect {
                path: path.to_path_buf(),
                source,
            })?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
            next_id: 0,
            events: VecDeque::new(),
        })
    }

    /// Send a call and wait for its response
    pub async fn call_raw(&mut self, call: Call) -> Result<Value, ClientError> {
        self.next_id += 1;
        let id = self.next_id;
        write_frame(&mut self.writer, &Request { id, call }).await?;

        loop {
            let frame: Option<ServerMessage> = read_frame(&mut self.lines).await?;
            match frame {
                None => return Err(ClientError::Closed),
                Some(ServerMessage::Event(event)) => self.events.push_back(event),
                Some(ServerMessage::Response(response)) if response.id == id => {
                    return match response.outcome {
                        Outcome::Ok(value) => Ok(value),
                        Outcome::Err(err) => Err(ClientError::Remote(err)),
                    };
                }
                Some(ServerMessage::Response(response)) => {
                    return Err(match response.outcome {
                        // Broker could not parse what we sent
                        Outcome::Err(err) if response.id == 0 => ClientError::Remote(err),
                        _ => ClientError::Protocol(format!(
                            "expected response {}, got {}",
                            id, response.id
                        )),
                    });
                }
            }
        }
    }

    /// Send a call and decode its result
    pub async fn call<T: DeserializeOwned>(&mut self, call: Call) -> Result<T, ClientError> {
        let value = self.call_raw(call).await?;
        serde_json::from_value(value).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    /// Ask the bootstrap endpoint for a session; `-1` on failure
    pub async fn create_session(&mut self) -> i64 {
        match self.call::<u32>(Call::CreateSession).await {
            Ok(id) => i64::from(id),
            Err(e) => {
                log::error!("createSession failed: {}", e);
                -1
            }
        }
    }

    /// Wait for the next unsolicited event
    pub async fn next_event(&mut self) -> Result<DaemonEvent, ClientError> {
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }
        loop {
            match read_frame(&mut self.lines).await? {
                None => return Err(ClientError::Closed),
                Some(ServerMessage::Event(event)) => return Ok(event),
                Some(ServerMessage::Response(response)) => {
                    log::warn!("Ignoring unsolicited response {}", response.id);
                }
            }
        }
    }

    /// Events buffered while calls were pending
    pub fn take_events(&mut self) -> Vec<DaemonEvent> {
        self.events.drain(..).collect()
    }
}
