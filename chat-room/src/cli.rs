use std::{fmt, num::NonZeroUsize, path::PathBuf, str::FromStr};

use clap::{Parser, ValueEnum};
use thiserror::Error;

use crate::room::{DeliveryPolicy, RoomConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address to listen on. A bare `:port` listens on every interface; port 0 picks a free one.
    #[arg(long, default_value = ":8080")]
    pub addr: ListenAddr,

    /// Directory holding the `chat.html` page template.
    #[arg(long, default_value = "templates")]
    pub templates: PathBuf,

    /// Messages buffered per client before the slow-client policy kicks in.
    #[arg(long, default_value = "256")]
    pub outbox_capacity: NonZeroUsize,

    /// What to do when a client's outbox is full.
    #[arg(long, value_enum, default_value_t = SlowClient::Block)]
    pub slow_client: SlowClient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SlowClient {
    /// Wait for the client to catch up, holding up the whole room.
    Block,
    /// Skip the client for that message.
    DropNewest,
}

impl From<SlowClient> for DeliveryPolicy {
    fn from(choice: SlowClient) -> Self {
        match choice {
            SlowClient::Block => DeliveryPolicy::Block,
            SlowClient::DropNewest => DeliveryPolicy::DropNewest,
        }
    }
}

impl Cli {
    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            outbox_capacity: self.outbox_capacity.get(),
            policy: self.slow_client.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("'{0}' is missing a port, expected host:port or :port")]
    MissingPort(String),
    #[error("'{0}' does not end in a valid port number")]
    InvalidPort(String),
}

/// `host:port` as accepted on the command line, with an empty host meaning
/// all interfaces. The host may be a name; it is resolved at bind time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddr(String);

impl ListenAddr {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ListenAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddrError::MissingPort(s.to_string()))?;
        port.parse::<u16>()
            .map_err(|_| AddrError::InvalidPort(s.to_string()))?;

        let host = if host.is_empty() { "0.0.0.0" } else { host };
        Ok(Self(format!("{host}:{port}")))
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
