//! A minimal client for the MPD line protocol.
//!
//! Only the handful of commands the harness needs are implemented: the
//! greeting handshake used as a readiness probe, `status` for the indexing
//! gate and state queries, the queue and database listings, and the
//! playback controls tests drive.

use std::collections::HashMap;
use std::pin::Pin;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::debug;

use crate::address::Address;

const DEFAULT_PORT: &str = "6600";
const GREETING_PREFIX: &str = "OK MPD ";
/// Longest response line accepted from the server.
const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Errors talking to an MPD server.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Codec(#[from] LinesCodecError),

    #[error("unexpected greeting {0:?}")]
    BadGreeting(String),

    /// The server answered `ACK`.
    #[error("server rejected {command:?}: {message}")]
    Ack { command: String, message: String },

    #[error("malformed response line {0:?}")]
    Malformed(String),

    #[error("connection closed by server")]
    Closed,
}

/// One `key: value` block of a response.
pub type Attrs = HashMap<String, String>;

trait Connection: AsyncRead + AsyncWrite + Send {}
impl<T: AsyncRead + AsyncWrite + Send> Connection for T {}

/// One connection to an MPD server.
pub struct MpdClient {
    framed: Framed<Pin<Box<dyn Connection>>, LinesCodec>,
    version: String,
}

impl std::fmt::Debug for MpdClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpdClient")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl MpdClient {
    /// Connects to `address` and completes the greeting handshake.
    pub async fn connect(address: &Address) -> Result<Self, ProtocolError> {
        let stream: Pin<Box<dyn Connection>> = match address.socket_path() {
            Some(path) => Box::pin(UnixStream::connect(path).await?),
            None => {
                let port = address.port.as_deref().unwrap_or(DEFAULT_PORT);
                Box::pin(TcpStream::connect(format!("{}:{}", address.host, port)).await?)
            }
        };

        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let greeting = framed.next().await.ok_or(ProtocolError::Closed)??;
        let version = greeting
            .strip_prefix(GREETING_PREFIX)
            .ok_or_else(|| ProtocolError::BadGreeting(greeting.clone()))?
            .to_string();

        debug!("Connected to MPD {} at {}", version, address);
        Ok(Self { framed, version })
    }

    /// Protocol version announced in the server greeting.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Sends a raw command line and collects the response pairs, in order,
    /// up to the terminating `OK`.
    pub async fn command(&mut self, command: &str) -> Result<Vec<(String, String)>, ProtocolError> {
        self.framed.send(command).await?;

        let mut pairs = Vec::new();
        loop {
            let line = self.framed.next().await.ok_or(ProtocolError::Closed)??;
            if line == "OK" {
                return Ok(pairs);
            }
            if let Some(message) = line.strip_prefix("ACK ") {
                return Err(ProtocolError::Ack {
                    command: command.to_string(),
                    message: message.to_string(),
                });
            }
            let (key, value) = line
                .split_once(": ")
                .ok_or_else(|| ProtocolError::Malformed(line.clone()))?;
            pairs.push((key.to_string(), value.to_string()));
        }
    }

    /// Server status, e.g. `state`, `song`, `updating_db`.
    pub async fn status(&mut self) -> Result<Attrs, ProtocolError> {
        Ok(self.command("status").await?.into_iter().collect())
    }

    /// Authenticates with `password`.
    pub async fn password(&mut self, password: &str) -> Result<(), ProtocolError> {
        self.command(&format!("password {}", quote_arg(password)))
            .await
            .map(drop)
    }

    /// Pauses (`true`) or resumes (`false`) playback.
    pub async fn pause(&mut self, pause: bool) -> Result<(), ProtocolError> {
        self.command(if pause { "pause 1" } else { "pause 0" })
            .await
            .map(drop)
    }

    /// Skips to the next song in the queue.
    pub async fn next(&mut self) -> Result<(), ProtocolError> {
        self.command("next").await.map(drop)
    }

    /// Goes back to the previous song in the queue.
    pub async fn previous(&mut self) -> Result<(), ProtocolError> {
        self.command("previous").await.map(drop)
    }

    /// URIs of every file in the database.
    pub async fn list_files(&mut self) -> Result<Vec<String>, ProtocolError> {
        Ok(self
            .command("listall")
            .await?
            .into_iter()
            .filter(|(key, _)| key == "file")
            .map(|(_, value)| value)
            .collect())
    }

    /// One attribute block per song in the queue, in queue order.
    pub async fn playlist_info(&mut self) -> Result<Vec<Attrs>, ProtocolError> {
        let mut songs: Vec<Attrs> = Vec::new();
        for (key, value) in self.command("playlistinfo").await? {
            if key == "file" {
                songs.push(Attrs::new());
            }
            if let Some(song) = songs.last_mut() {
                song.insert(key, value);
            }
        }
        Ok(songs)
    }

    /// Politely ends the session. The server closes the connection without
    /// replying.
    pub async fn close(mut self) -> Result<(), ProtocolError> {
        self.framed.send("close").await?;
        Ok(())
    }
}

fn quote_arg(arg: &str) -> String {
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}
