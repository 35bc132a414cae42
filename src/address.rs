use std::fmt;
use std::path::{Path, PathBuf};

/// Where an MPD server can be reached: a host (or UNIX socket path) and an
/// optional port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// Host name, IP address, or UNIX socket path.
    pub host: String,
    /// TCP port. `None` for UNIX sockets.
    pub port: Option<String>,
}

impl Address {
    /// Creates an address, treating an empty port as no port.
    pub fn new(host: impl Into<String>, port: Option<String>) -> Self {
        Self {
            host: host.into(),
            port: port.filter(|p| !p.is_empty()),
        }
    }

    /// A TCP address.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, Some(port.to_string()))
    }

    /// A UNIX socket address. The socket path is used as the host.
    pub fn unix(path: impl AsRef<Path>) -> Self {
        Self::new(path.as_ref().to_string_lossy(), None)
    }

    /// The socket path, when this address names a UNIX socket.
    pub fn socket_path(&self) -> Option<PathBuf> {
        if self.port.is_none() && self.host.starts_with('/') {
            Some(PathBuf::from(&self.host))
        } else {
            None
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => f.write_str(&self.host),
        }
    }
}

/// Anything that advertises the address of an MPD server.
pub trait MpdAddress {
    fn address(&self) -> Address;
}

impl MpdAddress for Address {
    fn address(&self) -> Address {
        self.clone()
    }
}
