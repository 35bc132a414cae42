use std::path::{Path, PathBuf};

use crate::address::Address;

/// A password accepted by the server, and the permissions granted to
/// clients that present it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Password {
    /// The secret clients send with the `password` command.
    pub password: String,
    /// Permissions granted, e.g. `read`, `add`, `control`, `admin`.
    pub permissions: Vec<String>,
}

impl Password {
    /// Creates a password grant.
    pub fn new(password: impl Into<String>, permissions: &[&str]) -> Self {
        Self {
            password: password.into(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Options rendered into the server's configuration file.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Root directory of the music library.
    pub library_root: PathBuf,
    /// Overrides the workspace socket the server binds to. A TCP address
    /// renders both `bind_to_address` and `port`.
    pub bind_address: Option<Address>,
    /// Permissions for unauthenticated clients. Empty keeps the server default.
    pub default_permissions: Vec<String>,
    /// Rendered as `max_output_buffer_size` in KiB when set.
    pub max_output_buffer_size: Option<u64>,
    /// Extra passwords and the permissions they grant.
    pub passwords: Vec<Password>,
}

impl ServerConfig {
    /// A configuration serving `library_root` with server defaults for everything else.
    pub fn new(library_root: impl Into<PathBuf>) -> Self {
        Self {
            library_root: library_root.into(),
            ..Default::default()
        }
    }

    /// Renders the configuration file for a server whose private state lives
    /// under `root`, returning the file text and the address the server will
    /// listen on.
    pub fn build(&self, root: &Path) -> (String, Address) {
        let address = match &self.bind_address {
            Some(addr) => addr.clone(),
            None => Address::unix(root.join("socket")),
        };

        let mut conf = String::new();
        let mut line = |key: &str, value: &str| {
            conf.push_str(&format!("{key:<19} {}\n", quote(value)));
        };

        line("music_directory", &self.library_root.to_string_lossy());
        line("playlist_directory", &root.join("playlists").to_string_lossy());
        line("db_file", &root.join("database").to_string_lossy());
        line("pid_file", &root.join("pid").to_string_lossy());
        line("state_file", &root.join("state").to_string_lossy());
        line("sticker_file", &root.join("sticker.sql").to_string_lossy());
        line("bind_to_address", &address.host);
        if let Some(port) = &address.port {
            line("port", port);
        }
        if let Some(size) = self.max_output_buffer_size {
            line("max_output_buffer_size", &(size / 1024).to_string());
        }
        if !self.default_permissions.is_empty() {
            line("default_permissions", &self.default_permissions.join(","));
        }
        for password in &self.passwords {
            line(
                "password",
                &format!("{}@{}", password.password, password.permissions.join(",")),
            );
        }

        conf.push_str("audio_output {\n\ttype\t\t\"null\"\n\tname\t\t\"null\"\n}\n");

        (conf, address)
    }
}

/// Quotes a configuration value, escaping backslashes and double quotes.
fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}
