use std::collections::HashMap;

use crate::address::Address;

/// Environment variable naming the MPD host a client should connect to.
pub const MPD_HOST: &str = "MPD_HOST";
/// Environment variable naming the MPD port a client should connect to.
pub const MPD_PORT: &str = "MPD_PORT";

/// A set of environment variables layered on top of the inherited
/// environment of a spawned process.
///
/// This type uses a `set` method instead of `insert` to emphasize the intent
/// of setting environment variables.
#[derive(Debug, Clone, Default)]
pub struct Environment(HashMap<String, String>);

impl Environment {
    /// Creates a new empty environment variable set.
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// Builds the environment that points an MPD client at `address`.
    ///
    /// Empty host or port values are omitted rather than passed as empty
    /// strings, so the client falls back to its own defaults.
    pub fn for_address(address: &Address) -> Self {
        let mut env = Self::new();
        if !address.host.is_empty() {
            env.set(MPD_HOST, address.host.clone());
        }
        if let Some(port) = address.port.as_deref().filter(|p| !p.is_empty()) {
            env.set(MPD_PORT, port);
        }
        env
    }

    /// Sets an environment variable in this environment set.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Extends this environment with variables from another environment.
    ///
    /// Variables in `other` overwrite variables with the same name.
    pub fn extend(&mut self, other: Environment) {
        self.0.extend(other.0);
    }

    /// Looks up a variable set in this environment (not the inherited one).
    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }

    /// Iterates over the variables in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}
