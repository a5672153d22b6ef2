//! Authentication plugin seam.
//!
//! The connection only moves authentication bytes around; computing them is
//! up to an [`AuthPlugin`]. Only `mysql_clear_password` ships here, other
//! plugins are registered by the application.

use crate::error::ClientError;
use std::collections::HashMap;
use std::sync::Arc;

/// Name of the built-in clear-text plugin.
pub const CLEAR_PASSWORD: &str = "mysql_clear_password";

pub trait AuthPlugin: Send + Sync {
    /// Plugin name as announced by the server.
    fn name(&self) -> &str;

    /// First response to the server's seed.
    fn respond(&self, password: &[u8], seed: &[u8]) -> Result<Vec<u8>, ClientError>;

    /// Reply to an extra-data (0x01) packet; `None` sends nothing and keeps
    /// waiting for the server.
    fn more_data(&self, _password: &[u8], _data: &[u8]) -> Result<Option<Vec<u8>>, ClientError> {
        Ok(None)
    }
}

/// Sends the password as-is, NUL-terminated. Only safe over TLS.
#[derive(Debug, Default)]
pub struct ClearPassword;

impl AuthPlugin for ClearPassword {
    fn name(&self) -> &str {
        CLEAR_PASSWORD
    }

    fn respond(&self, password: &[u8], _seed: &[u8]) -> Result<Vec<u8>, ClientError> {
        let mut response = Vec::with_capacity(password.len() + 1);
        response.extend_from_slice(password);
        response.push(0);
        Ok(response)
    }
}

/// Plugins available to a connection, keyed by name.
#[derive(Clone)]
pub struct AuthRegistry {
    plugins: HashMap<String, Arc<dyn AuthPlugin>>,
}

impl std::fmt::Debug for AuthRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.plugins.keys().collect();
        names.sort();
        f.debug_struct("AuthRegistry")
            .field("plugins", &names)
            .finish()
    }
}

impl Default for AuthRegistry {
    fn default() -> Self {
        let mut registry = Self {
            plugins: HashMap::new(),
        };
        registry.register(Arc::new(ClearPassword));
        registry
    }
}

impl AuthRegistry {
    pub fn register(&mut self, plugin: Arc<dyn AuthPlugin>) {
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Picks the plugin for the initial handshake response.
    ///
    /// `None` when the server advertises nothing or a plugin that is not
    /// registered. The login then carries an empty response and waits for the
    /// server to switch to a plugin it can answer.
    pub fn select<'a>(&'a self, advertised: Option<&'a str>) -> Option<&'a str> {
        advertised.filter(|name| self.contains(name))
    }

    fn get(&self, name: &str) -> Result<&Arc<dyn AuthPlugin>, ClientError> {
        self.plugins
            .get(name)
            .ok_or_else(|| ClientError::Auth(format!("unsupported authentication plugin '{}'", name)))
    }

    /// Computes the response for `plugin`. An empty password always yields
    /// an empty response.
    pub fn respond(&self, plugin: &str, password: &[u8], seed: &[u8]) -> Result<Vec<u8>, ClientError> {
        if password.is_empty() {
            return Ok(Vec::new());
        }
        self.get(plugin)?.respond(password, seed)
    }

    pub fn more_data(
        &self,
        plugin: &str,
        password: &[u8],
        data: &[u8],
    ) -> Result<Option<Vec<u8>>, ClientError> {
        self.get(plugin)?.more_data(password, data)
    }
}
