//! Test scenarios and the registry that routes upgrades to them.
//!
//! A [`Scenario`] has two entry points, called in order for every
//! connection routed to it:
//!
//! 1. [`Scenario::extra_handshake`] sees the parsed upgrade request and the
//!    extensions negotiated so far. It may drop extensions, and it either
//!    rejects the upgrade or returns a per-connection [`Session`].
//! 2. [`Session::transfer_data`] runs once after the `101` response and
//!    appends raw frame bytes to the output buffer.
//!
//! Anything a scenario selects during the handshake travels in its session,
//! so concurrent connections never see each other's choices.

pub mod reserved_bits;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;

use crate::error::{Error, Result};
use crate::extensions::NegotiatedExtensions;
use crate::protocol::HandshakeRequest;

pub use reserved_bits::ReservedBitsScenario;

/// An upgrade request as seen by a scenario's handshake hook.
#[derive(Debug)]
pub struct UpgradeRequest {
    /// The parsed and validated client request.
    pub handshake: HandshakeRequest,
    /// Extensions accepted so far; cleared entries are not answered.
    pub extensions: NegotiatedExtensions,
    /// Remote address, when known.
    pub peer: Option<SocketAddr>,
}

impl UpgradeRequest {
    /// Wrap a request and its negotiated extensions.
    #[must_use]
    pub fn new(handshake: HandshakeRequest, extensions: NegotiatedExtensions) -> Self {
        Self {
            handshake,
            extensions,
            peer: None,
        }
    }

    /// Attach the remote address.
    #[must_use]
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Raw request target, path plus query.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.handshake.resource
    }
}

/// Per-connection state produced by a successful extra handshake.
pub trait Session: Send {
    /// Append the bytes to send after the `101` response.
    ///
    /// # Errors
    ///
    /// Implementations return an error only if they cannot produce output at
    /// all; the server then closes the connection.
    fn transfer_data(&mut self, out: &mut BytesMut) -> Result<()>;
}

/// A test case reachable under one resource path.
pub trait Scenario: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Inspect the upgrade, adjust its extensions, and open a session.
    ///
    /// # Errors
    ///
    /// Returning an error rejects the upgrade; errors with an HTTP status
    /// (see [`Error::http_status`]) are answered with that status.
    fn extra_handshake(&self, request: &mut UpgradeRequest) -> Result<Box<dyn Session>>;
}

/// Resource path to scenario routing table.
#[derive(Clone, Default)]
pub struct ScenarioRegistry {
    scenarios: HashMap<String, Arc<dyn Scenario>>,
}

impl ScenarioRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in scenario at its conventional path.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.scenarios.insert(
            reserved_bits::RESOURCE_PATH.to_string(),
            Arc::new(ReservedBitsScenario),
        );
        registry
    }

    /// Route `path` to `scenario`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `path` is not absolute, carries a query,
    /// or is already taken.
    pub fn register(&mut self, path: impl Into<String>, scenario: Arc<dyn Scenario>) -> Result<()> {
        let path = path.into();
        if !path.starts_with('/') || path.contains('?') {
            return Err(Error::Config(format!(
                "Scenario path must be absolute and query-free: {path}"
            )));
        }
        if self.scenarios.contains_key(&path) {
            return Err(Error::Config(format!("Scenario path already registered: {path}")));
        }
        self.scenarios.insert(path, scenario);
        Ok(())
    }

    /// Look up the scenario for a resource path (query already stripped).
    #[must_use]
    pub fn get(&self, path: &str) -> Option<Arc<dyn Scenario>> {
        self.scenarios.get(path).cloned()
    }

    /// Registered paths, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.scenarios.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    /// Number of registered scenarios.
    #[must_use]
    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    /// True if no scenario is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}

impl fmt::Debug for ScenarioRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.paths().into_iter().map(|p| (p, self.scenarios[p].name())))
            .finish()
    }
}
