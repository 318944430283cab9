//! # wsconform - WebSocket conformance fixtures
//!
//! `wsconform` is a small server that answers WebSocket upgrades with
//! deliberately unusual frames, so client implementations can be checked
//! against RFC 6455. Each test case is a [`Scenario`] registered under a
//! resource path.
//!
//! The built-in reserved-bits scenario sends one text frame with RSV1, RSV2
//! or RSV3 set, chosen by the query string:
//!
//! ```text
//! ws://127.0.0.1:8880/websocket/tests/hybi/reserved-bits?compressed=false&bitNumber=2
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wsconform::{Config, FixtureServer, ScenarioRegistry};
//!
//! # async fn run() -> wsconform::Result<()> {
//! let server = FixtureServer::bind(Config::default(), ScenarioRegistry::with_defaults()).await?;
//! server.run().await
//! # }
//! ```

pub mod config;
pub mod error;
pub mod extensions;
pub mod probe;
pub mod protocol;
pub mod scenario;
pub mod server;
pub mod trace;

#[cfg(feature = "tls-rustls")]
pub mod tls;

pub use config::{Config, Limits, Timeouts};
pub use error::{Error, Result};
pub use extensions::{Capability, ExtensionRegistry, NegotiatedExtensions};
pub use probe::{ProbeOptions, ProbeReport, probe, probe_stream};
pub use protocol::{Frame, HandshakeRequest, HandshakeResponse, OpCode, compute_accept_key};
pub use scenario::{ReservedBitsScenario, Scenario, ScenarioRegistry, Session, UpgradeRequest};
pub use server::{ConnectionHandler, FixtureServer};
