//! The fixture server: accepts TCP connections, performs the opening
//! handshake, hands the upgrade to the scenario registered for its path and
//! writes whatever the scenario's session produces.
//!
//! Every connection is served on its own task. Nothing selected during one
//! connection's handshake is visible to another.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::{Config, Limits};
use crate::error::{Error, Result};
use crate::extensions::ExtensionRegistry;
use crate::protocol::{
    Frame, HandshakeRejection, HandshakeRequest, HandshakeResponse, validate_origin,
};
use crate::scenario::{ScenarioRegistry, Session, UpgradeRequest};

#[cfg(feature = "tls-rustls")]
use crate::tls::TlsAcceptor;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Close code sent after a session's output.
const NORMAL_CLOSURE: u16 = 1000;

/// Serves single connections over any byte stream.
///
/// [`FixtureServer`] wraps one of these behind a TCP listener; tests can
/// drive it directly over an in-memory duplex stream.
#[derive(Debug)]
pub struct ConnectionHandler {
    config: Config,
    scenarios: ScenarioRegistry,
    extensions: ExtensionRegistry,
}

impl ConnectionHandler {
    /// Handler with the default extension registry (permessage-deflate).
    #[must_use]
    pub fn new(config: Config, scenarios: ScenarioRegistry) -> Self {
        Self {
            config,
            scenarios,
            extensions: ExtensionRegistry::with_defaults(),
        }
    }

    /// Replace the extension registry.
    #[must_use]
    pub fn with_extensions(mut self, extensions: ExtensionRegistry) -> Self {
        self.extensions = extensions;
        self
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Serve one connection to completion.
    ///
    /// Reads the upgrade request, answers it with `101` or a rejection, runs
    /// the scenario's session, and closes.
    ///
    /// # Errors
    ///
    /// Returns the handshake error after the rejection has been written, or
    /// any I/O error and timeout along the way.
    pub async fn serve<S>(&self, mut stream: S, peer: Option<SocketAddr>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let head = with_timeout(
            self.config.timeouts.handshake,
            "handshake",
            read_head(&mut stream, &self.config.limits),
        )
        .await;

        let upgraded = head.and_then(|(head, _)| self.upgrade(&head, peer));
        let (response, mut session) = match upgraded {
            Ok(upgraded) => upgraded,
            Err(err) => {
                self.reject(&mut stream, &err, peer).await;
                return Err(err);
            }
        };

        let mut out = BytesMut::new();
        let mut head = Vec::new();
        response.write(&mut head)?;
        out.extend_from_slice(&head);
        session.transfer_data(&mut out)?;
        if self.config.close_after_transfer {
            Frame::close(Some(NORMAL_CLOSURE), "").encode_into(&mut out, None);
        }

        with_timeout(self.config.timeouts.write, "write", async {
            stream.write_all(&out).await?;
            stream.flush().await?;
            Ok::<(), Error>(())
        })
        .await?;
        debug!(?peer, bytes = out.len(), "session output written");

        if self.config.close_after_transfer {
            linger(&mut stream, self.config.timeouts.linger).await;
        }
        // The peer may already be gone.
        let _ = stream.shutdown().await;
        Ok(())
    }

    /// Run the handshake half that needs no I/O.
    fn upgrade(
        &self,
        head: &[u8],
        peer: Option<SocketAddr>,
    ) -> Result<(HandshakeResponse, Box<dyn Session>)> {
        let request =
            HandshakeRequest::parse_with_limit(head, self.config.limits.max_handshake_size)?;
        request.validate()?;

        if let Some(allowed) = &self.config.allowed_origins {
            validate_origin(request.origin.as_deref(), allowed)?;
        }

        let scenario = self
            .scenarios
            .get(request.path())
            .ok_or_else(|| Error::UnknownResource(request.path().to_string()))?;

        let offers = request.extension_offers()?;
        let negotiated = self.extensions.negotiate(&offers);

        let mut upgrade = UpgradeRequest::new(request, negotiated);
        if let Some(peer) = peer {
            upgrade = upgrade.with_peer(peer);
        }
        let session = scenario.extra_handshake(&mut upgrade)?;

        let mut response = HandshakeResponse::from_request(&upgrade.handshake);
        response.extensions = upgrade.extensions.response_entries();

        info!(
            ?peer,
            scenario = scenario.name(),
            resource = %upgrade.resource(),
            extensions = ?response.extensions,
            rsv = ?upgrade.extensions.rsv_bits(),
            "upgrade accepted"
        );
        Ok((response, session))
    }

    async fn reject<S>(&self, stream: &mut S, err: &Error, peer: Option<SocketAddr>)
    where
        S: AsyncWrite + Unpin,
    {
        let Some(rejection) = HandshakeRejection::from_error(err) else {
            debug!(?peer, error = %err, "handshake aborted");
            return;
        };
        warn!(?peer, status = rejection.status, error = %err, "upgrade rejected");

        let mut buf = Vec::new();
        rejection.write(&mut buf);
        let written = with_timeout(self.config.timeouts.write, "write", async {
            stream.write_all(&buf).await?;
            stream.flush().await?;
            stream.shutdown().await?;
            Ok::<(), Error>(())
        })
        .await;
        if let Err(write_err) = written {
            debug!(?peer, error = %write_err, "failed to write rejection");
        }
    }
}

/// Read up to and including the blank line ending an HTTP message head.
///
/// Returns the head and whatever followed it in the same reads.
pub(crate) async fn read_head<S>(stream: &mut S, limits: &Limits) -> Result<(Vec<u8>, BytesMut)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(pos) = find_terminator(&buf) {
            let end = pos + HEAD_TERMINATOR.len();
            limits.check_handshake_size(end)?;
            let head = buf.split_to(end).to_vec();
            return Ok((head, buf));
        }
        limits.check_handshake_size(buf.len())?;
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(Error::ConnectionClosed);
        }
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
}

/// Drain the peer until it closes or `duration` elapses.
async fn linger<S>(stream: &mut S, duration: Duration)
where
    S: AsyncRead + Unpin,
{
    let mut scratch = [0u8; 1024];
    let drained = tokio::time::timeout(duration, async {
        loop {
            match stream.read(&mut scratch).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if drained.is_err() {
        debug!("linger timed out");
    }
}

async fn with_timeout<T>(
    duration: Duration,
    stage: &'static str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| Error::Timeout(stage))?
}

/// A bound listener serving every registered scenario.
///
/// ```rust,no_run
/// use wsconform::{Config, FixtureServer, ScenarioRegistry};
///
/// # async fn run() -> wsconform::Result<()> {
/// let server = FixtureServer::bind(Config::default(), ScenarioRegistry::with_defaults()).await?;
/// println!("listening on {}", server.local_addr()?);
/// server.run().await
/// # }
/// ```
#[derive(Debug)]
pub struct FixtureServer {
    listener: TcpListener,
    handler: ConnectionHandler,
    #[cfg(feature = "tls-rustls")]
    tls: Option<TlsAcceptor>,
}

impl FixtureServer {
    /// Bind to `config.bind_addr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the address cannot be bound.
    pub async fn bind(config: Config, scenarios: ScenarioRegistry) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        Ok(Self {
            listener,
            handler: ConnectionHandler::new(config, scenarios),
            #[cfg(feature = "tls-rustls")]
            tls: None,
        })
    }

    /// Replace the extension registry.
    #[must_use]
    pub fn with_extensions(mut self, extensions: ExtensionRegistry) -> Self {
        self.handler = self.handler.with_extensions(extensions);
        self
    }

    /// Serve `wss://` by running every connection through `acceptor` first.
    #[cfg(feature = "tls-rustls")]
    #[must_use]
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// The address actually bound (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if accepting fails.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` completes. Connections already
    /// accepted run to completion on their own tasks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if accepting fails.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let local = self.local_addr()?;
        info!(addr = %local, "fixture server listening");

        let handler = Arc::new(self.handler);
        #[cfg(feature = "tls-rustls")]
        let tls = self.tls;
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => accepted?,
                () = &mut shutdown => {
                    info!(addr = %local, "fixture server shutting down");
                    return Ok(());
                }
            };
            debug!(%peer, "connection accepted");

            let handler = Arc::clone(&handler);
            #[cfg(feature = "tls-rustls")]
            let tls = tls.clone();
            tokio::spawn(async move {
                #[cfg(feature = "tls-rustls")]
                let served = match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => handler.serve(stream, Some(peer)).await,
                        Err(err) => Err(Error::Io(err.to_string())),
                    },
                    None => handler.serve(stream, Some(peer)).await,
                };
                #[cfg(not(feature = "tls-rustls"))]
                let served = handler.serve(stream, Some(peer)).await;

                if let Err(err) = served {
                    debug!(%peer, error = %err, "connection ended");
                }
            });
        }
    }
}
