//! A minimal client for checking a running fixture server.
//!
//! The probe performs the opening handshake, verifies the accept key, and
//! reads back the first frame without interpreting its reserved bits. A real
//! client would fail the connection on an unexpected RSV bit; the probe just
//! reports what arrived.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use crate::config::Limits;
use crate::error::{Error, Result};
use crate::extensions::deflate::EXTENSION_NAME as DEFLATE;
use crate::protocol::{Frame, HandshakeRequest, HandshakeResponse, compute_accept_key, generate_key};
use crate::server::read_head;

/// What to ask the server for.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Host header value.
    pub host: String,
    /// Request target, path plus query.
    pub resource: String,
    /// Offer permessage-deflate.
    pub offer_deflate: bool,
    /// Send a masked close frame after reading.
    pub send_close: bool,
    /// Size limits for the response head and the frame.
    pub limits: Limits,
    /// Deadline for the whole exchange.
    pub timeout: Duration,
}

impl ProbeOptions {
    /// Probe `resource` on `host` with default limits and a 10 second
    /// deadline.
    #[must_use]
    pub fn new(host: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            resource: resource.into(),
            offer_deflate: false,
            send_close: true,
            limits: Limits::default(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Offer permessage-deflate or not.
    #[must_use]
    pub fn with_deflate(mut self, offer: bool) -> Self {
        self.offer_deflate = offer;
        self
    }

    /// Close politely after reading, or just drop the connection.
    #[must_use]
    pub fn with_close(mut self, send: bool) -> Self {
        self.send_close = send;
        self
    }

    /// Replace the overall deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// The result of a successful probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    /// The server's `101` answer.
    pub response: HandshakeResponse,
    /// The first frame after the handshake.
    pub frame: Frame,
}

impl ProbeReport {
    /// True if the server accepted permessage-deflate.
    #[must_use]
    pub fn deflate_accepted(&self) -> bool {
        self.response
            .extensions
            .iter()
            .any(|ext| ext.split(';').next().map(str::trim) == Some(DEFLATE))
    }
}

/// Connect to `addr` and probe it.
///
/// # Errors
///
/// - `Error::ScenarioRejected` with the response body if the server refused
///   the upgrade
/// - `Error::InvalidHandshake` if the accept key is wrong
/// - `Error::Timeout` if the deadline passes
/// - anything the connection itself fails with
pub async fn probe(addr: impl ToSocketAddrs, options: &ProbeOptions) -> Result<ProbeReport> {
    let stream = TcpStream::connect(addr).await?;
    probe_stream(stream, options).await
}

/// Probe over an already connected stream.
///
/// # Errors
///
/// Same as [`probe`].
pub async fn probe_stream<S>(mut stream: S, options: &ProbeOptions) -> Result<ProbeReport>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(options.timeout, exchange(&mut stream, options))
        .await
        .map_err(|_| Error::Timeout("probe"))?
}

async fn exchange<S>(stream: &mut S, options: &ProbeOptions) -> Result<ProbeReport>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key()?;
    let request = HandshakeRequest::client_request(
        &options.host,
        &options.resource,
        &key,
        options.offer_deflate.then_some(DEFLATE),
    )?;
    stream.write_all(&request).await?;
    stream.flush().await?;

    let (head, mut buf) = read_head(stream, &options.limits).await?;
    let response = match HandshakeResponse::parse(&head) {
        Ok(response) => response,
        Err(Error::ScenarioRejected { status, .. }) => {
            let body = read_body(stream, buf, &options.limits).await?;
            return Err(Error::ScenarioRejected {
                status,
                reason: body,
            });
        }
        Err(err) => return Err(err),
    };

    let expected = compute_accept_key(&key);
    if response.accept != expected {
        return Err(Error::InvalidHandshake(format!(
            "Sec-WebSocket-Accept mismatch: got {}, expected {expected}",
            response.accept
        )));
    }
    debug!(extensions = ?response.extensions, "probe upgraded");

    let frame = read_frame(stream, &mut buf, &options.limits).await?;
    debug!(
        opcode = %frame.opcode,
        rsv1 = frame.rsv1,
        rsv2 = frame.rsv2,
        rsv3 = frame.rsv3,
        len = frame.payload().len(),
        "probe received frame"
    );

    if options.send_close {
        let mut mask = [0u8; 4];
        getrandom::getrandom(&mut mask).map_err(|e| Error::Io(e.to_string()))?;
        let mut out = BytesMut::new();
        Frame::close(Some(1000), "").encode_into(&mut out, Some(mask));
        stream.write_all(&out).await?;
        stream.flush().await?;
    }
    // The server may have closed first.
    let _ = stream.shutdown().await;

    Ok(ProbeReport { response, frame })
}

/// Read one frame, pulling more bytes from `stream` as needed.
async fn read_frame<S>(stream: &mut S, buf: &mut BytesMut, limits: &Limits) -> Result<Frame>
where
    S: AsyncRead + Unpin,
{
    loop {
        match Frame::parse(&buf[..]) {
            Ok((frame, used)) => {
                let _ = buf.split_to(used);
                return Ok(frame);
            }
            Err(Error::IncompleteFrame { needed }) => {
                limits.check_frame_size(buf.len() + needed)?;
            }
            Err(err) => return Err(err),
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(Error::ConnectionClosed);
        }
    }
}

/// Read a rejection body: the rest of the connection, bounded by the head
/// limit.
async fn read_body<S>(stream: &mut S, mut buf: BytesMut, limits: &Limits) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    loop {
        limits.check_handshake_size(buf.len())?;
        match stream.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            // A reset after the body still leaves the body usable.
            Err(_) if !buf.is_empty() => break,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
