//! Reserved-bits scenario.
//!
//! Sends one text frame with exactly one of RSV1, RSV2 or RSV3 set, so a
//! client can be checked for failing the connection. The resource must end
//! in `?compressed=(true|false)&bitNumber=<digit>`:
//!
//! - `compressed=false` drops every negotiated extension, so any RSV bit is
//!   unexpected;
//! - `compressed=true` keeps a negotiated per-message compression extension
//!   (RSV1 then has a meaning) and drops everything otherwise.
//!
//! Digits other than 1, 2 and 3 produce a plain text frame describing the
//! mistake instead.

use bytes::BytesMut;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::extensions::Capability;
use crate::protocol::Frame;
use crate::scenario::{Scenario, Session, UpgradeRequest};

/// Conventional resource path of this scenario.
pub const RESOURCE_PATH: &str = "/websocket/tests/hybi/reserved-bits";

/// Payload of the frames carrying a reserved bit.
pub const IGNORED_MESSAGE: &str = "This message should be ignored.";

/// Body of the `400` answer to a malformed query.
pub const QUERY_FAILURE: &str = "FAIL: Query value is incorrect or missing";

/// Parameters selected by the query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedBitsQuery {
    /// Keep a negotiated compression extension.
    pub compressed: bool,
    /// Selector digit, 0..=9.
    pub bit_number: u8,
}

impl ReservedBitsQuery {
    /// Match `?compressed=(true|false)&bitNumber=(\d)` at the very end of
    /// `resource`.
    ///
    /// Anything before the `?` is ignored, so the scenario works under any
    /// path prefix. Returns `None` if the suffix does not match exactly.
    #[must_use]
    pub fn parse(resource: &str) -> Option<Self> {
        let (head, digit) = resource.split_at_checked(resource.len().checked_sub(1)?)?;
        let bit_number = match digit.as_bytes() {
            [d @ b'0'..=b'9'] => d - b'0',
            _ => return None,
        };

        let head = head.strip_suffix("&bitNumber=")?;
        let (head, compressed) = if let Some(rest) = head.strip_suffix("true") {
            (rest, true)
        } else {
            (head.strip_suffix("false")?, false)
        };
        head.strip_suffix("?compressed=")?;

        Some(Self {
            compressed,
            bit_number,
        })
    }
}

/// The reserved bit a selector digit names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservedBit {
    /// RSV1 (0x40).
    Rsv1,
    /// RSV2 (0x20).
    Rsv2,
    /// RSV3 (0x10).
    Rsv3,
}

impl ReservedBit {
    /// Map 1, 2, 3 to RSV1, RSV2, RSV3.
    #[must_use]
    pub const fn from_number(bit_number: u8) -> Option<Self> {
        match bit_number {
            1 => Some(Self::Rsv1),
            2 => Some(Self::Rsv2),
            3 => Some(Self::Rsv3),
            _ => None,
        }
    }

    /// `(rsv1, rsv2, rsv3)` flags with only this bit set.
    #[must_use]
    pub const fn flags(self) -> (bool, bool, bool) {
        match self {
            Self::Rsv1 => (true, false, false),
            Self::Rsv2 => (false, true, false),
            Self::Rsv3 => (false, false, true),
        }
    }
}

/// Build the single frame this scenario emits for `bit_number`.
#[must_use]
pub fn build_frame(bit_number: u8) -> Frame {
    match ReservedBit::from_number(bit_number) {
        Some(bit) => {
            let (rsv1, rsv2, rsv3) = bit.flags();
            Frame::text(IGNORED_MESSAGE).with_rsv(rsv1, rsv2, rsv3)
        }
        None => Frame::text(format!("FAIL: Invalid bit number: {bit_number}")),
    }
}

/// The reserved-bits scenario. Stateless; everything per connection lives
/// in [`ReservedBitsSession`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReservedBitsScenario;

impl Scenario for ReservedBitsScenario {
    fn name(&self) -> &str {
        "reserved-bits"
    }

    fn extra_handshake(&self, request: &mut UpgradeRequest) -> Result<Box<dyn Session>> {
        let Some(query) = ReservedBitsQuery::parse(request.resource()) else {
            return Err(Error::ScenarioRejected {
                status: 400,
                reason: QUERY_FAILURE.to_string(),
            });
        };

        if !query.compressed {
            request.extensions.clear();
        } else if request
            .extensions
            .find_by_capability(Capability::PerMessageCompression)
            .is_none()
        {
            request.extensions.clear();
        }

        debug!(
            compressed = query.compressed,
            bit = query.bit_number,
            extensions = request.extensions.len(),
            "reserved-bits handshake accepted"
        );
        Ok(Box::new(ReservedBitsSession::new(query.bit_number)))
    }
}

/// One connection's selector, consumed by the frame emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedBitsSession {
    bit_number: u8,
}

impl ReservedBitsSession {
    /// Session emitting the frame for `bit_number`.
    #[must_use]
    pub const fn new(bit_number: u8) -> Self {
        Self { bit_number }
    }

    /// The selector digit.
    #[must_use]
    pub const fn bit_number(&self) -> u8 {
        self.bit_number
    }
}

impl Session for ReservedBitsSession {
    fn transfer_data(&mut self, out: &mut BytesMut) -> Result<()> {
        let frame = build_frame(self.bit_number);
        info!(
            bit = self.bit_number,
            rsv1 = frame.rsv1,
            rsv2 = frame.rsv2,
            rsv3 = frame.rsv3,
            "emitting reserved-bits frame"
        );
        frame.encode_into(out, None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::{
        ExtensionOffer, ExtensionProcessor, ExtensionRegistry, NegotiatedExtensions,
    };
    use crate::protocol::{HandshakeRequest, OpCode};

    #[derive(Debug)]
    struct OtherExtension;

    impl ExtensionProcessor for OtherExtension {
        fn name(&self) -> &str {
            "x-webkit-test"
        }

        fn capability(&self) -> Capability {
            Capability::Other("x-webkit-test")
        }

        fn response(&self) -> ExtensionOffer {
            ExtensionOffer::new("x-webkit-test")
        }
    }

    fn upgrade(query: &str, offers: &str) -> UpgradeRequest {
        let raw = HandshakeRequest::client_request(
            "localhost",
            &format!("{RESOURCE_PATH}{query}"),
            "dGhlIHNhbXBsZSBub25jZQ==",
            (!offers.is_empty()).then_some(offers),
        )
        .unwrap();
        let handshake = HandshakeRequest::parse(&raw).unwrap();
        let offers = handshake.extension_offers().unwrap();
        let extensions = ExtensionRegistry::with_defaults().negotiate(&offers);
        UpgradeRequest::new(handshake, extensions)
    }

    fn emit(session: &mut dyn Session) -> Frame {
        let mut out = BytesMut::new();
        session.transfer_data(&mut out).unwrap();
        let (frame, used) = Frame::parse(&out).unwrap();
        assert_eq!(used, out.len(), "exactly one frame expected");
        frame
    }

    #[test]
    fn test_query_parse() {
        assert_eq!(
            ReservedBitsQuery::parse("/x?compressed=true&bitNumber=1"),
            Some(ReservedBitsQuery {
                compressed: true,
                bit_number: 1
            })
        );
        assert_eq!(
            ReservedBitsQuery::parse("?compressed=false&bitNumber=0"),
            Some(ReservedBitsQuery {
                compressed: false,
                bit_number: 0
            })
        );
    }

    #[test]
    fn test_query_parse_rejects() {
        for bad in [
            "",
            "/x",
            "/x?compressed=true",
            "/x?bitNumber=1&compressed=true",
            "/x?compressed=yes&bitNumber=1",
            "/x?compressed=true&bitNumber=12",
            "/x?compressed=true&bitNumber=",
            "/x?compressed=true&bitNumber=a",
            "/x?compressed=true&bitNumber=1&extra=1",
            "/x?a=b&compressed=true&bitNumber=1",
            "/x?compressed=true&bitNumber=\u{0663}",
        ] {
            assert_eq!(ReservedBitsQuery::parse(bad), None, "accepted {bad:?}");
        }
    }

    #[test]
    fn test_build_frame_sets_one_bit() {
        let frame = build_frame(1);
        assert_eq!((frame.rsv1, frame.rsv2, frame.rsv3), (true, false, false));
        let frame = build_frame(2);
        assert_eq!((frame.rsv1, frame.rsv2, frame.rsv3), (false, true, false));
        let frame = build_frame(3);
        assert_eq!((frame.rsv1, frame.rsv2, frame.rsv3), (false, false, true));

        for bit in 1..=3 {
            let frame = build_frame(bit);
            assert!(frame.fin);
            assert_eq!(frame.opcode, OpCode::Text);
            assert_eq!(frame.payload(), IGNORED_MESSAGE.as_bytes());
        }
    }

    #[test]
    fn test_build_frame_invalid_digit() {
        let frame = build_frame(7);
        assert!(!frame.has_rsv());
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.payload(), b"FAIL: Invalid bit number: 7");
    }

    #[test]
    fn test_compressed_false_clears_extensions() {
        let mut request = upgrade("?compressed=false&bitNumber=1", "permessage-deflate");
        assert_eq!(request.extensions.len(), 1);

        let mut session = ReservedBitsScenario.extra_handshake(&mut request).unwrap();
        assert!(request.extensions.is_empty());

        let frame = emit(session.as_mut());
        assert!(frame.rsv1);
    }

    #[test]
    fn test_compressed_true_keeps_deflate() {
        let mut request = upgrade(
            "?compressed=true&bitNumber=2",
            "permessage-deflate; client_max_window_bits",
        );
        let mut session = ReservedBitsScenario.extra_handshake(&mut request).unwrap();
        assert_eq!(request.extensions.response_entries(), vec!["permessage-deflate"]);

        let frame = emit(session.as_mut());
        assert!(frame.rsv2);
    }

    #[test]
    fn test_compressed_true_without_compression_clears() {
        let mut request = upgrade("?compressed=true&bitNumber=3", "");
        request.extensions.push(Box::new(OtherExtension));

        ReservedBitsScenario.extra_handshake(&mut request).unwrap();
        assert!(request.extensions.is_empty());
    }

    #[test]
    fn test_compressed_true_keeps_other_alongside_deflate() {
        let mut request = upgrade("?compressed=true&bitNumber=1", "permessage-deflate");
        request.extensions.push(Box::new(OtherExtension));

        ReservedBitsScenario.extra_handshake(&mut request).unwrap();
        assert_eq!(request.extensions.len(), 2);
    }

    #[test]
    fn test_malformed_query_rejects_upgrade() {
        let mut request = upgrade("?compressed=maybe&bitNumber=1", "");
        let err = ReservedBitsScenario
            .extra_handshake(&mut request)
            .err()
            .unwrap();
        assert_eq!(
            err,
            Error::ScenarioRejected {
                status: 400,
                reason: QUERY_FAILURE.to_string()
            }
        );
        assert_eq!(err.http_status(), Some(400));
    }

    #[test]
    fn test_sessions_are_independent() {
        let mut first = upgrade("?compressed=false&bitNumber=1", "");
        let mut second = upgrade("?compressed=false&bitNumber=3", "");
        let mut s1 = ReservedBitsScenario.extra_handshake(&mut first).unwrap();
        let mut s2 = ReservedBitsScenario.extra_handshake(&mut second).unwrap();

        assert!(emit(s2.as_mut()).rsv3);
        assert!(emit(s1.as_mut()).rsv1);
    }

    #[test]
    fn test_invalid_digit_session_emits_text() {
        let mut request = upgrade("?compressed=false&bitNumber=9", "");
        let mut session = ReservedBitsScenario.extra_handshake(&mut request).unwrap();
        let frame = emit(session.as_mut());
        assert!(!frame.has_rsv());
        assert_eq!(frame.payload(), b"FAIL: Invalid bit number: 9");
    }

    #[test]
    fn test_empty_negotiation_stays_empty() {
        let mut request = UpgradeRequest::new(
            upgrade("?compressed=true&bitNumber=1", "").handshake,
            NegotiatedExtensions::default(),
        );
        ReservedBitsScenario.extra_handshake(&mut request).unwrap();
        assert!(request.extensions.is_empty());
    }
}
