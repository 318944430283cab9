//! `permessage-deflate` negotiation (RFC 7692 Section 7.1).
//!
//! Validates a client's offer and builds the server's response parameters.
//! Payloads are never compressed: scenarios only need the extension to be
//! negotiated (or deliberately dropped) so RSV1 has a defined meaning.

use crate::error::{Error, Result};
use crate::extensions::{
    Capability, Extension, ExtensionOffer, ExtensionParam, ExtensionProcessor, RsvBits,
};

/// Extension token.
pub const EXTENSION_NAME: &str = "permessage-deflate";

const MIN_WINDOW_BITS: u8 = 8;
const MAX_WINDOW_BITS: u8 = 15;

const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";

/// Server-side preferences applied on top of what the client offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeflateConfig {
    /// Always answer with `server_no_context_takeover`.
    pub server_no_context_takeover: bool,
    /// Ask the client not to keep its compression context.
    pub client_no_context_takeover: bool,
    /// Largest LZ77 window the server will use.
    pub server_max_window_bits: u8,
    /// Largest window the client may use, when the client allows limiting it.
    pub client_max_window_bits: u8,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: MAX_WINDOW_BITS,
            client_max_window_bits: MAX_WINDOW_BITS,
        }
    }
}

impl DeflateConfig {
    /// Set `server_no_context_takeover`.
    #[must_use]
    pub fn server_no_context_takeover(mut self, value: bool) -> Self {
        self.server_no_context_takeover = value;
        self
    }

    /// Set `client_no_context_takeover`.
    #[must_use]
    pub fn client_no_context_takeover(mut self, value: bool) -> Self {
        self.client_no_context_takeover = value;
        self
    }

    /// Cap the server window.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidExtension`] if `bits` is outside 8..=15.
    pub fn server_max_window_bits(mut self, bits: u8) -> Result<Self> {
        self.server_max_window_bits = check_window_bits(SERVER_MAX_WINDOW_BITS, bits)?;
        Ok(self)
    }

    /// Cap the client window.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidExtension`] if `bits` is outside 8..=15.
    pub fn client_max_window_bits(mut self, bits: u8) -> Result<Self> {
        self.client_max_window_bits = check_window_bits(CLIENT_MAX_WINDOW_BITS, bits)?;
        Ok(self)
    }
}

fn check_window_bits(param: &str, bits: u8) -> Result<u8> {
    if (MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
        Ok(bits)
    } else {
        Err(Error::InvalidExtension(format!(
            "{param} must be {MIN_WINDOW_BITS}-{MAX_WINDOW_BITS}, got {bits}"
        )))
    }
}

fn parse_window_bits(param: &ExtensionParam) -> Result<u8> {
    let raw = param.value.as_deref().ok_or_else(|| {
        Error::InvalidExtension(format!("{} requires a value", param.name))
    })?;
    // RFC 7692: 1*DIGIT without leading zeros.
    if raw.starts_with('0') || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidExtension(format!(
            "Invalid {} value: {raw}",
            param.name
        )));
    }
    let bits = raw
        .parse::<u8>()
        .map_err(|_| Error::InvalidExtension(format!("Invalid {} value: {raw}", param.name)))?;
    check_window_bits(&param.name, bits)
}

fn require_flag(param: &ExtensionParam) -> Result<()> {
    match param.value {
        None => Ok(()),
        Some(_) => Err(Error::InvalidExtension(format!(
            "{} must not have a value",
            param.name
        ))),
    }
}

/// Parameters agreed for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeflateParams {
    /// Server resets its compression context per message.
    pub server_no_context_takeover: bool,
    /// Client resets its compression context per message.
    pub client_no_context_takeover: bool,
    /// Server window, `None` for the default 15 (omitted from the response).
    pub server_max_window_bits: Option<u8>,
    /// Client window, `None` when not limited.
    pub client_max_window_bits: Option<u8>,
}

impl DeflateParams {
    fn to_params(&self) -> Vec<ExtensionParam> {
        let mut params = Vec::new();
        if self.server_no_context_takeover {
            params.push(ExtensionParam::flag(SERVER_NO_CONTEXT_TAKEOVER));
        }
        if self.client_no_context_takeover {
            params.push(ExtensionParam::flag(CLIENT_NO_CONTEXT_TAKEOVER));
        }
        if let Some(bits) = self.server_max_window_bits {
            params.push(ExtensionParam::new(SERVER_MAX_WINDOW_BITS, bits.to_string()));
        }
        if let Some(bits) = self.client_max_window_bits {
            params.push(ExtensionParam::new(CLIENT_MAX_WINDOW_BITS, bits.to_string()));
        }
        params
    }
}

/// The `permessage-deflate` negotiator.
#[derive(Debug, Clone, Default)]
pub struct PerMessageDeflate {
    config: DeflateConfig,
}

impl PerMessageDeflate {
    /// Negotiator with the given server preferences.
    #[must_use]
    pub fn new(config: DeflateConfig) -> Self {
        Self { config }
    }

    /// Work out the response parameters for one offer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidExtension`] for unknown or duplicated
    /// parameters and malformed values.
    pub fn negotiate(&self, offer: &ExtensionOffer) -> Result<DeflateParams> {
        let mut seen: Vec<&str> = Vec::with_capacity(offer.params.len());
        let mut server_no_context_takeover = self.config.server_no_context_takeover;
        let mut server_bits: Option<u8> = None;
        let mut client_bits_allowed = false;
        let mut client_bits: Option<u8> = None;

        for param in &offer.params {
            if seen.contains(&param.name.as_str()) {
                return Err(Error::InvalidExtension(format!(
                    "Duplicate parameter: {}",
                    param.name
                )));
            }
            seen.push(param.name.as_str());

            match param.name.as_str() {
                SERVER_NO_CONTEXT_TAKEOVER => {
                    require_flag(param)?;
                    server_no_context_takeover = true;
                }
                CLIENT_NO_CONTEXT_TAKEOVER => require_flag(param)?,
                SERVER_MAX_WINDOW_BITS => server_bits = Some(parse_window_bits(param)?),
                CLIENT_MAX_WINDOW_BITS => {
                    client_bits_allowed = true;
                    if param.value.is_some() {
                        client_bits = Some(parse_window_bits(param)?);
                    }
                }
                other => {
                    return Err(Error::InvalidExtension(format!(
                        "Unknown parameter: {other}"
                    )));
                }
            }
        }

        let server_cap = self.config.server_max_window_bits;
        let server_max_window_bits = match server_bits {
            Some(bits) => Some(bits.min(server_cap)),
            None if server_cap < MAX_WINDOW_BITS => Some(server_cap),
            None => None,
        };

        // The response may only carry client_max_window_bits if offered.
        let client_cap = self.config.client_max_window_bits;
        let client_max_window_bits = match client_bits {
            Some(bits) => Some(bits.min(client_cap)),
            None if client_bits_allowed && client_cap < MAX_WINDOW_BITS => Some(client_cap),
            None => None,
        };

        Ok(DeflateParams {
            server_no_context_takeover,
            client_no_context_takeover: self.config.client_no_context_takeover,
            server_max_window_bits,
            client_max_window_bits,
        })
    }
}

impl Extension for PerMessageDeflate {
    fn name(&self) -> &str {
        EXTENSION_NAME
    }

    fn rsv_bits(&self) -> RsvBits {
        RsvBits::RSV1
    }

    fn accept(&self, offer: &ExtensionOffer) -> Result<Box<dyn ExtensionProcessor>> {
        let params = self.negotiate(offer)?;
        Ok(Box::new(DeflateProcessor { params }))
    }
}

/// A `permessage-deflate` agreement for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeflateProcessor {
    params: DeflateParams,
}

impl DeflateProcessor {
    /// The agreed parameters.
    #[must_use]
    pub fn params(&self) -> &DeflateParams {
        &self.params
    }
}

impl ExtensionProcessor for DeflateProcessor {
    fn name(&self) -> &str {
        EXTENSION_NAME
    }

    fn capability(&self) -> Capability {
        Capability::PerMessageCompression
    }

    fn rsv_bits(&self) -> RsvBits {
        RsvBits::RSV1
    }

    fn response(&self) -> ExtensionOffer {
        ExtensionOffer::with_params(EXTENSION_NAME, self.params.to_params())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(s: &str) -> ExtensionOffer {
        ExtensionOffer::parse(s).unwrap()
    }

    #[test]
    fn test_bare_offer_accepted_without_params() {
        let processor = PerMessageDeflate::default()
            .accept(&offer("permessage-deflate"))
            .unwrap();
        assert_eq!(processor.capability(), Capability::PerMessageCompression);
        assert_eq!(processor.rsv_bits(), RsvBits::RSV1);
        assert_eq!(processor.response().to_string(), "permessage-deflate");
    }

    #[test]
    fn test_client_max_window_bits_flag_is_not_echoed_by_default() {
        let params = PerMessageDeflate::default()
            .negotiate(&offer("permessage-deflate; client_max_window_bits"))
            .unwrap();
        assert_eq!(params.client_max_window_bits, None);
    }

    #[test]
    fn test_client_window_limited_when_allowed() {
        let config = DeflateConfig::default().client_max_window_bits(10).unwrap();
        let ext = PerMessageDeflate::new(config);
        let params = ext
            .negotiate(&offer("permessage-deflate; client_max_window_bits"))
            .unwrap();
        assert_eq!(params.client_max_window_bits, Some(10));

        // Not offered: must not appear in the response.
        let params = ext.negotiate(&offer("permessage-deflate")).unwrap();
        assert_eq!(params.client_max_window_bits, None);
    }

    #[test]
    fn test_server_window_takes_minimum() {
        let config = DeflateConfig::default().server_max_window_bits(12).unwrap();
        let ext = PerMessageDeflate::new(config);
        let params = ext
            .negotiate(&offer("permessage-deflate; server_max_window_bits=9"))
            .unwrap();
        assert_eq!(params.server_max_window_bits, Some(9));

        let params = ext.negotiate(&offer("permessage-deflate")).unwrap();
        assert_eq!(params.server_max_window_bits, Some(12));
    }

    #[test]
    fn test_response_params_order() {
        let ext = PerMessageDeflate::new(DeflateConfig::default().client_no_context_takeover(true));
        let processor = ext
            .accept(&offer(
                "permessage-deflate; server_no_context_takeover; server_max_window_bits=10",
            ))
            .unwrap();
        assert_eq!(
            processor.response().to_string(),
            "permessage-deflate; server_no_context_takeover; \
             client_no_context_takeover; server_max_window_bits=10"
        );
    }

    #[test]
    fn test_invalid_offers_rejected() {
        let ext = PerMessageDeflate::default();
        for bad in [
            "permessage-deflate; server_max_window_bits",
            "permessage-deflate; server_max_window_bits=7",
            "permessage-deflate; server_max_window_bits=16",
            "permessage-deflate; server_max_window_bits=010",
            "permessage-deflate; client_max_window_bits=abc",
            "permessage-deflate; server_no_context_takeover=1",
            "permessage-deflate; server_no_context_takeover; server_no_context_takeover",
            "permessage-deflate; x-unknown",
        ] {
            assert!(
                matches!(ext.negotiate(&offer(bad)), Err(Error::InvalidExtension(_))),
                "accepted {bad}"
            );
        }
    }

    #[test]
    fn test_config_window_bounds() {
        assert!(DeflateConfig::default().server_max_window_bits(7).is_err());
        assert!(DeflateConfig::default().client_max_window_bits(16).is_err());
        assert!(DeflateConfig::default().server_max_window_bits(8).is_ok());
    }
}
