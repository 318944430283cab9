//! Extension negotiation (RFC 6455 Section 9).
//!
//! The server keeps an [`ExtensionRegistry`] of [`Extension`] negotiators.
//! For each upgrade the registry turns the client's offers into a
//! per-connection [`NegotiatedExtensions`] list of [`ExtensionProcessor`]s,
//! which a scenario may inspect or clear before the `101` response is
//! written. Processors are identified by an explicit [`Capability`] tag.
//!
//! Only negotiation lives here; no processor transforms payloads.

pub mod deflate;

use std::fmt;

use tracing::debug;

use crate::error::{Error, Result};

/// A single extension parameter: `name` or `name=value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionParam {
    /// Parameter name (e.g. `client_max_window_bits`).
    pub name: String,
    /// Parameter value, `None` for flags.
    pub value: Option<String>,
}

impl ExtensionParam {
    /// A parameter with a value.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    /// A flag parameter.
    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    /// Parse `name`, `name=value` or `name="value"`.
    pub fn parse(s: &str) -> Self {
        match s.trim().split_once('=') {
            Some((name, value)) => Self::new(name.trim(), value.trim().trim_matches('"')),
            None => Self::flag(s.trim()),
        }
    }
}

impl fmt::Display for ExtensionParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{}={}", self.name, v),
            None => f.write_str(&self.name),
        }
    }
}

/// One entry of a Sec-WebSocket-Extensions header: name plus parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionOffer {
    /// Extension token (e.g. `permessage-deflate`).
    pub name: String,
    /// Parameters in header order.
    pub params: Vec<ExtensionParam>,
}

impl ExtensionOffer {
    /// An entry without parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_params(name, Vec::new())
    }

    /// An entry with parameters.
    pub fn with_params(name: impl Into<String>, params: Vec<ExtensionParam>) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// Parse `name; p1=v1; p2`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidExtension`] if the name is empty.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split(';');
        let name = parts.next().unwrap_or_default().trim();
        if name.is_empty() {
            return Err(Error::InvalidExtension("Empty extension name".into()));
        }
        let params = parts
            .filter(|p| !p.trim().is_empty())
            .map(ExtensionParam::parse)
            .collect();
        Ok(Self::with_params(name, params))
    }

    /// Parse a whole comma-separated header value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidExtension`] if any entry has an empty name.
    pub fn parse_header(header: &str) -> Result<Vec<Self>> {
        header.split(',').map(Self::parse).collect()
    }

    /// Look up a parameter by name.
    pub fn get_param(&self, name: &str) -> Option<&ExtensionParam> {
        self.params.iter().find(|p| p.name == name)
    }

    /// True if a parameter with this name is present.
    pub fn has_param(&self, name: &str) -> bool {
        self.get_param(name).is_some()
    }
}

impl fmt::Display for ExtensionOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for param in &self.params {
            write!(f, "; {param}")?;
        }
        Ok(())
    }
}

/// Reserved header bits an extension claims.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RsvBits {
    /// Claims RSV1.
    pub rsv1: bool,
    /// Claims RSV2.
    pub rsv2: bool,
    /// Claims RSV3.
    pub rsv3: bool,
}

impl RsvBits {
    /// No bits claimed.
    pub const NONE: Self = Self {
        rsv1: false,
        rsv2: false,
        rsv3: false,
    };

    /// RSV1 only, as per-message compression uses it.
    pub const RSV1: Self = Self {
        rsv1: true,
        rsv2: false,
        rsv3: false,
    };

    /// True if both declarations claim the same bit.
    pub const fn conflicts_with(&self, other: &RsvBits) -> bool {
        (self.rsv1 && other.rsv1) || (self.rsv2 && other.rsv2) || (self.rsv3 && other.rsv3)
    }

    const fn union(self, other: RsvBits) -> Self {
        Self {
            rsv1: self.rsv1 || other.rsv1,
            rsv2: self.rsv2 || other.rsv2,
            rsv3: self.rsv3 || other.rsv3,
        }
    }
}

/// What an accepted extension does, independent of its concrete type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Compresses each message payload (e.g. `permessage-deflate`).
    PerMessageCompression,
    /// Anything else, named by its extension token.
    Other(&'static str),
}

/// An extension accepted for one connection.
pub trait ExtensionProcessor: Send + Sync + fmt::Debug {
    /// Extension token.
    fn name(&self) -> &str;

    /// Capability tag used to look processors up.
    fn capability(&self) -> Capability;

    /// Reserved bits this processor may set.
    fn rsv_bits(&self) -> RsvBits {
        RsvBits::NONE
    }

    /// The Sec-WebSocket-Extensions entry to send back.
    fn response(&self) -> ExtensionOffer;
}

/// A server-side negotiator, registered once and shared by all connections.
pub trait Extension: Send + Sync {
    /// Extension token matched against offers.
    fn name(&self) -> &str;

    /// Reserved bits processors of this extension may set.
    fn rsv_bits(&self) -> RsvBits {
        RsvBits::NONE
    }

    /// Accept one offer, producing the connection's processor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidExtension`] if the offered parameters are
    /// unacceptable; the caller then moves on to the next offer.
    fn accept(&self, offer: &ExtensionOffer) -> Result<Box<dyn ExtensionProcessor>>;
}

/// Negotiators the server is willing to accept.
#[derive(Default)]
pub struct ExtensionRegistry {
    extensions: Vec<Box<dyn Extension>>,
    used_rsv_bits: RsvBits,
}

impl ExtensionRegistry {
    /// An empty registry: every offer is declined.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry accepting `permessage-deflate` with default parameters.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.extensions.push(Box::new(deflate::PerMessageDeflate::default()));
        registry.used_rsv_bits = RsvBits::RSV1;
        registry
    }

    /// Register a negotiator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidExtension`] if its RSV bits clash with an
    /// already registered extension or its name is already registered.
    pub fn add(&mut self, extension: Box<dyn Extension>) -> Result<()> {
        if self.extensions.iter().any(|e| e.name() == extension.name()) {
            return Err(Error::InvalidExtension(format!(
                "Extension '{}' is already registered",
                extension.name()
            )));
        }
        let rsv = extension.rsv_bits();
        if self.used_rsv_bits.conflicts_with(&rsv) {
            return Err(Error::InvalidExtension(format!(
                "Extension '{}' RSV bits conflict with existing extensions",
                extension.name()
            )));
        }
        self.used_rsv_bits = self.used_rsv_bits.union(rsv);
        self.extensions.push(extension);
        Ok(())
    }

    /// Number of registered negotiators.
    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Negotiate the client's offers in order.
    ///
    /// The first acceptable offer for each extension name wins; later
    /// offers of an already accepted name and unknown names are ignored.
    pub fn negotiate(&self, offers: &[ExtensionOffer]) -> NegotiatedExtensions {
        let mut accepted = NegotiatedExtensions::default();
        for offer in offers {
            if accepted.iter().any(|p| p.name() == offer.name) {
                continue;
            }
            let Some(ext) = self.extensions.iter().find(|e| e.name() == offer.name) else {
                debug!(extension = %offer.name, "declining unknown extension");
                continue;
            };
            match ext.accept(offer) {
                Ok(processor) => accepted.push(processor),
                Err(err) => {
                    debug!(extension = %offer.name, error = %err, "declining extension offer");
                }
            }
        }
        accepted
    }
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field(
                "extensions",
                &self.extensions.iter().map(|e| e.name()).collect::<Vec<_>>(),
            )
            .field("used_rsv_bits", &self.used_rsv_bits)
            .finish()
    }
}

/// The processors accepted for one connection, in negotiation order.
#[derive(Debug, Default)]
pub struct NegotiatedExtensions {
    processors: Vec<Box<dyn ExtensionProcessor>>,
}

impl NegotiatedExtensions {
    /// Append an accepted processor.
    pub fn push(&mut self, processor: Box<dyn ExtensionProcessor>) {
        self.processors.push(processor);
    }

    /// Iterate over the accepted processors.
    pub fn iter(&self) -> impl Iterator<Item = &dyn ExtensionProcessor> {
        self.processors.iter().map(|p| p.as_ref())
    }

    /// First processor with the given capability.
    pub fn find_by_capability(&self, capability: Capability) -> Option<&dyn ExtensionProcessor> {
        self.iter().find(|p| p.capability() == capability)
    }

    /// Drop every accepted processor; the response will carry no extensions.
    pub fn clear(&mut self) {
        self.processors.clear();
    }

    /// Number of accepted processors.
    pub fn len(&self) -> usize {
        self.processors.len()
    }

    /// True if nothing was accepted.
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Combined reserved bits the accepted processors may set.
    pub fn rsv_bits(&self) -> RsvBits {
        self.iter()
            .fold(RsvBits::NONE, |acc, p| acc.union(p.rsv_bits()))
    }

    /// Sec-WebSocket-Extensions entries for the `101` response.
    pub fn response_entries(&self) -> Vec<String> {
        self.iter().map(|p| p.response().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Marker(&'static str);

    impl ExtensionProcessor for Marker {
        fn name(&self) -> &str {
            self.0
        }

        fn capability(&self) -> Capability {
            Capability::Other(self.0)
        }

        fn response(&self) -> ExtensionOffer {
            ExtensionOffer::new(self.0)
        }
    }

    struct MarkerExtension {
        name: &'static str,
        rsv: RsvBits,
    }

    impl Extension for MarkerExtension {
        fn name(&self) -> &str {
            self.name
        }

        fn rsv_bits(&self) -> RsvBits {
            self.rsv
        }

        fn accept(&self, offer: &ExtensionOffer) -> Result<Box<dyn ExtensionProcessor>> {
            if offer.has_param("refuse") {
                return Err(Error::InvalidExtension("refused".into()));
            }
            Ok(Box::new(Marker(self.name)))
        }
    }

    fn marker(name: &'static str) -> Box<dyn Extension> {
        Box::new(MarkerExtension {
            name,
            rsv: RsvBits::NONE,
        })
    }

    #[test]
    fn test_param_parse() {
        assert_eq!(
            ExtensionParam::parse(" client_max_window_bits = 10 "),
            ExtensionParam::new("client_max_window_bits", "10")
        );
        assert_eq!(
            ExtensionParam::parse("server_no_context_takeover"),
            ExtensionParam::flag("server_no_context_takeover")
        );
        assert_eq!(
            ExtensionParam::parse("x=\"quoted\"").value.as_deref(),
            Some("quoted")
        );
    }

    #[test]
    fn test_offer_parse_and_display() {
        let offer = ExtensionOffer::parse(
            "permessage-deflate; client_max_window_bits; server_max_window_bits=10",
        )
        .unwrap();
        assert_eq!(offer.name, "permessage-deflate");
        assert_eq!(offer.params.len(), 2);
        assert_eq!(
            offer.get_param("server_max_window_bits").unwrap().value.as_deref(),
            Some("10")
        );
        assert_eq!(
            offer.to_string(),
            "permessage-deflate; client_max_window_bits; server_max_window_bits=10"
        );
    }

    #[test]
    fn test_offer_parse_header() {
        let offers =
            ExtensionOffer::parse_header("permessage-deflate, x-webkit-test; a=1").unwrap();
        assert_eq!(offers.len(), 2);
        assert_eq!(offers[1].name, "x-webkit-test");
        assert!(ExtensionOffer::parse_header("permessage-deflate, ; a=1").is_err());
    }

    #[test]
    fn test_rsv_conflict_rejected() {
        let mut registry = ExtensionRegistry::with_defaults();
        let clash = Box::new(MarkerExtension {
            name: "x-rsv1",
            rsv: RsvBits::RSV1,
        });
        assert!(matches!(registry.add(clash), Err(Error::InvalidExtension(_))));
        assert!(registry.add(marker("x-plain")).is_ok());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = ExtensionRegistry::new();
        registry.add(marker("x-a")).unwrap();
        assert!(registry.add(marker("x-a")).is_err());
    }

    #[test]
    fn test_negotiate_in_client_order() {
        let mut registry = ExtensionRegistry::with_defaults();
        registry.add(marker("x-a")).unwrap();

        let offers =
            ExtensionOffer::parse_header("x-unknown, x-a, permessage-deflate, x-a").unwrap();
        let negotiated = registry.negotiate(&offers);

        let names: Vec<_> = negotiated.iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["x-a", "permessage-deflate"]);
        assert!(negotiated.rsv_bits().rsv1);
    }

    #[test]
    fn test_negotiate_falls_back_to_next_offer() {
        let mut registry = ExtensionRegistry::new();
        registry.add(marker("x-a")).unwrap();

        let offers = ExtensionOffer::parse_header("x-a; refuse, x-a").unwrap();
        assert_eq!(registry.negotiate(&offers).len(), 1);

        let offers = ExtensionOffer::parse_header("x-a; refuse").unwrap();
        assert!(registry.negotiate(&offers).is_empty());
    }

    #[test]
    fn test_find_by_capability_and_clear() {
        let registry = ExtensionRegistry::with_defaults();
        let offers = ExtensionOffer::parse_header("permessage-deflate").unwrap();
        let mut negotiated = registry.negotiate(&offers);
        negotiated.push(Box::new(Marker("x-b")));

        let found = negotiated
            .find_by_capability(Capability::PerMessageCompression)
            .unwrap();
        assert_eq!(found.name(), "permessage-deflate");
        assert!(negotiated.find_by_capability(Capability::Other("x-c")).is_none());
        assert_eq!(
            negotiated.response_entries(),
            vec!["permessage-deflate".to_string(), "x-b".to_string()]
        );

        negotiated.clear();
        assert!(negotiated.is_empty());
        assert!(negotiated.response_entries().is_empty());
    }
}
