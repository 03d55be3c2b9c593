// src/core/models.rs

use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use url::Url;
use uuid::Uuid;

use crate::core::error::TargetError;

/// Source id stamped on the events the core seeds into a scan.
pub const CORE_SOURCE: &str = "vanguard";

static HOSTNAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)*[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?$")
        .expect("hostname pattern compiles")
});

// --- Event Types ---

/// A tag categorising a unit of discovered data, e.g. `INTERNET_NAME`.
///
/// The special tag `*` is only meaningful in a module's watch list, where it
/// means "every event type".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub const WILDCARD: &'static str = "*";
    pub const ROOT: &'static str = "ROOT";

    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn wildcard() -> Self {
        Self::new(Self::WILDCARD)
    }

    pub fn root() -> Self {
        Self::new(Self::ROOT)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.0 == Self::WILDCARD
    }

    /// Whether a watcher declaring `self` accepts an event of type `other`.
    pub fn matches(&self, other: &EventType) -> bool {
        self.is_wildcard() || self == other
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventType {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

impl From<String> for EventType {
    fn from(tag: String) -> Self {
        Self(tag)
    }
}

impl Borrow<str> for EventType {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// --- Events ---

/// What a module hands back from `handle`: a type tag and its payload.
///
/// The sandbox turns accepted emissions into full [`ScanEvent`]s, stamping the
/// producing module and the originating event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emission {
    pub event_type: EventType,
    pub data: String,
}

impl Emission {
    pub fn new(event_type: impl Into<EventType>, data: impl Into<String>) -> Self {
        Self { event_type: event_type.into(), data: data.into() }
    }
}

/// An immutable unit of discovered data flowing through a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanEvent {
    pub id: Uuid,
    pub event_type: EventType,
    pub data: String,
    pub source_module: String,
    /// Id of the event whose handling produced this one; `None` for seeds.
    pub origin: Option<Uuid>,
    pub generated: DateTime<Utc>,
}

impl ScanEvent {
    /// Builds an event seeded by the core itself.
    pub fn seed(event_type: impl Into<EventType>, data: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            data: data.into(),
            source_module: CORE_SOURCE.to_string(),
            origin: None,
            generated: Utc::now(),
        }
    }

    /// Builds an event emitted by `source_module` while handling `origin`.
    pub fn derived(emission: Emission, source_module: &str, origin: &ScanEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: emission.event_type,
            data: emission.data,
            source_module: source_module.to_string(),
            origin: Some(origin.id),
            generated: Utc::now(),
        }
    }

    pub fn key(&self) -> EventKey {
        EventKey {
            event_type: self.event_type.clone(),
            data: self.data.clone(),
            source_module: self.source_module.clone(),
        }
    }
}

/// Deduplication identity of an event: `(type, data, source module)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub event_type: EventType,
    pub data: String,
    pub source_module: String,
}

// --- Scan Lifecycle ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Created,
    Running,
    Aborting,
    Finished,
    Failed,
}

impl ScanState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanState::Finished | ScanState::Failed)
    }
}

// --- Scan Targets ---

/// The shape of a scan target, which decides the event type it is seeded as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetKind {
    InternetName,
    IpAddress,
    EmailAddress,
    Url,
}

impl TargetKind {
    pub fn seed_type(self) -> EventType {
        match self {
            TargetKind::InternetName => EventType::new("INTERNET_NAME"),
            TargetKind::IpAddress => EventType::new("IP_ADDRESS"),
            TargetKind::EmailAddress => EventType::new("EMAILADDR"),
            TargetKind::Url => EventType::new("URL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanTarget {
    pub value: String,
    pub kind: TargetKind,
}

impl ScanTarget {
    /// Parses raw user input into a normalised target.
    ///
    /// Detection order is IP address, URL (anything with a scheme), e-mail
    /// address, then hostname. Hostnames and e-mail addresses are lowercased
    /// and a trailing root dot is dropped.
    ///
    /// # Errors
    /// Returns [`TargetError`] when the input is empty or matches none of the
    /// supported shapes.
    pub fn parse(input: &str) -> Result<Self, TargetError> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(TargetError::Empty);
        }

        if let Ok(ip) = raw.parse::<IpAddr>() {
            return Ok(Self { value: ip.to_string(), kind: TargetKind::IpAddress });
        }

        if raw.contains("://") {
            let url = Url::parse(raw).map_err(|e| TargetError::Invalid {
                input: raw.to_string(),
                reason: e.to_string(),
            })?;
            if url.host_str().is_none() {
                return Err(TargetError::Invalid {
                    input: raw.to_string(),
                    reason: "URL has no host".to_string(),
                });
            }
            return Ok(Self { value: url.to_string(), kind: TargetKind::Url });
        }

        let lowered = raw.to_ascii_lowercase();
        let lowered = lowered.strip_suffix('.').unwrap_or(&lowered);

        if let Some((user, domain)) = lowered.split_once('@') {
            if user.is_empty() || domain.contains('@') || !HOSTNAME.is_match(domain) {
                return Err(TargetError::Invalid {
                    input: raw.to_string(),
                    reason: "malformed e-mail address".to_string(),
                });
            }
            return Ok(Self { value: lowered.to_string(), kind: TargetKind::EmailAddress });
        }

        if HOSTNAME.is_match(lowered) {
            return Ok(Self { value: lowered.to_string(), kind: TargetKind::InternetName });
        }

        Err(TargetError::Invalid {
            input: raw.to_string(),
            reason: "not an IP address, URL, e-mail address or hostname".to_string(),
        })
    }

    /// The event types a scan of this target starts from: `ROOT` plus the
    /// kind-specific type.
    pub fn seed_types(&self) -> BTreeSet<EventType> {
        BTreeSet::from([EventType::root(), self.kind.seed_type()])
    }
}

impl fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("example.com", TargetKind::InternetName, "example.com")]
    #[case("WWW.Example.COM.", TargetKind::InternetName, "www.example.com")]
    #[case("10.0.0.1", TargetKind::IpAddress, "10.0.0.1")]
    #[case("::1", TargetKind::IpAddress, "::1")]
    #[case("admin@Example.com", TargetKind::EmailAddress, "admin@example.com")]
    #[case("https://example.com/login", TargetKind::Url, "https://example.com/login")]
    fn parses_target_shapes(#[case] input: &str, #[case] kind: TargetKind, #[case] value: &str) {
        let target = ScanTarget::parse(input).expect("target parses");
        assert_eq!(target.kind, kind);
        assert_eq!(target.value, value);
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("not a host")]
    #[case("@example.com")]
    #[case("a@b@example.com")]
    fn rejects_malformed_targets(#[case] input: &str) {
        assert!(ScanTarget::parse(input).is_err());
    }

    #[test]
    fn seed_types_always_include_root() {
        let target = ScanTarget::parse("example.com").expect("target parses");
        let seeds = target.seed_types();
        assert!(seeds.contains("ROOT"));
        assert!(seeds.contains("INTERNET_NAME"));
    }

    #[test]
    fn wildcard_matches_everything() {
        let any = EventType::wildcard();
        assert!(any.matches(&EventType::new("IP_ADDRESS")));
        assert!(EventType::new("IP_ADDRESS").matches(&EventType::new("IP_ADDRESS")));
        assert!(!EventType::new("IP_ADDRESS").matches(&EventType::new("URL")));
    }

    #[test]
    fn derived_events_share_key_with_identical_emissions() {
        let seed = ScanEvent::seed("ROOT", "example.com");
        let a = ScanEvent::derived(Emission::new("INTERNET_NAME", "www.example.com"), "splitter", &seed);
        let b = ScanEvent::derived(Emission::new("INTERNET_NAME", "www.example.com"), "splitter", &seed);
        assert_ne!(a.id, b.id);
        assert_eq!(a.key(), b.key());
        assert_eq!(a.origin, Some(seed.id));
    }
}
