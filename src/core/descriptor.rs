// src/core/descriptor.rs

//! Declarative metadata every scan module ships with.
//!
//! A [`ModuleDescriptor`] is immutable once registered. Hot-reload replaces it
//! wholesale, never field by field.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::core::error::{RegistrationError, ResolutionError};
use crate::core::models::EventType;

static MODULE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("module id pattern compiles"));

// --- Versions ---

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{input}' is not a major.minor.patch version")]
pub struct VersionParseError {
    input: String,
}

/// A `major.minor.patch` version, ordered component by component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModuleVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ModuleVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl FromStr for ModuleVersion {
    type Err = VersionParseError;

    /// Missing trailing components default to zero, so `"2"` is `2.0.0`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || VersionParseError { input: s.to_string() };
        let mut parts = s.trim().split('.');
        let mut next = |required: bool| -> Result<u32, VersionParseError> {
            match parts.next() {
                Some(p) => p.parse().map_err(|_| err()),
                None if required => Err(err()),
                None => Ok(0),
            }
        };
        let version = Self::new(next(true)?, next(false)?, next(false)?);
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(version)
    }
}

impl TryFrom<String> for ModuleVersion {
    type Error = VersionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ModuleVersion> for String {
    fn from(version: ModuleVersion) -> Self {
        version.to_string()
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// --- Options ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    Bool,
    Int,
    Text,
    List,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Text(String),
    List(Vec<String>),
}

impl OptionValue {
    pub fn kind(&self) -> OptionKind {
        match self {
            OptionValue::Bool(_) => OptionKind::Bool,
            OptionValue::Int(_) => OptionKind::Int,
            OptionValue::Text(_) => OptionKind::Text,
            OptionValue::List(_) => OptionKind::List,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            OptionValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            OptionValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Text(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::Text(value)
    }
}

impl From<Vec<String>> for OptionValue {
    fn from(value: Vec<String>) -> Self {
        OptionValue::List(value)
    }
}

/// A configurable knob: its default (which also fixes its type) and what it does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionSpec {
    pub default: OptionValue,
    pub description: String,
}

impl OptionSpec {
    pub fn kind(&self) -> OptionKind {
        self.default.kind()
    }
}

// --- Capabilities ---

/// Admission metadata. Flags filter module listings and pick the timeout
/// class; they never affect dispatch order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityFlag {
    RequiresNetwork,
    RequiresApiKey,
    Slow,
    Invasive,
    ErrorProne,
    Tool,
}

// --- Descriptor ---

/// The contract part of a descriptor: what a running scan's activation graph
/// was computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleContract {
    pub watched: BTreeSet<EventType>,
    pub produced: BTreeSet<EventType>,
    pub dependencies: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub summary: String,
    pub version: ModuleVersion,
    #[serde(default)]
    pub watched: BTreeSet<EventType>,
    #[serde(default)]
    pub produced: BTreeSet<EventType>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub options: BTreeMap<String, OptionSpec>,
    #[serde(default)]
    pub flags: BTreeSet<CapabilityFlag>,
    /// Per-invocation timeout override in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ModuleDescriptor {
    pub fn new(id: impl Into<String>, version: ModuleVersion) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            summary: String::new(),
            version,
            watched: BTreeSet::new(),
            produced: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            options: BTreeMap::new(),
            flags: BTreeSet::new(),
            timeout_ms: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn watches(mut self, event_type: impl Into<EventType>) -> Self {
        self.watched.insert(event_type.into());
        self
    }

    pub fn produces(mut self, event_type: impl Into<EventType>) -> Self {
        self.produced.insert(event_type.into());
        self
    }

    pub fn depends_on(mut self, module_id: impl Into<String>) -> Self {
        self.dependencies.insert(module_id.into());
        self
    }

    pub fn option(
        mut self,
        name: impl Into<String>,
        default: impl Into<OptionValue>,
        description: impl Into<String>,
    ) -> Self {
        self.options.insert(
            name.into(),
            OptionSpec { default: default.into(), description: description.into() },
        );
        self
    }

    pub fn flag(mut self, flag: CapabilityFlag) -> Self {
        self.flags.insert(flag);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn has_flag(&self, flag: CapabilityFlag) -> bool {
        self.flags.contains(&flag)
    }

    /// Whether this module consumes events of `event_type`, directly or via `*`.
    pub fn watches_type(&self, event_type: &EventType) -> bool {
        self.watched.iter().any(|w| w.matches(event_type))
    }

    pub fn produces_type(&self, event_type: &EventType) -> bool {
        self.produced.contains(event_type)
    }

    pub fn contract(&self) -> ModuleContract {
        ModuleContract {
            watched: self.watched.clone(),
            produced: self.produced.clone(),
            dependencies: self.dependencies.clone(),
        }
    }

    /// Checks the structural invariants a descriptor must satisfy before it
    /// can enter the registry.
    ///
    /// # Errors
    /// Returns [`RegistrationError::InvalidDescriptor`] naming the first
    /// violated rule.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        let invalid = |reason: String| RegistrationError::InvalidDescriptor {
            id: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("module id must not be empty".to_string()));
        }
        if !MODULE_ID.is_match(&self.id) {
            return Err(invalid(format!(
                "module id '{}' contains characters outside [A-Za-z0-9_.-]",
                self.id
            )));
        }
        for (name, spec) in &self.options {
            if name.trim().is_empty() {
                return Err(invalid("option names must not be empty".to_string()));
            }
            if spec.description.trim().is_empty() {
                return Err(invalid(format!("option '{name}' has no description")));
            }
        }
        if let Some(tag) = self.watched.iter().chain(&self.produced).find(|t| t.as_str().trim().is_empty()) {
            return Err(invalid(format!("event type tag '{tag}' is blank")));
        }
        if self.produced.iter().any(EventType::is_wildcard) {
            return Err(invalid("produced event types cannot contain the '*' wildcard".to_string()));
        }
        if self.dependencies.iter().any(|d| d.trim().is_empty()) {
            return Err(invalid("dependency ids must not be empty".to_string()));
        }
        if self.timeout_ms == Some(0) {
            return Err(invalid("timeout must be greater than zero".to_string()));
        }
        Ok(())
    }

    /// Merges per-scan overrides over the declared defaults.
    ///
    /// # Errors
    /// Returns [`ResolutionError::InvalidOption`] for an override naming an
    /// undeclared option or carrying a value of the wrong type.
    pub fn resolve_options(
        &self,
        overrides: Option<&BTreeMap<String, OptionValue>>,
    ) -> Result<BTreeMap<String, OptionValue>, ResolutionError> {
        let mut resolved: BTreeMap<String, OptionValue> = self
            .options
            .iter()
            .map(|(name, spec)| (name.clone(), spec.default.clone()))
            .collect();

        for (name, value) in overrides.into_iter().flatten() {
            let Some(spec) = self.options.get(name) else {
                return Err(ResolutionError::InvalidOption {
                    module: self.id.clone(),
                    option: name.clone(),
                    reason: "no such option".to_string(),
                });
            };
            if spec.kind() != value.kind() {
                return Err(ResolutionError::InvalidOption {
                    module: self.id.clone(),
                    option: name.clone(),
                    reason: format!("expected {}, got {}", spec.kind(), value.kind()),
                });
            }
            resolved.insert(name.clone(), value.clone());
        }
        Ok(resolved)
    }
}
