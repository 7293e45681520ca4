//! Capability results and the metadata every successful invocation carries.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::Value;

/// Provenance attached to a capability result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ResultMetadata {
    /// Data source attribution (for example `pricing_pack:PP_2024-06-28`).
    pub source: String,
    /// Valuation date the data reflects.
    #[serde(default)]
    pub as_of: Option<NaiveDate>,
    /// Suggested cache lifetime for downstream consumers.
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    /// Confidence score in `0.0..=1.0`, when the handler reports one.
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Set when the handler served data it knows to be stale.
    #[serde(default)]
    pub stale: bool,
}

/// Payload plus provenance returned by a handler operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityResult {
    pub data: Value,
    pub metadata: ResultMetadata,
}

impl CapabilityResult {
    /// Creates a result attributed to `source`.
    pub fn new(data: impl Into<Value>, source: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            metadata: ResultMetadata {
                source: source.into(),
                ..ResultMetadata::default()
            },
        }
    }

    pub fn with_as_of(mut self, as_of: NaiveDate) -> Self {
        self.metadata.as_of = Some(as_of);
        self
    }

    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.metadata.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.metadata.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    pub fn stale(mut self) -> Self {
        self.metadata.stale = true;
        self
    }
}
