//! Request and response bodies for executing a pattern.

use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{ExecutionTrace, Value};

/// Caller-supplied execute request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExecuteRequest {
    pub pattern_id: String,
    /// Input values keyed by declared input name.
    #[serde(default)]
    pub inputs: IndexMap<String, Value>,
    /// Freshness override; when true a warming snapshot is served instead of rejected.
    #[serde(default)]
    pub allow_stale: bool,
    /// Optional target snapshot instead of the current one.
    #[serde(default)]
    pub snapshot_id: Option<String>,
    /// Optional valuation date override carried into the context.
    #[serde(default)]
    pub as_of: Option<NaiveDate>,
    /// Originating user, when the caller is authenticated upstream.
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Successful execute response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecuteResponse {
    pub outputs: IndexMap<String, Value>,
    pub trace: ExecutionTrace,
}
