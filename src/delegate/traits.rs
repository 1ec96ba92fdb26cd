//! The delegate capability contract.
//!
//! A delegate is anything that can take an invocation payload and hand back
//! a structured response: a team, a single worker, an external process. What
//! happens inside is opaque to the engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::invocation::InvocationPayload;
use crate::error::Result;

/// Delegate class, which selects the invocation timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DelegateClass {
    #[default]
    Team,
    Worker,
}

impl std::fmt::Display for DelegateClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DelegateClass::Team => write!(f, "team"),
            DelegateClass::Worker => write!(f, "worker"),
        }
    }
}

/// What a delegate returns from `execute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateResponse {
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub sub_score: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl DelegateResponse {
    pub fn success(result: Value, sub_score: Option<f64>) -> Self {
        Self {
            success: true,
            result,
            sub_score,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: Value::Null,
            sub_score: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait Delegate: Send + Sync {
    fn name(&self) -> &str;

    fn class(&self) -> DelegateClass {
        DelegateClass::Team
    }

    /// Run one unit of work. An `Err` is treated the same as an
    /// unsuccessful response.
    async fn execute(&self, payload: &InvocationPayload) -> Result<DelegateResponse>;
}
