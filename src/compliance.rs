use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComplianceDecision {
    Allow,
    Deny,
}

/// Remote AML screening of a funding transaction
#[async_trait]
pub trait ComplianceOracle: Send + Sync {
    async fn check_compliance(&self, rpc_endpoint: &str, tx_hash: &str) -> AppResult<ComplianceDecision>;
}

#[derive(Debug, Deserialize)]
struct ScreeningResponse {
    result: Option<ScreeningResult>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ScreeningResult {
    decision: String,
}

/// Screening oracle reached over a JSON-RPC backfill call
pub struct Shield3Oracle {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl Shield3Oracle {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ComplianceOracle for Shield3Oracle {
    async fn check_compliance(&self, rpc_endpoint: &str, tx_hash: &str) -> AppResult<ComplianceDecision> {
        let url = match &self.api_key {
            Some(key) => format!("{}/{}", self.base_url, key),
            None => self.base_url.clone(),
        };

        let response = self
            .http
            .post(&url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "eth_backfillTransaction",
                "params": [tx_hash, rpc_endpoint],
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::ExternalError(format!(
                "compliance oracle returned HTTP {}",
                response.status()
            )));
        }

        let body: ScreeningResponse = response.json().await?;
        if let Some(error) = body.error {
            return Err(AppError::ExternalError(format!("compliance oracle error: {}", error)));
        }
        let decision = body
            .result
            .map(|r| r.decision)
            .ok_or_else(|| AppError::ExternalError("compliance oracle returned no decision".into()))?;

        debug!("AML decision for {}: {}", tx_hash, decision);
        Ok(parse_decision(&decision))
    }
}

/// Only an explicit allow passes; anything else is treated as a deny
pub fn parse_decision(decision: &str) -> ComplianceDecision {
    if decision.eq_ignore_ascii_case("allow") {
        ComplianceDecision::Allow
    } else {
        if !decision.eq_ignore_ascii_case("deny") {
            warn!("⚠️  Unrecognized AML decision '{}', treating as deny", decision);
        }
        ComplianceDecision::Deny
    }
}
