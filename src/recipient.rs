use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

use crate::error::{AppError, AppResult, OrderError};
use crate::ledger::models::Recipient;

/// Decrypts payloads sealed to the aggregator's public key
#[async_trait]
pub trait MessageDecryptor: Send + Sync {
    async fn decrypt(&self, ciphertext: &[u8]) -> AppResult<Vec<u8>>;
}

/// Key service holding the aggregator's private key
pub struct KeyServiceDecryptor {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct DecryptResponse {
    plaintext: String,
}

impl KeyServiceDecryptor {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl MessageDecryptor for KeyServiceDecryptor {
    async fn decrypt(&self, ciphertext: &[u8]) -> AppResult<Vec<u8>> {
        let response = self
            .http
            .post(format!("{}/v1/decrypt", self.base_url))
            .json(&json!({ "ciphertext": hex::encode(ciphertext) }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::ExternalError(format!(
                "key service returned HTTP {}",
                response.status()
            )));
        }

        let body: DecryptResponse = response.json().await?;
        hex::decode(body.plaintext.trim_start_matches("0x"))
            .map_err(|e| OrderError::InvalidRecipient(format!("plaintext is not hex: {}", e)).into())
    }
}

#[derive(Debug, Deserialize)]
struct RecipientPayload {
    #[serde(alias = "Institution")]
    institution: String,
    #[serde(alias = "AccountIdentifier")]
    account_identifier: String,
    #[serde(alias = "AccountName")]
    account_name: String,
    #[serde(default, alias = "ProviderID")]
    provider_id: Option<String>,
    #[serde(default, alias = "Memo")]
    memo: Option<String>,
}

/// base64 ciphertext -> decrypt -> JSON recipient details
#[derive(Clone)]
pub struct RecipientCodec {
    decryptor: Arc<dyn MessageDecryptor>,
}

impl RecipientCodec {
    pub fn new(decryptor: Arc<dyn MessageDecryptor>) -> Self {
        Self { decryptor }
    }

    pub async fn decode(&self, message_hash: &str) -> AppResult<Recipient> {
        let ciphertext = base64::engine::general_purpose::STANDARD.decode(message_hash.trim())?;
        let plaintext = self.decryptor.decrypt(&ciphertext).await?;
        let payload: RecipientPayload = serde_json::from_slice(&plaintext)
            .map_err(|e| OrderError::InvalidRecipient(e.to_string()))?;

        Ok(Recipient {
            institution: payload.institution,
            account_identifier: payload.account_identifier,
            account_name: payload.account_name,
            memo: payload.memo.filter(|m| !m.is_empty()),
            provider_id: payload.provider_id.filter(|p| !p.is_empty()),
        })
    }
}
