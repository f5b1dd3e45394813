use manilink_core::{Configuration, EncodedSegment, canonical_form, encode_local, fingerprint};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::request::BoundedRequest;

pub const ENCODE_FAILED_MESSAGE: &str = "Failed to encode config";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EncodeError {
    /// The encryption service refused the request and said why.
    #[error("{0}")]
    Rejected(String),
    #[error("Failed to encode config")]
    Impossible,
}

#[derive(Debug, Deserialize)]
struct EncryptResponse {
    success: bool,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug)]
enum RemoteVerdict {
    Encrypted(String),
    Rejected(String),
    Unavailable(String),
}

/// Turns a configuration into a path segment: server-encrypted when the
/// service answers, locally encoded otherwise.
#[derive(Debug, Clone)]
pub struct LinkEncoder {
    request: BoundedRequest,
    endpoint: String,
}

impl LinkEncoder {
    pub fn new(request: BoundedRequest, endpoint: impl Into<String>) -> Self {
        Self {
            request,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn encode(&self, config: &Configuration) -> Result<EncodedSegment, EncodeError> {
        self.encode_value(config).await
    }

    pub async fn encode_value<T: Serialize + ?Sized>(
        &self,
        value: &T,
    ) -> Result<EncodedSegment, EncodeError> {
        let canonical = match canonical_form(value) {
            Ok(canonical) => canonical,
            Err(err) => {
                error!("cannot serialize config: {}", err);
                return Err(EncodeError::Impossible);
            }
        };
        let config_id = fingerprint(&canonical);

        match self.encrypt_remote(&canonical).await {
            RemoteVerdict::Encrypted(token) => {
                debug!(config = %config_id, "config encrypted by service");
                return Ok(EncodedSegment::new(token));
            }
            RemoteVerdict::Rejected(message) => {
                warn!(config = %config_id, "encryption service rejected config: {}", message);
                return Err(EncodeError::Rejected(message));
            }
            RemoteVerdict::Unavailable(reason) => {
                warn!(
                    config = %config_id,
                    "encryption unavailable ({}), falling back to local encoding",
                    reason
                );
            }
        }

        Ok(encode_local(&canonical))
    }

    async fn encrypt_remote(&self, canonical: &str) -> RemoteVerdict {
        let body = serde_json::json!({ "data": canonical }).to_string();
        let reply = match self.request.post_json(&self.endpoint, body).await {
            Ok(reply) => reply,
            Err(failure) => return RemoteVerdict::Unavailable(failure.to_string()),
        };

        let response: EncryptResponse = match serde_json::from_slice(&reply.body) {
            Ok(response) => response,
            Err(err) => return RemoteVerdict::Unavailable(format!("malformed response: {err}")),
        };

        if !response.success {
            if let Some(error) = response.error.filter(|e| !e.is_empty()) {
                return RemoteVerdict::Rejected(error);
            }
            return RemoteVerdict::Unavailable(format!(
                "encryption service failed: {}",
                response.message.unwrap_or_default()
            ));
        }

        match response.data.filter(|d| !d.is_empty()) {
            Some(token) => RemoteVerdict::Encrypted(token),
            None => RemoteVerdict::Unavailable("success without a token".to_owned()),
        }
    }
}
