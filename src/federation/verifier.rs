//! Inbound signature verification
//!
//! Resolves the signing actor for an HTTP-signed request or a linked-data
//! signed document. Failures never mutate state beyond caching the actor.

use serde_json::Value;
use std::sync::Arc;

use super::key_resolver::KeyResolver;
use super::ld_signature::{self, SignatureBlock};
use super::signature::{parse_signature_header, verify_signature};
use crate::data::Actor;
use crate::error::{AppError, VerificationError};
use crate::metrics::SIGNATURE_VERIFICATIONS;

pub struct SignatureVerifier {
    resolver: Arc<KeyResolver>,
    max_skew_secs: i64,
}

fn record(scheme: &str, result: &Result<Actor, VerificationError>) {
    let label = match result {
        Ok(_) => "valid",
        Err(VerificationError::NoSignature) => "unsigned",
        Err(VerificationError::Tampered) => "tampered",
        Err(VerificationError::KeyUnresolvable(_)) => "unresolvable",
    };
    SIGNATURE_VERIFICATIONS
        .with_label_values(&[scheme, label])
        .inc();
}

impl SignatureVerifier {
    pub fn new(resolver: Arc<KeyResolver>, max_skew_secs: i64) -> Self {
        Self {
            resolver,
            max_skew_secs,
        }
    }

    pub fn resolver(&self) -> &Arc<KeyResolver> {
        &self.resolver
    }

    /// Resolve the signer and make sure a public key is known, fetching the
    /// actor once more when the stored row has none.
    async fn signer_with_key(&self, key_id: &str) -> Result<(Actor, String), VerificationError> {
        let actor = self
            .resolver
            .resolve(key_id)
            .await
            .map_err(|e| VerificationError::KeyUnresolvable(e.to_string()))?;

        if let Some(pem) = actor.public_key_pem.clone() {
            return Ok((actor, pem));
        }

        let refreshed = self
            .resolver
            .refresh(&actor)
            .await
            .map_err(|e| VerificationError::KeyUnresolvable(e.to_string()))?;
        let pem = refreshed.public_key_pem.clone().ok_or_else(|| {
            VerificationError::KeyUnresolvable(format!("{} has no public key", refreshed.uri))
        })?;
        Ok((refreshed, pem))
    }

    /// Verify the linked-data signature embedded in `document`.
    pub async fn verify_document(&self, document: &Value) -> Result<Actor, VerificationError> {
        let result = async {
            let block =
                SignatureBlock::from_document(document).ok_or(VerificationError::NoSignature)?;
            let (actor, pem) = self.signer_with_key(&block.creator).await?;
            ld_signature::verify_with_key(document, &pem)?;
            Ok(actor)
        }
        .await;

        record("ld", &result);
        result
    }

    /// Verify the HTTP signature of a request.
    ///
    /// A signature that fails against a stored key is retried once after
    /// re-fetching the actor, which picks up rotated keys.
    pub async fn verify_request(
        &self,
        method: &str,
        path: &str,
        headers: &http::HeaderMap,
        body: Option<&[u8]>,
    ) -> Result<Actor, VerificationError> {
        let result = async {
            let header = headers
                .get("signature")
                .and_then(|value| value.to_str().ok())
                .ok_or(VerificationError::NoSignature)?;
            let parsed = parse_signature_header(header).map_err(|_| VerificationError::Tampered)?;

            let (actor, pem) = self.signer_with_key(&parsed.key_id).await?;
            match verify_signature(method, path, headers, body, &pem, self.max_skew_secs) {
                Ok(()) => return Ok(actor),
                Err(AppError::InvalidSignature) if !actor.is_local() => {}
                Err(error) => {
                    tracing::debug!(key_id = %parsed.key_id, %error, "HTTP signature rejected");
                    return Err(VerificationError::Tampered);
                }
            }

            let refreshed = self
                .resolver
                .refresh(&actor)
                .await
                .map_err(|e| VerificationError::KeyUnresolvable(e.to_string()))?;
            let pem = refreshed.public_key_pem.as_deref().ok_or_else(|| {
                VerificationError::KeyUnresolvable(format!("{} has no public key", refreshed.uri))
            })?;
            verify_signature(method, path, headers, body, pem, self.max_skew_secs)
                .map_err(|_| VerificationError::Tampered)?;
            Ok(refreshed)
        }
        .await;

        record("http", &result);
        result
    }
}
