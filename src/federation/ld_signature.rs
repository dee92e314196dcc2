//! Linked-data signatures (`RsaSignature2017`)
//!
//! The signed digest is `hex(sha256(options)) ++ hex(sha256(document))`,
//! where `options` is the signature block without `type`, `id` and
//! `signatureValue` under the identity context, and `document` is the
//! payload without its `signature`. Both are hashed in a canonical JSON
//! form: object keys sorted, no insignificant whitespace.
//!
//! This is not URDNA2015 RDF canonicalization. Signatures made by servers
//! that canonicalize with URDNA2015 (Mastodon among them) do not verify
//! here, so activities they forward are dropped unless the forwarder is
//! also the actor. Signatures produced by [`sign`] verify on this side only.

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use super::signature::{sign_bytes, verify_bytes};
use crate::data::Actor;
use crate::error::{AppError, VerificationError};

pub const SIGNATURE_CONTEXT: &str = "https://w3id.org/identity/v1";
pub const SIGNATURE_TYPE: &str = "RsaSignature2017";

/// The signature block attached to a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureBlock {
    /// Key id of the signing actor
    pub creator: String,
    pub created: String,
    pub signature_value: String,
}

impl SignatureBlock {
    /// Extract the signature block, if the document carries a usable one.
    pub fn from_document(document: &Value) -> Option<Self> {
        let signature = document.get("signature")?.as_object()?;
        if signature.get("type").and_then(Value::as_str) != Some(SIGNATURE_TYPE) {
            return None;
        }

        Some(Self {
            creator: signature.get("creator")?.as_str()?.to_string(),
            created: signature.get("created")?.as_str()?.to_string(),
            signature_value: signature.get("signatureValue")?.as_str()?.to_string(),
        })
    }
}

/// Serialize `value` with object keys sorted at every level.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn hash(value: &Value) -> String {
    hex::encode(Sha256::digest(canonicalize(value).as_bytes()))
}

fn options_hash(creator: &str, created: &str) -> String {
    hash(&json!({
        "@context": SIGNATURE_CONTEXT,
        "creator": creator,
        "created": created,
    }))
}

fn document_hash(document: &Value) -> String {
    let mut unsigned = document.clone();
    if let Some(map) = unsigned.as_object_mut() {
        map.remove("signature");
    }
    hash(&unsigned)
}

fn signed_string(document: &Value, creator: &str, created: &str) -> String {
    format!("{}{}", options_hash(creator, created), document_hash(document))
}

/// Attach a linked-data signature made with `signer`'s private key.
pub fn sign(document: &Value, signer: &Actor) -> Result<Value, AppError> {
    let private_key = signer
        .private_key_pem
        .as_deref()
        .filter(|_| signer.can_sign())
        .ok_or_else(|| AppError::Validation("Actor cannot sign".to_string()))?;

    let creator = signer.key_id();
    let created = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let signature_value = sign_bytes(
        private_key,
        signed_string(document, &creator, &created).as_bytes(),
    )?;

    let mut signature = Map::new();
    signature.insert("type".to_string(), Value::String(SIGNATURE_TYPE.to_string()));
    signature.insert("creator".to_string(), Value::String(creator));
    signature.insert("created".to_string(), Value::String(created));
    signature.insert("signatureValue".to_string(), Value::String(signature_value));

    let mut signed = document.clone();
    let map = signed
        .as_object_mut()
        .ok_or_else(|| AppError::Validation("Only objects can be signed".to_string()))?;
    map.insert("signature".to_string(), Value::Object(signature));
    Ok(signed)
}

/// Check the document's signature against a known public key.
pub fn verify_with_key(document: &Value, public_key_pem: &str) -> Result<(), VerificationError> {
    let block = SignatureBlock::from_document(document).ok_or(VerificationError::NoSignature)?;
    let data = signed_string(document, &block.creator, &block.created);

    match verify_bytes(public_key_pem, data.as_bytes(), &block.signature_value) {
        Ok(true) => Ok(()),
        Ok(false) => Err(VerificationError::Tampered),
        Err(error) => {
            tracing::debug!(%error, "Malformed linked-data signature");
            Err(VerificationError::Tampered)
        }
    }
}
