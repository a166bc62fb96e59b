// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! apg-token
#![deny(unsafe_code)]
#![warn(missing_docs)]

use apg_keys::KeyManager;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default override token lifetime.
pub const DEFAULT_OVERRIDE_TTL: Duration = Duration::minutes(5);
/// Ceiling on capability token lifetime, whatever the issuer asked for.
pub const MAX_CAPABILITY_TTL: Duration = Duration::hours(1);

/// The two token flavours, as carried in the header `typ` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    /// Delegation token (`typ: "CAP"`, `token_type: "capability"`).
    Capability,
    /// Approval-bound token (`typ: "OVR"`, `token_type: "override"`).
    Override,
}

impl TokenType {
    fn header_typ(self) -> &'static str {
        match self {
            Self::Capability => "CAP",
            Self::Override => "OVR",
        }
    }

    fn payload_tag(self) -> &'static str {
        match self {
            Self::Capability => "capability",
            Self::Override => "override",
        }
    }
}

/// Verification failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// Not three base64url segments of valid JSON.
    #[error("malformed token")]
    Malformed,
    /// The signature does not verify under the gateway key.
    #[error("invalid token signature")]
    InvalidSignature,
    /// `exp` is in the past (zero skew).
    #[error("token expired")]
    Expired,
    /// `nbf` is in the future (zero skew).
    #[error("token not yet valid")]
    NotYetValid,
    /// Header `typ` or payload `token_type` does not match what the caller
    /// expected. Capability and override tokens are never interchangeable.
    #[error("wrong token type")]
    WrongType,
    /// An override payload without `action_hash` and `approval_id`.
    #[error("override token missing action binding")]
    MissingBinding,
    /// A capability payload carrying approval-binding fields.
    #[error("capability token carries approval binding")]
    UnexpectedBinding,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

/// Claims of a delegation token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityClaims {
    /// Always `"capability"`.
    pub token_type: String,
    /// Issuer principal.
    pub iss: String,
    /// Subject: the agent this delegation empowers.
    pub sub: String,
    /// Organisation the delegation is scoped to.
    pub org_id: String,
    /// Manifest family the delegation is scoped to.
    pub uapk_id: String,
    /// Action types the token admits. Empty means no further restriction.
    #[serde(default)]
    pub allowed_action_types: Vec<String>,
    /// Tools the token admits. Empty means no further restriction.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Free-form constraints for downstream interpretation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<serde_json::Value>,
    /// Not valid before (unix seconds).
    pub nbf: i64,
    /// Expiry (unix seconds).
    pub exp: i64,
    /// Token identifier.
    pub jti: Uuid,
}

/// Claims of an approval-bound override token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideClaims {
    /// Always `"override"`.
    pub token_type: String,
    /// The approval this token redeems.
    pub approval_id: Uuid,
    /// Hash of the exact action the approval covers.
    pub action_hash: String,
    /// Issued at (unix seconds).
    pub iat: i64,
    /// Expiry (unix seconds).
    pub exp: i64,
    /// Token identifier.
    pub jti: Uuid,
}

/// A successfully verified token.
#[derive(Debug, Clone, PartialEq)]
pub enum VerifiedToken {
    /// A delegation token.
    Capability(CapabilityClaims),
    /// An approval-bound token.
    Override(OverrideClaims),
}

/// Parameters for issuing a capability token.
#[derive(Debug, Clone)]
pub struct CapabilitySpec {
    /// Issuer principal.
    pub iss: String,
    /// Agent the delegation empowers.
    pub sub: String,
    /// Organisation scope.
    pub org_id: String,
    /// Manifest family scope.
    pub uapk_id: String,
    /// Admitted action types.
    pub allowed_action_types: Vec<String>,
    /// Admitted tools.
    pub allowed_tools: Vec<String>,
    /// Free-form constraints.
    pub constraints: Option<serde_json::Value>,
    /// Requested lifetime; clamped to [`MAX_CAPABILITY_TTL`].
    pub ttl: Duration,
}

fn encode_segment<T: Serialize>(value: &T) -> String {
    // Serialization of these fixed shapes cannot fail.
    let json = serde_json::to_vec(value).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

fn sign_token(keys: &KeyManager, header: &Header, payload_b64: &str) -> String {
    let header_b64 = encode_segment(header);
    let signing_input = format!("{header_b64}.{payload_b64}");
    let sig = URL_SAFE_NO_PAD.encode(keys.sign(signing_input.as_bytes()).to_bytes());
    format!("{signing_input}.{sig}")
}

/// Issue a capability token at `now`.
#[must_use]
pub fn issue_capability(keys: &KeyManager, spec: &CapabilitySpec, now: DateTime<Utc>) -> String {
    let ttl = if spec.ttl > MAX_CAPABILITY_TTL {
        MAX_CAPABILITY_TTL
    } else {
        spec.ttl
    };
    let claims = CapabilityClaims {
        token_type: TokenType::Capability.payload_tag().to_string(),
        iss: spec.iss.clone(),
        sub: spec.sub.clone(),
        org_id: spec.org_id.clone(),
        uapk_id: spec.uapk_id.clone(),
        allowed_action_types: spec.allowed_action_types.clone(),
        allowed_tools: spec.allowed_tools.clone(),
        constraints: spec.constraints.clone(),
        nbf: now.timestamp(),
        exp: (now + ttl).timestamp(),
        jti: Uuid::new_v4(),
    };
    let header = Header {
        alg: "EdDSA".into(),
        typ: TokenType::Capability.header_typ().into(),
    };
    sign_token(keys, &header, &encode_segment(&claims))
}

/// Issue an override token bound to `(approval_id, action_hash)` at `now`.
#[must_use]
pub fn issue_override(
    keys: &KeyManager,
    approval_id: Uuid,
    action_hash: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> String {
    let claims = OverrideClaims {
        token_type: TokenType::Override.payload_tag().to_string(),
        approval_id,
        action_hash: action_hash.to_string(),
        iat: now.timestamp(),
        exp: (now + ttl).timestamp(),
        jti: Uuid::new_v4(),
    };
    let header = Header {
        alg: "EdDSA".into(),
        typ: TokenType::Override.header_typ().into(),
    };
    sign_token(keys, &header, &encode_segment(&claims))
}

/// Verify `token` as `expected` under the gateway key, with a zero-skew
/// clock at `now`.
///
/// Both the header `typ` and the payload `token_type` must match the
/// expected flavour; a mismatch in either is [`TokenError::WrongType`],
/// which is what stops a capability token being redeemed as an override and
/// vice versa.
///
/// # Errors
///
/// See [`TokenError`] for the full taxonomy.
pub fn verify(
    keys: &KeyManager,
    token: &str,
    expected: TokenType,
    now: DateTime<Utc>,
) -> Result<VerifiedToken, TokenError> {
    let mut segments = token.split('.');
    let (Some(header_b64), Some(payload_b64), Some(sig_b64), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(TokenError::Malformed);
    };

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|_| TokenError::Malformed)?;
    let header: Header = serde_json::from_slice(&header_bytes).map_err(|_| TokenError::Malformed)?;
    if header.alg != "EdDSA" {
        return Err(TokenError::Malformed);
    }
    if header.typ != expected.header_typ() {
        return Err(TokenError::WrongType);
    }

    // Signature covers the raw header.payload bytes.
    let signing_input = format!("{header_b64}.{payload_b64}");
    let sig_bytes = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| TokenError::Malformed)?;
    let sig: [u8; 64] = sig_bytes
        .as_slice()
        .try_into()
        .map_err(|_| TokenError::Malformed)?;
    if !keys.verify_bytes(signing_input.as_bytes(), &sig) {
        return Err(TokenError::InvalidSignature);
    }

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| TokenError::Malformed)?;
    let raw: serde_json::Value =
        serde_json::from_slice(&payload_bytes).map_err(|_| TokenError::Malformed)?;

    let tag = raw
        .get("token_type")
        .and_then(|v| v.as_str())
        .ok_or(TokenError::Malformed)?;
    if tag != expected.payload_tag() {
        return Err(TokenError::WrongType);
    }

    let has_binding = raw.get("action_hash").is_some() || raw.get("approval_id").is_some();
    match expected {
        TokenType::Capability => {
            if has_binding {
                return Err(TokenError::UnexpectedBinding);
            }
            let claims: CapabilityClaims =
                serde_json::from_value(raw).map_err(|_| TokenError::Malformed)?;
            if now.timestamp() >= claims.exp {
                return Err(TokenError::Expired);
            }
            if now.timestamp() < claims.nbf {
                return Err(TokenError::NotYetValid);
            }
            Ok(VerifiedToken::Capability(claims))
        }
        TokenType::Override => {
            if raw.get("action_hash").is_none() || raw.get("approval_id").is_none() {
                return Err(TokenError::MissingBinding);
            }
            let claims: OverrideClaims =
                serde_json::from_value(raw).map_err(|_| TokenError::Malformed)?;
            if now.timestamp() >= claims.exp {
                return Err(TokenError::Expired);
            }
            Ok(VerifiedToken::Override(claims))
        }
    }
}

/// Verify and unwrap a capability token.
///
/// # Errors
///
/// Propagates [`verify`] failures.
pub fn verify_capability(
    keys: &KeyManager,
    token: &str,
    now: DateTime<Utc>,
) -> Result<CapabilityClaims, TokenError> {
    match verify(keys, token, TokenType::Capability, now)? {
        VerifiedToken::Capability(claims) => Ok(claims),
        VerifiedToken::Override(_) => Err(TokenError::WrongType),
    }
}

/// Verify and unwrap an override token.
///
/// # Errors
///
/// Propagates [`verify`] failures.
pub fn verify_override(
    keys: &KeyManager,
    token: &str,
    now: DateTime<Utc>,
) -> Result<OverrideClaims, TokenError> {
    match verify(keys, token, TokenType::Override, now)? {
        VerifiedToken::Override(claims) => Ok(claims),
        VerifiedToken::Capability(_) => Err(TokenError::WrongType),
    }
}
