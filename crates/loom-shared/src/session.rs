//! Signed cafe session tokens.
//!
//! A token is `base64url(json claims) "." base64url(ed25519 signature)`,
//! signed by the cafe's peer key. Sessions pair an access token with a
//! refresh token whose id is the access id prefixed with `r`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TokenError;
use crate::identity::{verify_signature_bytes, Identity};
use crate::types::PeerId;

/// Prefix deriving a refresh token id from its access token id.
pub const REFRESH_ID_PREFIX: &str = "r";

pub const TOKEN_TYPE: &str = "ed25519";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionClaims {
    #[serde(rename = "jti")]
    pub id: String,
    #[serde(rename = "iss")]
    pub issuer: PeerId,
    #[serde(rename = "sub")]
    pub subject: PeerId,
    #[serde(rename = "aud")]
    pub audience: String,
    #[serde(rename = "scopes")]
    pub scope: Scope,
    #[serde(rename = "iat")]
    pub issued_at: i64,
    #[serde(rename = "exp")]
    pub expires_at: i64,
}

impl SessionClaims {
    pub fn expiry(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.expires_at, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    fn is_expired(&self) -> bool {
        Utc::now().timestamp() >= self.expires_at
    }
}

/// Freshly issued token pair.
#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub access: String,
    pub access_expiry: DateTime<Utc>,
    pub refresh: String,
    pub refresh_expiry: DateTime<Utc>,
}

/// Issue an access/refresh pair for `subject`, signed by `issuer`.
pub fn issue(
    issuer: &Identity,
    subject: &PeerId,
    audience: &str,
    access_ttl: Duration,
    refresh_ttl: Duration,
) -> IssuedTokens {
    let now = Utc::now();
    let id = uuid::Uuid::new_v4().simple().to_string();
    let access_expiry = now + access_ttl;
    let refresh_expiry = now + refresh_ttl;

    let access = SessionClaims {
        id: id.clone(),
        issuer: issuer.peer_id(),
        subject: *subject,
        audience: audience.to_string(),
        scope: Scope::Access,
        issued_at: now.timestamp(),
        expires_at: access_expiry.timestamp(),
    };
    let refresh = SessionClaims {
        id: format!("{REFRESH_ID_PREFIX}{id}"),
        scope: Scope::Refresh,
        expires_at: refresh_expiry.timestamp(),
        ..access.clone()
    };

    IssuedTokens {
        access: sign(issuer, &access),
        access_expiry,
        refresh: sign(issuer, &refresh),
        refresh_expiry,
    }
}

/// Serialize and sign a set of claims.
pub fn sign(issuer: &Identity, claims: &SessionClaims) -> String {
    // Serializing plain strings and integers cannot fail
    let json = serde_json::to_vec(claims).unwrap_or_default();
    let body = URL_SAFE_NO_PAD.encode(json);
    let sig = issuer.sign(body.as_bytes());
    format!("{}.{}", body, URL_SAFE_NO_PAD.encode(sig.to_bytes()))
}

/// Split a token and check its signature, without looking at the claims.
fn parse(token: &str, issuer_key: &[u8; 32]) -> Result<SessionClaims, TokenError> {
    if token.is_empty() {
        return Err(TokenError::NoToken);
    }
    let (body, sig) = token.split_once('.').ok_or(TokenError::NoToken)?;
    let sig = URL_SAFE_NO_PAD.decode(sig).map_err(|_| TokenError::NoToken)?;
    let json = URL_SAFE_NO_PAD.decode(body).map_err(|_| TokenError::NoToken)?;

    verify_signature_bytes(issuer_key, body.as_bytes(), &sig).map_err(|_| TokenError::Invalid)?;
    serde_json::from_slice(&json).map_err(|_| TokenError::Invalid)
}

/// Validate a token for use.
///
/// `refreshing` selects the expected scope. When `subject` is given the
/// token must have been issued to that peer.
pub fn validate(
    token: &str,
    issuer_key: &[u8; 32],
    refreshing: bool,
    audience: &str,
    subject: Option<&PeerId>,
) -> Result<SessionClaims, TokenError> {
    let claims = parse(token, issuer_key)?;

    if claims.is_expired() {
        return Err(TokenError::Expired);
    }

    let expected = if refreshing {
        Scope::Refresh
    } else {
        Scope::Access
    };
    if claims.scope != expected {
        return Err(TokenError::Invalid);
    }
    if claims.audience != audience {
        return Err(TokenError::Invalid);
    }
    if let Some(subject) = subject {
        if claims.subject != *subject {
            return Err(TokenError::Invalid);
        }
    }

    Ok(claims)
}

/// Validate a refresh request. The refresh token must be live and paired with
/// `access` (which may have expired) for the same subject.
pub fn validate_refresh(
    access: &str,
    refresh: &str,
    issuer_key: &[u8; 32],
    audience: &str,
    subject: &PeerId,
) -> Result<SessionClaims, TokenError> {
    let refresh_claims = validate(refresh, issuer_key, true, audience, Some(subject))?;

    let access_claims = parse(access, issuer_key).map_err(|_| TokenError::Invalid)?;
    if access_claims.scope != Scope::Access {
        return Err(TokenError::Invalid);
    }
    if format!("{REFRESH_ID_PREFIX}{}", access_claims.id) != refresh_claims.id {
        return Err(TokenError::Invalid);
    }
    if access_claims.subject != refresh_claims.subject {
        return Err(TokenError::Invalid);
    }

    Ok(refresh_claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUD: &str = "/loom/cafe/1.0.0";

    fn tokens(cafe: &Identity, subject: &PeerId, ttl: Duration) -> IssuedTokens {
        issue(cafe, subject, AUD, ttl, ttl * 4)
    }

    #[test]
    fn test_access_token_validates() {
        let cafe = Identity::generate();
        let client = Identity::generate().peer_id();
        let issued = tokens(&cafe, &client, Duration::days(7));

        let claims = validate(
            &issued.access,
            &cafe.public_key_bytes(),
            false,
            AUD,
            Some(&client),
        )
        .unwrap();
        assert_eq!(claims.subject, client);
        assert_eq!(claims.scope, Scope::Access);
    }

    #[test]
    fn test_scope_is_enforced() {
        let cafe = Identity::generate();
        let client = Identity::generate().peer_id();
        let issued = tokens(&cafe, &client, Duration::days(7));
        let key = cafe.public_key_bytes();

        assert_eq!(
            validate(&issued.refresh, &key, false, AUD, None),
            Err(TokenError::Invalid)
        );
        assert_eq!(
            validate(&issued.access, &key, true, AUD, None),
            Err(TokenError::Invalid)
        );
    }

    #[test]
    fn test_expired_and_missing() {
        let cafe = Identity::generate();
        let client = Identity::generate().peer_id();
        let issued = tokens(&cafe, &client, Duration::seconds(-10));
        let key = cafe.public_key_bytes();

        assert_eq!(
            validate(&issued.access, &key, false, AUD, None),
            Err(TokenError::Expired)
        );
        assert_eq!(validate("", &key, false, AUD, None), Err(TokenError::NoToken));
    }

    #[test]
    fn test_wrong_subject_audience_or_signer() {
        let cafe = Identity::generate();
        let client = Identity::generate().peer_id();
        let stranger = Identity::generate();
        let issued = tokens(&cafe, &client, Duration::days(7));
        let key = cafe.public_key_bytes();

        assert_eq!(
            validate(&issued.access, &key, false, AUD, Some(&stranger.peer_id())),
            Err(TokenError::Invalid)
        );
        assert_eq!(
            validate(&issued.access, &key, false, "/other/1.0.0", None),
            Err(TokenError::Invalid)
        );
        assert_eq!(
            validate(&issued.access, &stranger.public_key_bytes(), false, AUD, None),
            Err(TokenError::Invalid)
        );
    }

    #[test]
    fn test_refresh_requires_pairing() {
        let cafe = Identity::generate();
        let client = Identity::generate().peer_id();
        let key = cafe.public_key_bytes();

        let first = issue(&cafe, &client, AUD, Duration::seconds(-10), Duration::days(28));
        let second = tokens(&cafe, &client, Duration::days(7));

        // expired access + its own refresh token
        assert!(validate_refresh(&first.access, &first.refresh, &key, AUD, &client).is_ok());
        // tokens from different sessions
        assert_eq!(
            validate_refresh(&first.access, &second.refresh, &key, AUD, &client),
            Err(TokenError::Invalid)
        );
    }
}
