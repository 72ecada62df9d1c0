//! Short-lived access tokens (`PASETO` v4.local).
//!
//! Claims are encrypted and authenticated with a process-wide symmetric key. There is no
//! revocation list: a token stays valid until `exp`, so the lifetime is kept short.

use base64ct::{Base64, Base64UrlUnpadded, Encoding};
use pasetors::keys::{Generate, SymmetricKey};
use pasetors::token::UntrustedToken;
use pasetors::version4::{LocalToken, V4};
use pasetors::Local;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};
use utoipa::ToSchema;

pub const ACCESS_TOKEN_KEY_BYTES: usize = 32;

// Binds tokens to this purpose; a v4.local token minted elsewhere with the same key fails.
const IMPLICIT_ASSERTION: &[u8] = b"gardisto:access-token";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Student,
    Fa,
    Admin,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Student => "STUDENT",
            Self::Fa => "FA",
            Self::Admin => "ADMIN",
        }
    }

    /// Students and advisors carry their directory id in the token; admins do not.
    #[must_use]
    pub const fn has_scoped_id(self) -> bool {
        !matches!(self, Self::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = TokenError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "STUDENT" => Ok(Self::Student),
            "FA" => Ok(Self::Fa),
            "ADMIN" => Ok(Self::Admin),
            _ => Err(TokenError::UnknownRole(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub sub: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid token")]
    InvalidToken,
    #[error("invalid key")]
    InvalidKey,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("invalid issued-at")]
    InvalidIat,
    #[error("token expired")]
    Expired,
    #[error("invalid token ttl")]
    InvalidTtl,
    #[error("unknown role: {0}")]
    UnknownRole(String),
    #[error("role {0} requires a role-scoped id")]
    MissingScopedId(Role),
    #[error("role {0} does not take a role-scoped id")]
    UnexpectedScopedId(Role),
    #[error("failed to encrypt token")]
    Encrypt,
}

pub struct AccessTokenCodec {
    key: SymmetricKey<V4>,
    ttl_seconds: i64,
}

impl fmt::Debug for AccessTokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessTokenCodec")
            .field("key", &"[REDACTED]")
            .field("ttl_seconds", &self.ttl_seconds)
            .finish()
    }
}

impl AccessTokenCodec {
    /// # Errors
    /// Returns an error if the key is not 32 bytes or the TTL is zero.
    pub fn new(key: &[u8], ttl: Duration) -> Result<Self, TokenError> {
        if key.len() != ACCESS_TOKEN_KEY_BYTES {
            return Err(TokenError::InvalidKey);
        }
        let key = SymmetricKey::<V4>::from(key).map_err(|_| TokenError::InvalidKey)?;
        Self::with_key(key, ttl)
    }

    /// Build a codec from a base64 (url-safe or standard) encoded key.
    ///
    /// # Errors
    /// Returns an error if the key does not decode to 32 bytes or the TTL is zero.
    pub fn from_base64(encoded: &SecretString, ttl: Duration) -> Result<Self, TokenError> {
        let encoded = encoded.expose_secret().trim();
        let key = Base64UrlUnpadded::decode_vec(encoded)
            .or_else(|_| Base64::decode_vec(encoded))
            .map_err(|_| TokenError::InvalidKey)?;
        Self::new(&key, ttl)
    }

    /// Codec with a fresh random key; tokens do not survive a restart.
    ///
    /// # Errors
    /// Returns an error if key generation fails or the TTL is zero.
    pub fn random(ttl: Duration) -> Result<Self, TokenError> {
        let key = SymmetricKey::<V4>::generate().map_err(|_| TokenError::InvalidKey)?;
        Self::with_key(key, ttl)
    }

    fn with_key(key: SymmetricKey<V4>, ttl: Duration) -> Result<Self, TokenError> {
        let ttl_seconds = i64::try_from(ttl.as_secs()).map_err(|_| TokenError::InvalidTtl)?;
        if ttl_seconds <= 0 {
            return Err(TokenError::InvalidTtl);
        }
        Ok(Self { key, ttl_seconds })
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds.unsigned_abs())
    }

    /// # Errors
    /// Returns an error if the role and role-scoped id disagree or encryption fails.
    pub fn issue(
        &self,
        subject: &str,
        role: Role,
        role_scoped_id: Option<&str>,
    ) -> Result<String, TokenError> {
        self.issue_at(subject, role, role_scoped_id, now_unix_seconds())
    }

    /// # Errors
    /// Returns an error if the role and role-scoped id disagree or encryption fails.
    pub fn issue_at(
        &self,
        subject: &str,
        role: Role,
        role_scoped_id: Option<&str>,
        now_unix_seconds: i64,
    ) -> Result<String, TokenError> {
        let claims = AccessTokenClaims {
            sub: subject.to_string(),
            role,
            rid: role_scoped_id.map(ToString::to_string),
            iat: now_unix_seconds,
            exp: now_unix_seconds.saturating_add(self.ttl_seconds),
        };
        check_scoped_id(&claims)?;

        let payload = serde_json::to_vec(&claims)?;
        LocalToken::encrypt(&self.key, &payload, None, Some(IMPLICIT_ASSERTION))
            .map_err(|_| TokenError::Encrypt)
    }

    /// # Errors
    /// Returns an error if the token is malformed, tampered with, or expired.
    pub fn verify(&self, token: &str) -> Result<AccessTokenClaims, TokenError> {
        self.verify_at(token, now_unix_seconds())
    }

    /// # Errors
    /// Returns an error if the token is malformed, tampered with, or expired.
    pub fn verify_at(
        &self,
        token: &str,
        now_unix_seconds: i64,
    ) -> Result<AccessTokenClaims, TokenError> {
        let untrusted =
            UntrustedToken::<Local, V4>::try_from(token).map_err(|_| TokenError::TokenFormat)?;
        let trusted = LocalToken::decrypt(&self.key, &untrusted, None, Some(IMPLICIT_ASSERTION))
            .map_err(|_| TokenError::InvalidToken)?;
        let claims: AccessTokenClaims = serde_json::from_str(trusted.payload())?;
        validate_claims(&claims, now_unix_seconds)?;
        Ok(claims)
    }
}

fn check_scoped_id(claims: &AccessTokenClaims) -> Result<(), TokenError> {
    match (claims.role.has_scoped_id(), claims.rid.as_deref()) {
        (true, None | Some("")) => Err(TokenError::MissingScopedId(claims.role)),
        (false, Some(_)) => Err(TokenError::UnexpectedScopedId(claims.role)),
        _ => Ok(()),
    }
}

fn validate_claims(claims: &AccessTokenClaims, now_unix_seconds: i64) -> Result<(), TokenError> {
    check_scoped_id(claims)?;
    if claims.iat > now_unix_seconds {
        return Err(TokenError::InvalidIat);
    }
    if claims.exp <= now_unix_seconds {
        return Err(TokenError::Expired);
    }
    if claims.exp <= claims.iat {
        return Err(TokenError::InvalidTtl);
    }
    Ok(())
}

fn now_unix_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;
    const KEY: [u8; 32] = [7u8; 32];

    fn codec() -> Result<AccessTokenCodec, TokenError> {
        AccessTokenCodec::new(&KEY, Duration::from_secs(600))
    }

    #[test]
    fn issue_and_verify_student() -> Result<(), TokenError> {
        let codec = codec()?;
        let token = codec.issue_at("a@b.com", Role::Student, Some("B200001CS"), NOW)?;
        assert!(token.starts_with("v4.local."));

        let claims = codec.verify_at(&token, NOW + 1)?;
        assert_eq!(claims.sub, "a@b.com");
        assert_eq!(claims.role, Role::Student);
        assert_eq!(claims.rid.as_deref(), Some("B200001CS"));
        assert_eq!(claims.exp - claims.iat, 600);
        Ok(())
    }

    #[test]
    fn expired_tokens_are_rejected() -> Result<(), TokenError> {
        let codec = codec()?;
        let token = codec.issue_at("admin@b.com", Role::Admin, None, NOW)?;
        assert!(codec.verify_at(&token, NOW + 599).is_ok());
        assert!(matches!(
            codec.verify_at(&token, NOW + 600),
            Err(TokenError::Expired)
        ));
        Ok(())
    }

    #[test]
    fn future_issued_tokens_are_rejected() -> Result<(), TokenError> {
        let codec = codec()?;
        let token = codec.issue_at("admin@b.com", Role::Admin, None, NOW + 60)?;
        assert!(matches!(
            codec.verify_at(&token, NOW),
            Err(TokenError::InvalidIat)
        ));
        Ok(())
    }

    #[test]
    fn tampered_tokens_are_rejected() -> Result<(), TokenError> {
        let codec = codec()?;
        let token = codec.issue_at("a@b.com", Role::Fa, Some("12"), NOW)?;
        let middle = token.len() / 2;
        let flipped = if token.as_bytes()[middle] == b'A' { "B" } else { "A" };
        let tampered = format!("{}{flipped}{}", &token[..middle], &token[middle + 1..]);

        assert!(matches!(
            codec.verify_at(&tampered, NOW),
            Err(TokenError::InvalidToken | TokenError::TokenFormat)
        ));
        Ok(())
    }

    #[test]
    fn other_keys_cannot_verify() -> Result<(), TokenError> {
        let token = codec()?.issue_at("a@b.com", Role::Fa, Some("12"), NOW)?;
        let other = AccessTokenCodec::new(&[9u8; 32], Duration::from_secs(600))?;
        assert!(matches!(
            other.verify_at(&token, NOW),
            Err(TokenError::InvalidToken)
        ));
        Ok(())
    }

    #[test]
    fn garbage_is_a_format_error() -> Result<(), TokenError> {
        let codec = codec()?;
        assert!(matches!(
            codec.verify_at("not-a-token", NOW),
            Err(TokenError::TokenFormat)
        ));
        assert!(matches!(
            codec.verify_at("v4.public.AAAA", NOW),
            Err(TokenError::TokenFormat)
        ));
        Ok(())
    }

    #[test]
    fn scoped_id_must_match_role() -> Result<(), TokenError> {
        let codec = codec()?;
        assert!(matches!(
            codec.issue_at("a@b.com", Role::Student, None, NOW),
            Err(TokenError::MissingScopedId(Role::Student))
        ));
        assert!(matches!(
            codec.issue_at("a@b.com", Role::Admin, Some("1"), NOW),
            Err(TokenError::UnexpectedScopedId(Role::Admin))
        ));
        Ok(())
    }

    #[test]
    fn key_and_ttl_validation() {
        assert!(matches!(
            AccessTokenCodec::new(&[1u8; 16], Duration::from_secs(600)),
            Err(TokenError::InvalidKey)
        ));
        assert!(matches!(
            AccessTokenCodec::new(&KEY, Duration::ZERO),
            Err(TokenError::InvalidTtl)
        ));
    }

    #[test]
    fn from_base64_accepts_url_safe_and_standard() -> Result<(), TokenError> {
        let url_safe = SecretString::from(Base64UrlUnpadded::encode_string(&KEY));
        let standard = SecretString::from(Base64::encode_string(&KEY));
        let a = AccessTokenCodec::from_base64(&url_safe, Duration::from_secs(600))?;
        let b = AccessTokenCodec::from_base64(&standard, Duration::from_secs(600))?;

        let token = a.issue_at("admin@b.com", Role::Admin, None, NOW)?;
        assert_eq!(b.verify_at(&token, NOW)?.sub, "admin@b.com");
        Ok(())
    }

    #[test]
    fn roles_round_trip_through_text() {
        for role in [Role::Student, Role::Fa, Role::Admin] {
            assert_eq!(role.as_str().parse::<Role>().ok(), Some(role));
        }
        assert!("student".parse::<Role>().is_err());
    }

    #[test]
    fn debug_redacts_key() -> Result<(), TokenError> {
        let rendered = format!("{:?}", codec()?);
        assert!(rendered.contains("REDACTED"));
        Ok(())
    }
}
