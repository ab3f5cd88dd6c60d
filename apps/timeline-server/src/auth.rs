//! Bearer credential verification.
//!
//! Credentials are HS256 JWTs. With `bypass` enabled the payload is decoded
//! without checking the signature so local tooling can mint throwaway tokens.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    pub secret: Option<String>,
    pub issuer: Option<String>,
    pub bypass: bool,
}

/// A verified caller. `subject` keys presence and membership; `display_name`
/// is what other collaborators see in the roster.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub subject: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(subject: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("no signing secret configured")]
    MissingSecret,
    #[error("token has an empty subject")]
    MissingSubject,
    #[error("jwt validation failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("payload decode error: {0}")]
    Payload(String),
}

impl AuthError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::MissingSecret => "missing_secret",
            AuthError::MissingSubject => "missing_subject",
            AuthError::Jwt(_) => "invalid_token",
            AuthError::Payload(_) => "invalid_payload",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl Claims {
    /// Claims for `subject` that expire an hour from now.
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            sub: subject.into(),
            username: None,
            name: None,
            iss: None,
            exp: Some(OffsetDateTime::now_utc().unix_timestamp() + 3600),
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.iss = Some(issuer.into());
        self
    }

    fn into_identity(self) -> Result<Identity, AuthError> {
        let subject = self.sub.trim().to_string();
        if subject.is_empty() {
            return Err(AuthError::MissingSubject);
        }
        let display_name = self
            .username
            .or(self.name)
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| subject.clone());
        Ok(Identity {
            subject,
            display_name,
        })
    }
}

#[derive(Clone)]
pub struct Authenticator {
    config: AuthConfig,
    key: Option<DecodingKey>,
}

impl Authenticator {
    pub fn new(config: AuthConfig) -> Self {
        let key = config
            .secret
            .as_deref()
            .map(|secret| DecodingKey::from_secret(secret.as_bytes()));
        Self { config, key }
    }

    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        if self.config.bypass {
            return Self::decode_without_verification(token)?.into_identity();
        }

        let key = self.key.as_ref().ok_or(AuthError::MissingSecret)?;
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = &self.config.issuer {
            validation.set_issuer(&[issuer]);
        }
        let data = decode::<Claims>(token, key, &validation)?;
        data.claims.into_identity()
    }

    fn decode_without_verification(token: &str) -> Result<Claims, AuthError> {
        let payload = token
            .split('.')
            .nth(1)
            .ok_or_else(|| AuthError::Payload("token missing payload".into()))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|err| AuthError::Payload(err.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|err| AuthError::Payload(err.to_string()))
    }
}

/// Mints an HS256 token for `claims`. Used by tooling and tests.
pub fn sign(secret: &str, claims: &Claims) -> Result<String, AuthError> {
    let token = encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "unit-test-secret";

    fn verifier(bypass: bool) -> Authenticator {
        Authenticator::new(AuthConfig {
            secret: Some(SECRET.into()),
            issuer: None,
            bypass,
        })
    }

    #[test_timeout::timeout]
    fn verifies_signed_token_and_prefers_username() {
        let token = sign(SECRET, &Claims::new("user-1").with_username("alice")).unwrap();
        let identity = verifier(false).verify(&token).unwrap();
        assert_eq!(identity, Identity::new("user-1", "alice"));
    }

    #[test_timeout::timeout]
    fn display_name_defaults_to_subject() {
        let token = sign(SECRET, &Claims::new("bob")).unwrap();
        assert_eq!(verifier(false).verify(&token).unwrap().display_name, "bob");
    }

    #[test_timeout::timeout]
    fn rejects_wrong_secret_and_expired_tokens() {
        let forged = sign("other-secret", &Claims::new("mallory")).unwrap();
        assert!(matches!(verifier(false).verify(&forged), Err(AuthError::Jwt(_))));

        let mut claims = Claims::new("alice");
        claims.exp = Some(OffsetDateTime::now_utc().unix_timestamp() - 3600);
        let expired = sign(SECRET, &claims).unwrap();
        assert!(matches!(verifier(false).verify(&expired), Err(AuthError::Jwt(_))));
    }

    #[test_timeout::timeout]
    fn enforces_configured_issuer() {
        let auth = Authenticator::new(AuthConfig {
            secret: Some(SECRET.into()),
            issuer: Some("projects".into()),
            bypass: false,
        });
        let good = sign(SECRET, &Claims::new("alice").with_issuer("projects")).unwrap();
        let bad = sign(SECRET, &Claims::new("alice").with_issuer("elsewhere")).unwrap();
        assert!(auth.verify(&good).is_ok());
        assert!(auth.verify(&bad).is_err());
    }

    #[test_timeout::timeout]
    fn empty_token_and_subject_are_rejected() {
        assert!(matches!(verifier(false).verify("  "), Err(AuthError::MissingToken)));
        let token = sign(SECRET, &Claims::new(" ")).unwrap();
        assert!(matches!(verifier(false).verify(&token), Err(AuthError::MissingSubject)));
    }

    #[test_timeout::timeout]
    fn bypass_skips_signature_but_not_payload() {
        let forged = sign("whatever", &Claims::new("dev").with_username("Dev")).unwrap();
        assert_eq!(
            verifier(true).verify(&forged).unwrap(),
            Identity::new("dev", "Dev")
        );
        assert!(matches!(
            verifier(true).verify("not-a-jwt"),
            Err(AuthError::Payload(_))
        ));
    }
}
