//! Token decoding and signature verification.

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use thiserror::Error;

use crate::{JwtClaims, TokenValidationError, validate_claims};

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token could not be decoded: {0}")]
    Decode(String),

    #[error(transparent)]
    Claims(#[from] TokenValidationError),
}

/// Verifies a bearer token and yields its claims.
///
/// Behind a trait so the HTTP layer can hold `Arc<dyn JwtValidator>` and
/// tests can substitute a fixed-claims fake.
pub trait JwtValidator: Send + Sync {
    fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<JwtClaims, TokenError>;
}

/// HS256 validator over a shared secret.
pub struct Hs256JwtValidator {
    decoding: DecodingKey,
    validation: Validation,
}

impl Hs256JwtValidator {
    pub fn new(secret: Vec<u8>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry lives in the claims as RFC3339 timestamps and is checked
        // deterministically by validate_claims, not by the decoder.
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        Self {
            decoding: DecodingKey::from_secret(&secret),
            validation,
        }
    }
}

impl JwtValidator for Hs256JwtValidator {
    fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<JwtClaims, TokenError> {
        let data = jsonwebtoken::decode::<JwtClaims>(token, &self.decoding, &self.validation)
            .map_err(|e| TokenError::Decode(e.to_string()))?;
        validate_claims(&data.claims, now)?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActorId, Role};
    use chrono::Duration;
    use jsonwebtoken::{EncodingKey, Header};

    fn mint(secret: &str, claims: &JwtClaims) -> String {
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn fresh_claims() -> JwtClaims {
        let now = Utc::now();
        JwtClaims {
            sub: ActorId::new(),
            username: "carol".to_string(),
            role: Role::User,
            issued_at: now - Duration::minutes(1),
            expires_at: now + Duration::minutes(10),
        }
    }

    #[test]
    fn valid_token_round_trips() {
        let claims = fresh_claims();
        let token = mint("secret", &claims);
        let validator = Hs256JwtValidator::new(b"secret".to_vec());

        let decoded = validator.validate(&token, Utc::now()).unwrap();
        assert_eq!(decoded, claims);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = mint("secret", &fresh_claims());
        let validator = Hs256JwtValidator::new(b"other-secret".to_vec());

        assert!(matches!(
            validator.validate(&token, Utc::now()),
            Err(TokenError::Decode(_))
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let now = Utc::now();
        let mut claims = fresh_claims();
        claims.issued_at = now - Duration::hours(2);
        claims.expires_at = now - Duration::hours(1);
        let token = mint("secret", &claims);
        let validator = Hs256JwtValidator::new(b"secret".to_vec());

        assert!(matches!(
            validator.validate(&token, now),
            Err(TokenError::Claims(TokenValidationError::Expired))
        ));
    }

    #[test]
    fn garbage_token_is_rejected() {
        let validator = Hs256JwtValidator::new(b"secret".to_vec());
        assert!(validator.validate("not.a.jwt", Utc::now()).is_err());
    }
}
