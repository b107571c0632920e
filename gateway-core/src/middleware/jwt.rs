//! Legacy bearer-token verification — the second leg of the auth waterfall
//! (spec.md §4.3: session cookie overrides this; when disabled the waterfall
//! is sessions-only; when enabled, legacy tokens are read-only, no refresh).

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use std::{fs, sync::Arc};

use crate::{config::JwtConfig, error::Error, middleware::token::Claims};

/// Validates legacy bearer tokens against a fixed public key.
#[derive(Clone)]
pub struct JwtAuth {
    decoding_key: Arc<DecodingKey>,
    validation: Validation,
}

impl JwtAuth {
    pub fn new(config: &JwtConfig) -> Result<Self, Error> {
        let public_key = fs::read(&config.public_key_path).map_err(|e| {
            Error::Config(Box::new(figment::Error::from(format!(
                "failed to read JWT public key from '{}': {e}",
                config.public_key_path.display()
            ))))
        })?;

        let algorithm = match config.algorithm.to_uppercase().as_str() {
            "RS256" => Algorithm::RS256,
            "RS384" => Algorithm::RS384,
            "RS512" => Algorithm::RS512,
            "ES256" => Algorithm::ES256,
            "ES384" => Algorithm::ES384,
            "HS256" => Algorithm::HS256,
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            alg => {
                return Err(Error::Config(Box::new(figment::Error::from(format!(
                    "unsupported JWT algorithm: {alg}"
                )))))
            }
        };

        let decoding_key = match algorithm {
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => {
                DecodingKey::from_rsa_pem(&public_key)?
            }
            Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(&public_key)?,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                DecodingKey::from_secret(&public_key)
            }
            _ => unreachable!(),
        };

        let mut validation = Validation::new(algorithm);
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = &config.audience {
            validation.set_audience(&[audience]);
        }

        Ok(Self { decoding_key: Arc::new(decoding_key), validation })
    }

    /// Validate a bearer token and return its claims. Read-only: legacy
    /// tokens never refresh expiry or grant a sliding window.
    pub fn validate(&self, token: &str) -> Result<Claims, Error> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_algorithm_is_rejected() {
        let mut config = JwtConfig {
            enabled: true,
            public_key_path: "/dev/null".into(),
            algorithm: "NOPE".into(),
            issuer: None,
            audience: None,
        };
        config.algorithm = "NOPE".into();
        let result = JwtAuth::new(&config);
        assert!(result.is_err());
    }
}
