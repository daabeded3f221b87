//! Gateway authentication: client `session_init` tokens and admin bearer tokens

use switchboard_core::{AuthConfig, AuthMode, Error, Result};

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}

#[derive(Clone, Debug)]
pub struct ResolvedAuth {
    pub mode: AuthMode,
    pub token: Option<String>,
}

impl ResolvedAuth {
    /// The configured token wins over the environment.
    pub fn from_config(config: &AuthConfig, env_token: Option<String>) -> Self {
        let token = config.token.clone().or(env_token).filter(|t| !t.is_empty());
        Self {
            mode: config.mode.clone(),
            token,
        }
    }

    pub fn open() -> Self {
        Self {
            mode: AuthMode::None,
            token: None,
        }
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            mode: AuthMode::Token,
            token: Some(token.into()),
        }
    }

    pub fn verify_token(&self, provided: Option<&str>) -> Result<()> {
        match self.mode {
            AuthMode::None => Ok(()),
            AuthMode::Token => {
                let expected = self
                    .token
                    .as_deref()
                    .ok_or_else(|| Error::auth_failed("no token configured"))?;
                let provided = provided.ok_or_else(|| Error::auth_failed("token required"))?;
                if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
                    return Err(Error::auth_failed("invalid token"));
                }
                Ok(())
            }
        }
    }

    /// Check an `Authorization` header value of the form `Bearer <token>`.
    pub fn verify_bearer(&self, header: Option<&str>) -> Result<()> {
        let token = header.and_then(|h| {
            let (scheme, token) = h.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        });
        self.verify_token(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_auth() {
        let auth = ResolvedAuth::with_token("test-token-123");
        assert!(auth.verify_token(Some("test-token-123")).is_ok());
        assert!(auth.verify_token(Some("wrong-token")).is_err());
        assert!(auth.verify_token(None).is_err());
    }

    #[test]
    fn no_auth() {
        let auth = ResolvedAuth::open();
        assert!(auth.verify_token(None).is_ok());
        assert!(auth.verify_bearer(Some("anything")).is_ok());
    }

    #[test]
    fn token_mode_without_token_rejects_everything() {
        let auth = ResolvedAuth::from_config(&AuthConfig::default(), Some(String::new()));
        let err = auth.verify_token(Some("")).unwrap_err();
        assert!(err.to_string().contains("no token configured"));
    }

    #[test]
    fn config_token_beats_env() {
        let config = AuthConfig {
            mode: AuthMode::Token,
            token: Some("from-file".into()),
        };
        let auth = ResolvedAuth::from_config(&config, Some("from-env".into()));
        assert!(auth.verify_token(Some("from-file")).is_ok());
        assert!(auth.verify_token(Some("from-env")).is_err());
    }

    #[test]
    fn bearer_header() {
        let auth = ResolvedAuth::with_token("s3cret");
        assert!(auth.verify_bearer(Some("Bearer s3cret")).is_ok());
        assert!(auth.verify_bearer(Some("bearer  s3cret ")).is_ok());
        assert!(auth.verify_bearer(Some("Basic s3cret")).is_err());
        assert!(auth.verify_bearer(Some("s3cret")).is_err());
        assert!(auth.verify_bearer(None).is_err());
    }
}
