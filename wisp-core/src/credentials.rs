//! # Per-call Credentials
//!
//! The engine never mints credentials. It asks a [`CredentialProvider`] for a finished
//! header per call and attaches it to the request metadata.
use crate::config::AuthConfig;
use base64::{Engine as _, engine::general_purpose::STANDARD};

const AUTHORIZATION: &str = "authorization";

/// A header to attach to every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub key: String,
    pub value: String,
}

impl Credential {
    pub fn into_pair(self) -> (String, String) {
        (self.key, self.value)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("'{0}' credentials must be supplied by an external provider")]
    Unsupported(&'static str),
    #[error("Failed to obtain credentials: {0}")]
    Provider(String),
}

pub trait CredentialProvider: Send + Sync {
    /// The credential to send with calls authenticated as `auth`, `None` for no auth.
    fn credential(&self, auth: &AuthConfig) -> Result<Option<Credential>, CredentialError>;
}

/// Handles the schemes that need nothing but the configuration itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticCredentials;

impl CredentialProvider for StaticCredentials {
    fn credential(&self, auth: &AuthConfig) -> Result<Option<Credential>, CredentialError> {
        match auth {
            AuthConfig::None => Ok(None),
            AuthConfig::Basic { login, password } => Ok(Some(Credential {
                key: AUTHORIZATION.to_string(),
                value: format!("Basic {}", STANDARD.encode(format!("{login}:{password}"))),
            })),
            AuthConfig::Bearer {
                token,
                header_prefix,
            } => Ok(Some(Credential {
                key: AUTHORIZATION.to_string(),
                value: format!("{} {token}", header_prefix.as_deref().unwrap_or("Bearer")),
            })),
            other @ (AuthConfig::Jwt { .. } | AuthConfig::Gce { .. }) => {
                Err(CredentialError::Unsupported(other.kind()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_header() {
        let auth = AuthConfig::Basic {
            login: "aladdin".into(),
            password: "opensesame".into(),
        };
        let credential = StaticCredentials.credential(&auth).unwrap().unwrap();

        assert_eq!(credential.key, "authorization");
        assert_eq!(credential.value, "Basic YWxhZGRpbjpvcGVuc2VzYW1l");
    }

    #[test]
    fn bearer_with_custom_prefix() {
        let auth = AuthConfig::Bearer {
            token: "t0k".into(),
            header_prefix: Some("Token".into()),
        };
        let credential = StaticCredentials.credential(&auth).unwrap().unwrap();
        assert_eq!(credential.value, "Token t0k");
    }

    #[test]
    fn no_auth_means_no_header() {
        assert!(StaticCredentials.credential(&AuthConfig::None).unwrap().is_none());
    }

    #[test]
    fn gce_needs_an_external_provider() {
        let auth = AuthConfig::Gce { scopes: vec![] };
        assert!(matches!(
            StaticCredentials.credential(&auth),
            Err(CredentialError::Unsupported("gce"))
        ));
    }
}
