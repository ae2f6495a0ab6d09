use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;

use crate::config::GitHubConfig;
use crate::error::{AppError, Result};

#[derive(Debug, Serialize)]
struct JwtClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

/// Load the App's RSA signing key from the configured path or inline PEM.
///
/// Key material problems are configuration errors and fatal at startup.
pub fn load_encoding_key(config: &GitHubConfig) -> Result<EncodingKey> {
    let key_pem = if let Some(pem) = &config.private_key {
        pem.clone().into_bytes()
    } else if let Some(path) = &config.private_key_path {
        std::fs::read(path).map_err(|e| {
            AppError::Config(format!(
                "Failed to read private key at {}: {e}",
                path.display()
            ))
        })?
    } else {
        return Err(AppError::Config(
            "No GitHub App private key configured".to_string(),
        ));
    };

    EncodingKey::from_rsa_pem(&key_pem)
        .map_err(|e| AppError::Config(format!("Invalid RSA private key: {e}")))
}

/// Generate a JWT for GitHub App authentication.
///
/// Issued 60 seconds in the past to absorb clock drift, valid for the
/// platform's 10 minute maximum, issuer = app id. Regenerated per call.
pub fn generate_app_jwt(app_id: u64, encoding_key: &EncodingKey) -> Result<String> {
    let now = chrono::Utc::now().timestamp();
    let claims = JwtClaims {
        iat: now - 60,
        exp: now + 10 * 60,
        iss: app_id.to_string(),
    };

    let header = Header::new(Algorithm::RS256);
    encode(&header, &claims, encoding_key)
        .map_err(|e| AppError::Config(format!("Failed to generate JWT: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_material_is_a_config_error() {
        let config = GitHubConfig {
            app_id: 1,
            private_key_path: None,
            private_key: None,
            webhook_secret: String::new(),
            api_timeout_secs: 30,
        };
        assert!(matches!(
            load_encoding_key(&config),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn invalid_pem_is_a_config_error() {
        let config = GitHubConfig {
            app_id: 1,
            private_key_path: None,
            private_key: Some("not-a-key".to_string()),
            webhook_secret: String::new(),
            api_timeout_secs: 30,
        };
        assert!(matches!(
            load_encoding_key(&config),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn missing_key_file_is_a_config_error() {
        let config = GitHubConfig {
            app_id: 1,
            private_key_path: Some("/nonexistent/key.pem".into()),
            private_key: None,
            webhook_secret: String::new(),
            api_timeout_secs: 30,
        };
        assert!(matches!(
            load_encoding_key(&config),
            Err(AppError::Config(_))
        ));
    }
}
