//! Configuration management for the relay.
//!
//! Configuration is set via environment variables:
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `8080`.
//! - `DEFAULT_PROVIDER` - Optional. Provider for unprefixed model names.
//!   Defaults to `anthropic`.
//! - `ANTHROPIC_API_KEYS` / `OPENAI_API_KEYS` / `GOOGLE_API_KEYS` -
//!   Optional. Comma-separated API key lists per provider.
//! - `ANTHROPIC_BASE_URL` / `OPENAI_BASE_URL` / `GOOGLE_BASE_URL` -
//!   Optional. Base URL overrides (self-hosted gateways, test servers).
//! - `OAUTH_CREDENTIALS_PATH` - Optional. JSON file mapping provider ids
//!   to OAuth credential sets.
//! - `CONNECTIVITY_TTL_SECS` - Optional. Reachability cache TTL. Defaults
//!   to `30`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::auth::OAuthCredentialSet;
use crate::providers::ProviderKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Failed to read credentials file {path}: {source}")]
    CredentialsFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse credentials file {path}: {source}")]
    CredentialsParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Provider used for model names without a `provider/` prefix
    pub default_provider: ProviderKind,

    /// API keys per provider
    pub api_keys: HashMap<ProviderKind, Vec<String>>,

    /// OAuth credential sets per provider
    pub oauth_credentials: HashMap<ProviderKind, Vec<OAuthCredentialSet>>,

    /// Base URL overrides per provider
    pub base_urls: HashMap<ProviderKind, String>,

    /// Reachability cache TTL
    pub connectivity_ttl: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{}", e)))?;

        let default_provider_id =
            std::env::var("DEFAULT_PROVIDER").unwrap_or_else(|_| "anthropic".to_string());
        let default_provider = ProviderKind::from_id(&default_provider_id).ok_or_else(|| {
            ConfigError::InvalidValue("DEFAULT_PROVIDER".to_string(), default_provider_id)
        })?;

        let mut api_keys = HashMap::new();
        let mut base_urls = HashMap::new();
        for kind in ProviderKind::ALL {
            if let Ok(raw) = std::env::var(kind.env_keys_var()) {
                let keys = parse_key_list(&raw);
                if !keys.is_empty() {
                    api_keys.insert(kind, keys);
                }
            }
            let var = format!("{}_BASE_URL", kind.id().to_uppercase());
            if let Ok(raw) = std::env::var(&var) {
                url::Url::parse(&raw).map_err(|e| {
                    ConfigError::InvalidValue(var.clone(), format!("{}: {}", raw, e))
                })?;
                base_urls.insert(kind, raw.trim_end_matches('/').to_string());
            }
        }

        let oauth_credentials = match std::env::var("OAUTH_CREDENTIALS_PATH") {
            Ok(path) => load_oauth_file(Path::new(&path))?,
            Err(_) => HashMap::new(),
        };

        let connectivity_ttl = std::env::var("CONNECTIVITY_TTL_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map(Duration::from_secs)
            .map_err(|e| {
                ConfigError::InvalidValue("CONNECTIVITY_TTL_SECS".to_string(), format!("{}", e))
            })?;

        Ok(Self {
            host,
            port,
            default_provider,
            api_keys,
            oauth_credentials,
            base_urls,
            connectivity_ttl,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(default_provider: ProviderKind) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            default_provider,
            api_keys: HashMap::new(),
            oauth_credentials: HashMap::new(),
            base_urls: HashMap::new(),
            connectivity_ttl: Duration::from_secs(30),
        }
    }
}

/// Split a comma-separated key list, dropping empty segments.
pub(crate) fn parse_key_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|key| key.trim())
        .filter(|key| !key.is_empty())
        .map(|key| key.to_string())
        .collect()
}

/// Load OAuth credential sets from a JSON file shaped as
/// `{"anthropic": [{...}], "google": [{...}]}`. Unknown provider ids are
/// rejected rather than silently dropped.
pub fn load_oauth_file(
    path: &Path,
) -> Result<HashMap<ProviderKind, Vec<OAuthCredentialSet>>, ConfigError> {
    let display_path = path.display().to_string();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::CredentialsFile {
        path: display_path.clone(),
        source,
    })?;
    let raw: HashMap<String, Vec<OAuthCredentialSet>> = serde_json::from_str(&contents)
        .map_err(|source| ConfigError::CredentialsParse {
            path: display_path.clone(),
            source,
        })?;

    let mut credentials = HashMap::new();
    for (id, sets) in raw {
        let kind = ProviderKind::from_id(&id).ok_or_else(|| {
            ConfigError::InvalidValue("OAUTH_CREDENTIALS_PATH".to_string(), id.clone())
        })?;
        if !sets.is_empty() {
            credentials.insert(kind, sets);
        }
    }
    Ok(credentials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_key_list() {
        assert_eq!(
            parse_key_list("sk-1, sk-2 ,sk-3"),
            vec!["sk-1", "sk-2", "sk-3"]
        );
        assert_eq!(parse_key_list(""), Vec::<String>::new());
        assert_eq!(parse_key_list("sk-1,,"), vec!["sk-1"]);
    }

    #[test]
    fn test_load_oauth_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "anthropic": [{{
                    "id": "acct-1",
                    "client_id": "client",
                    "client_secret": "secret",
                    "access_token": "at",
                    "refresh_token": "rt",
                    "expires_at": "2026-01-01T00:00:00Z"
                }}]
            }}"#
        )
        .unwrap();

        let credentials = load_oauth_file(file.path()).unwrap();
        let sets = &credentials[&ProviderKind::Anthropic];
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].id, "acct-1");
        assert_eq!(sets[0].refresh_count, 0);
    }

    #[test]
    fn test_load_oauth_file_rejects_unknown_provider() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"mystery": []}}"#).unwrap();
        let err = load_oauth_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_, _)));
    }

    #[test]
    fn test_load_oauth_file_missing() {
        let err = load_oauth_file(Path::new("/nonexistent/creds.json")).unwrap_err();
        assert!(matches!(err, ConfigError::CredentialsFile { .. }));
    }
}
