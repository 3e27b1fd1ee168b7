use std::env;
use std::path::PathBuf;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub parameters: ParameterConfig,
    pub entity: EntityConfig,
}

/// Query backend configuration
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    /// Sent as `Authorization: Key <api_key>` when present.
    pub api_key: Option<String>,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// HTTP request configuration
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// Parameter serialization settings
#[derive(Debug, Clone)]
pub struct ParameterConfig {
    /// Prefix prepended to parameter names in URL query keys.
    pub url_prefix: String,
}

/// Entity-keyed dashboard cascade settings.
///
/// Alias and hidden-name matching ignores whitespace and case; `query_name`
/// is compared case-insensitively; result fields match exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityConfig {
    /// Name of the query backing the entity widget.
    pub query_name: String,
    /// Declared role of the parameter receiving the external key.
    pub key_role: String,
    /// Fallback parameter names/titles for the external key.
    pub key_aliases: Vec<String>,
    /// Result fields holding the derived identifier, highest priority first.
    pub id_fields: Vec<String>,
    /// Declared role of the parameter receiving the derived identifier.
    pub filter_role: String,
    /// Fallback parameter names/titles for the derived identifier.
    pub filter_aliases: Vec<String>,
    /// Dashboard filter names never shown to the user.
    pub hidden_filter_names: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let base_url =
            env::var("BACKEND_BASE_URL").unwrap_or_else(|_| "http://localhost:5000".to_string());
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(AppError::Config {
                message: format!("BACKEND_BASE_URL must be an http(s) URL, got '{}'", base_url),
            });
        }

        let backend = BackendConfig {
            base_url,
            api_key: env::var("BACKEND_API_KEY").ok().filter(|k| !k.is_empty()),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/parameters.db".to_string()),
            ),
            max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let request = RequestConfig {
            timeout_ms: env::var("REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30000),
            max_retries: env::var("MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            retry_delay_ms: env::var("RETRY_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1000),
        };

        let parameters = ParameterConfig {
            url_prefix: env::var("PARAMETER_URL_PREFIX").unwrap_or_else(|_| "p_".to_string()),
        };

        let defaults = EntityConfig::default();
        let entity = EntityConfig {
            query_name: env::var("ENTITY_QUERY_NAME").unwrap_or(defaults.query_name),
            key_role: defaults.key_role,
            key_aliases: env_list("ENTITY_KEY_ALIASES").unwrap_or(defaults.key_aliases),
            id_fields: env_list("ENTITY_ID_FIELDS").unwrap_or(defaults.id_fields),
            filter_role: defaults.filter_role,
            filter_aliases: env_list("ENTITY_FILTER_ALIASES").unwrap_or(defaults.filter_aliases),
            hidden_filter_names: defaults.hidden_filter_names,
        };

        if entity.id_fields.is_empty() {
            return Err(AppError::Config {
                message: "ENTITY_ID_FIELDS must name at least one field".to_string(),
            });
        }

        Ok(Config {
            backend,
            database,
            logging,
            request,
            parameters,
            entity,
        })
    }
}

/// Read a comma-separated list, dropping blank items.
fn env_list(key: &str) -> Option<Vec<String>> {
    env::var(key).ok().map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    })
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for ParameterConfig {
    fn default() -> Self {
        Self {
            url_prefix: "p_".to_string(),
        }
    }
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            query_name: "entity".to_string(),
            key_role: "external_key".to_string(),
            key_aliases: vec!["companyGuid".to_string(), "gu_id".to_string()],
            id_fields: vec![
                "entityId".to_string(),
                "company_id".to_string(),
                "entity_id".to_string(),
                "id".to_string(),
            ],
            filter_role: "entity_id".to_string(),
            filter_aliases: vec!["entity Id".to_string(), "entityId".to_string()],
            hidden_filter_names: vec!["entity Id".to_string()],
        }
    }
}
