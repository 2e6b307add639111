use std::env;

/// Shared store configuration.
/// Loaded from environment variables with local-development defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    /// Namespace for every key the Redis store touches.
    pub key_prefix: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            key_prefix: env::var("REDIS_KEY_PREFIX")
                .ok()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "judge".to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "judge".to_string(),
        }
    }
}
