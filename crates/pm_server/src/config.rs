//! Server configuration, read once from the environment at startup.

use std::env;

pub const MIN_PING_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub enable_rate_limiting: bool,
    pub max_connections_per_ip: u32,
    pub require_invitation: bool,
    pub ws_ping_interval_ms: u64,
    pub ws_ping_timeout_ms: u64,
    pub cors_origin: Option<String>,
    pub rate_limit_salt: String,
    /// Challenge responses are Ed25519-verified server-side. A deployment
    /// that wants client-only verification can switch this off.
    pub verify_challenge_signatures: bool,
    /// Media upload/download answers NOT_SUPPORTED unless enabled.
    pub enable_media_storage: bool,
    /// Closed MIME allowlist for media uploads.
    pub allowed_mime_types: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".into(),
            enable_rate_limiting: true,
            max_connections_per_ip: 5,
            require_invitation: true,
            ws_ping_interval_ms: 30_000,
            ws_ping_timeout_ms: 10_000,
            cors_origin: None,
            rate_limit_salt: String::new(),
            verify_challenge_signatures: true,
            enable_media_storage: false,
            allowed_mime_types: default_mime_types(),
        }
    }
}

fn default_mime_types() -> Vec<String> {
    [
        "image/jpeg",
        "image/png",
        "image/gif",
        "image/webp",
        "video/mp4",
        "video/webm",
        "audio/mpeg",
        "audio/ogg",
        "application/pdf",
        "application/zip",
        "text/plain",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parsed("PORT", defaults.port),
            host: env::var("HOST").unwrap_or(defaults.host),
            enable_rate_limiting: env_bool("ENABLE_RATE_LIMITING", defaults.enable_rate_limiting),
            max_connections_per_ip: env_parsed(
                "MAX_CONNECTIONS_PER_IP",
                defaults.max_connections_per_ip,
            ),
            require_invitation: env_bool("REQUIRE_INVITATION", defaults.require_invitation),
            ws_ping_interval_ms: env_parsed("WS_PING_INTERVAL", defaults.ws_ping_interval_ms)
                .max(MIN_PING_INTERVAL_MS),
            ws_ping_timeout_ms: env_parsed("WS_PING_TIMEOUT", defaults.ws_ping_timeout_ms),
            cors_origin: env::var("CORS_ORIGIN").ok(),
            rate_limit_salt: env::var("RATE_LIMIT_SALT").unwrap_or_default(),
            verify_challenge_signatures: env_bool("VERIFY_CHALLENGE_SIGNATURES", true),
            enable_media_storage: env_bool("ENABLE_MEDIA_STORAGE", false),
            allowed_mime_types: defaults.allowed_mime_types,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.host, "0.0.0.0");
        assert!(config.enable_rate_limiting);
        assert_eq!(config.max_connections_per_ip, 5);
        assert!(config.require_invitation);
        assert_eq!(config.ws_ping_interval_ms, 30_000);
        assert!(config.verify_challenge_signatures);
        assert!(!config.enable_media_storage);
    }
}
