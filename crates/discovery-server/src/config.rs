//! Environment-driven server configuration (`spec.md` §6 "Environment
//! variables"). Read once at startup into a plain struct, mirroring the
//! teacher's `ServerConfig`/`default_config()` pattern
//! (`examples/Epistates-turbomcp/crates/turbomcp-server/src/lib.rs`)
//! rather than re-reading `std::env` scattered through the codebase.

use std::path::PathBuf;
use std::time::Duration;

/// Which transport(s) to start (`spec.md` §6 `TRANSPORT_MODE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Stdio only.
    Stdio,
    /// Streamable HTTP + SSE only.
    Http,
    /// AMQP only.
    Amqp,
    /// Every transport at once.
    All,
}

impl TransportMode {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "stdio" => Some(Self::Stdio),
            "http" => Some(Self::Http),
            "amqp" => Some(Self::Amqp),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    /// Auto-detect default: stdio when not containerized, else http+stdio
    /// (`spec.md` §6). Containerization is approximated the same way most
    /// CLIs do: presence of `/.dockerenv` or `container` env var.
    fn auto_detect() -> Self {
        let containerized =
            std::path::Path::new("/.dockerenv").exists() || std::env::var_os("container").is_some();
        if containerized { Self::All } else { Self::Stdio }
    }
}

/// Full server configuration, assembled once from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Which transports to start.
    pub transport_mode: TransportMode,
    /// HTTP bind port.
    pub http_port: u16,
    /// HTTP session idle TTL.
    pub http_session_ttl: Duration,
    /// SSE client reconnect hint, in milliseconds.
    pub http_sse_retry_ms: u64,
    /// Allowed `Origin` values; empty means "allow any".
    pub http_allowed_origins: Vec<String>,
    /// AMQP broker URI, required when AMQP is enabled.
    pub amqp_url: Option<String>,
    /// Prefix for AMQP queue names.
    pub amqp_queue_prefix: String,
    /// Notification fan-out exchange name.
    pub amqp_exchange: String,
    /// Per-request AMQP response timeout.
    pub amqp_response_timeout: Duration,
    /// Enforce strict plugin capability/tool matching.
    pub strict_capabilities: bool,
    /// CMDB database file path.
    pub cmdb_path: PathBuf,
    /// CMDB master key file path.
    pub cmdb_key_file: PathBuf,
    /// Plugin install directory root.
    pub plugins_dir: PathBuf,
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_string(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl ServerConfig {
    /// Build configuration from the process environment, applying the
    /// documented defaults for every unset variable.
    #[must_use]
    pub fn from_env() -> Self {
        let transport_mode = env_string("TRANSPORT_MODE")
            .and_then(|v| TransportMode::parse(&v))
            .unwrap_or_else(TransportMode::auto_detect);

        let http_port = env_string("HTTP_PORT")
            .or_else(|| env_string("PORT"))
            .and_then(|v| v.parse().ok())
            .unwrap_or(3000);

        let allowed_origins = env_string("HTTP_ALLOWED_ORIGINS")
            .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();

        Self {
            transport_mode,
            http_port,
            http_session_ttl: Duration::from_secs(env_parsed("HTTP_SESSION_TTL_SECONDS", 1800)),
            http_sse_retry_ms: env_parsed("HTTP_SSE_RETRY_MS", 3000),
            http_allowed_origins: allowed_origins,
            amqp_url: env_string("AMQP_URL"),
            amqp_queue_prefix: env_string("AMQP_QUEUE_PREFIX").unwrap_or_else(|| "mcp.discovery".to_string()),
            amqp_exchange: env_string("AMQP_EXCHANGE").unwrap_or_else(|| "mcp.notifications".to_string()),
            amqp_response_timeout: Duration::from_millis(env_parsed("AMQP_RESPONSE_TIMEOUT_MS", 30_000)),
            strict_capabilities: env_string("STRICT_CAPABILITIES").as_deref() == Some("1"),
            cmdb_path: env_string("CMDB_PATH").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("cmdb.db")),
            cmdb_key_file: env_string("CMDB_KEY_FILE").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("cmdb_key")),
            plugins_dir: env_string("PLUGINS_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("plugins")),
        }
    }

    /// Bind address derived from `http_port`.
    #[must_use]
    pub fn http_bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.http_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_bind_addr_uses_configured_port() {
        let config = ServerConfig {
            http_port: 4567,
            ..ServerConfig::from_env()
        };
        assert_eq!(config.http_bind_addr(), "0.0.0.0:4567");
    }

    #[test]
    fn transport_mode_parses_explicit_values() {
        assert_eq!(TransportMode::parse("http"), Some(TransportMode::Http));
        assert_eq!(TransportMode::parse("bogus"), None);
    }
}
