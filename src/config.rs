use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use url::Url;

use crate::data::StringSet;
use crate::routes::params::parse_duration;

const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to parse proxy-url: {0}")]
    ProxyUrl(url::ParseError),

    #[error("unable to parse {flag}: {reason}")]
    Duration { flag: &'static str, reason: String },

    #[error("unable to read token file {path:?}: {source}")]
    TokenFile {
        path: String,
        source: std::io::Error,
    },

    #[error("read empty token from file {0:?}")]
    EmptyToken(String),
}

/// Command-line surface of the agent.
#[derive(Debug, Parser)]
#[command(
    name = "prom-authz",
    about = "Authorizing proxy in front of Prometheus, scoping queries to the namespaces a token owns"
)]
pub struct AgentArgs {
    /// Address to listen on.
    #[arg(long = "listen-address", default_value = ":9090")]
    pub listen_address: String,

    /// Upstream Prometheus to proxy to.
    #[arg(long = "proxy-url", default_value = "http://localhost:9999")]
    pub proxy_url: String,

    /// Maximum duration before timing out the read of a request and
    /// closing idle connections.
    #[arg(long = "read-timeout", default_value = "5m")]
    pub read_timeout: String,

    /// Maximum number of simultaneous connections.
    #[arg(long = "max-connections", default_value_t = 512)]
    pub max_connections: usize,

    /// Matcher names stripped from remote-read queries before rewriting.
    #[arg(long = "filter-reader-labels")]
    pub filter_reader_labels: Vec<String>,

    /// Emit logs as JSON.
    #[arg(long = "log.json")]
    pub log_json: bool,

    /// Enable debug logging.
    #[arg(long = "log.debug")]
    pub log_debug: bool,
}

/// Validated runtime configuration.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub listen_address: String,
    pub proxy_url: Url,
    pub read_timeout: Duration,
    pub max_connections: usize,
    pub filter_reader_labels: StringSet,
    pub self_token: String,
    pub log_json: bool,
    pub log_debug: bool,
}

impl AgentConfig {
    pub fn from_args(args: AgentArgs) -> Result<Self, ConfigError> {
        Self::build(args, SERVICE_ACCOUNT_TOKEN_PATH)
    }

    fn build(args: AgentArgs, token_path: &str) -> Result<Self, ConfigError> {
        let proxy_url = Url::parse(&args.proxy_url).map_err(ConfigError::ProxyUrl)?;

        let read_timeout = parse_duration(&args.read_timeout)
            .ok()
            .filter(|seconds| *seconds > 0.0)
            .map(Duration::from_secs_f64)
            .ok_or_else(|| ConfigError::Duration {
                flag: "read-timeout",
                reason: args.read_timeout.clone(),
            })?;

        let self_token = read_token_file(token_path)?;

        Ok(Self {
            listen_address: normalize_listen_address(&args.listen_address),
            proxy_url,
            read_timeout,
            max_connections: args.max_connections,
            filter_reader_labels: args.filter_reader_labels.into_iter().collect(),
            self_token,
            log_json: args.log_json,
            log_debug: args.log_debug,
        })
    }
}

impl fmt::Display for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "listening on {}, proxying to {} with ignoring 'remote reader' labels [{}], \
             only allow maximum {} connections with {:?} read timeout",
            self.listen_address,
            self.proxy_url,
            self.filter_reader_labels,
            self.max_connections,
            self.read_timeout,
        )
    }
}

fn read_token_file(path: &str) -> Result<String, ConfigError> {
    let token = fs::read_to_string(Path::new(path)).map_err(|source| ConfigError::TokenFile {
        path: path.to_string(),
        source,
    })?;
    let token = token.trim().to_string();
    if token.is_empty() {
        return Err(ConfigError::EmptyToken(path.to_string()));
    }
    Ok(token)
}

/// `:9090` binds every interface, the Go listener convention.
fn normalize_listen_address(address: &str) -> String {
    if let Some(port) = address.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args() -> AgentArgs {
        AgentArgs::parse_from(["prom-authz"])
    }

    #[test]
    fn defaults_match_the_documented_flags() {
        let parsed = args();
        assert_eq!(parsed.listen_address, ":9090");
        assert_eq!(parsed.proxy_url, "http://localhost:9999");
        assert_eq!(parsed.read_timeout, "5m");
        assert_eq!(parsed.max_connections, 512);
        assert!(parsed.filter_reader_labels.is_empty());
    }

    #[test]
    fn listen_address_gains_a_host() {
        assert_eq!(normalize_listen_address(":9090"), "0.0.0.0:9090");
        assert_eq!(normalize_listen_address("127.0.0.1:80"), "127.0.0.1:80");
    }

    #[test]
    fn missing_token_file_is_fatal() {
        let err = AgentConfig::build(args(), "/definitely/not/here").unwrap_err();
        assert!(matches!(err, ConfigError::TokenFile { .. }));
    }

    #[test]
    fn empty_token_is_fatal() {
        let dir = std::env::temp_dir().join("prom-authz-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("token-empty");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "   ").unwrap();

        let err = AgentConfig::build(args(), path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyToken(_)));
    }

    #[test]
    fn token_is_trimmed() {
        let dir = std::env::temp_dir().join("prom-authz-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("token-ok");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "sa-token\n").unwrap();

        let config = AgentConfig::build(args(), path.to_str().unwrap()).unwrap();
        assert_eq!(config.self_token, "sa-token");
        assert_eq!(config.read_timeout, Duration::from_secs(300));
    }
}
