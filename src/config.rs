//! Socketace configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::client::ClientOptions;
use crate::dns::name::{available_for, normalize_domain};
use crate::encoding::Encoder;
use crate::error::{Result, TunnelError};
use crate::handshake::Overrides;
use crate::records::QueryType;
use crate::server::ServerOptions;
use crate::session::{MAX_FRAGMENT_SIZE, MIN_FRAGMENT_SIZE};

/// Name budget a domain must leave for tunnelled requests
pub const MIN_NAME_BUDGET: usize = 64;

/// Top-level configuration shared by both ends
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Authoritative suffix the tunnel lives under
    #[serde(default)]
    pub domain: String,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local TCP address accepting connections to tunnel
    pub listen: SocketAddr,

    /// Recursive resolver queries are sent to
    pub resolver: SocketAddr,

    pub query_type: Option<QueryType>,
    pub upstream_encoder: Option<Encoder>,
    pub downstream_encoder: Option<Encoder>,
    pub fragment_size: Option<usize>,

    pub lazy_mode: bool,
    pub multi_query: bool,

    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub lazy_poll_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub round_trip_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let defaults = ClientOptions::default();
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 1080)),
            resolver: SocketAddr::from(([8, 8, 8, 8], 53)),
            query_type: None,
            upstream_encoder: None,
            downstream_encoder: None,
            fragment_size: None,
            lazy_mode: true,
            multi_query: false,
            poll_interval: defaults.poll_interval,
            lazy_poll_interval: defaults.lazy_poll_interval,
            round_trip_timeout: defaults.round_trip_timeout,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// UDP address answering DNS queries
    pub listen: SocketAddr,

    /// TCP service each accepted session is connected to
    pub upstream: SocketAddr,

    pub max_users: usize,

    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// How long a lazy-mode poll may be held waiting for data
    #[serde(with = "humantime_serde")]
    pub lazy_hold: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let defaults = ServerOptions::default();
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 53)),
            upstream: SocketAddr::from(([127, 0, 0, 1], 22)),
            max_users: defaults.max_users,
            idle_timeout: defaults.idle_timeout,
            lazy_hold: defaults.lazy_hold,
        }
    }
}

impl TunnelConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let domain = normalize_domain(&self.domain);
        if domain.is_empty() {
            return Err(TunnelError::InvalidConfig("domain must be set".into()));
        }
        if available_for(&domain) < MIN_NAME_BUDGET {
            return Err(TunnelError::InvalidConfig(format!(
                "domain {} leaves only {} octets for requests",
                domain,
                available_for(&domain)
            )));
        }
        if let Some(size) = self.client.fragment_size {
            if !(MIN_FRAGMENT_SIZE..=MAX_FRAGMENT_SIZE).contains(&size) {
                return Err(TunnelError::InvalidConfig(format!(
                    "fragment size {} outside {}..={}",
                    size, MIN_FRAGMENT_SIZE, MAX_FRAGMENT_SIZE
                )));
            }
        }
        if self.client.upstream_encoder.is_some_and(|e| !e.hostname_safe()) {
            return Err(TunnelError::InvalidConfig(
                "upstream encoder must be hostname safe".into(),
            ));
        }
        if self.client.downstream_encoder == Some(Encoder::Raw)
            && !self.client.query_type.is_some_and(|q| q.carries_raw())
        {
            return Err(TunnelError::InvalidConfig(
                "raw downstream needs a null or private query type".into(),
            ));
        }
        if self.server.max_users == 0 {
            return Err(TunnelError::InvalidConfig("max_users must be positive".into()));
        }
        Ok(())
    }

    pub fn client_options(&self) -> ClientOptions {
        let client = &self.client;
        ClientOptions {
            domain: normalize_domain(&self.domain),
            overrides: Overrides {
                query_type: client.query_type,
                upstream_encoder: client.upstream_encoder,
                downstream_encoder: client.downstream_encoder,
                fragment_size: client.fragment_size,
                lazy_mode: client.lazy_mode,
                multi_query: client.multi_query,
            },
            poll_interval: client.poll_interval,
            lazy_poll_interval: client.lazy_poll_interval,
            round_trip_timeout: client.round_trip_timeout,
        }
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            domain: normalize_domain(&self.domain),
            max_users: self.server.max_users,
            idle_timeout: self.server.idle_timeout,
            lazy_hold: self.server.lazy_hold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_needs_a_domain() {
        let mut config = TunnelConfig::default();
        assert!(config.validate().is_err());

        config.domain = "T.Example.Org.".into();
        assert!(config.validate().is_ok());
        assert_eq!(config.client_options().domain, "t.example.org");
    }

    #[test]
    fn test_long_domain_rejected() {
        let config = TunnelConfig {
            domain: format!("{}.example.org", "a".repeat(60)).repeat(3),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(TunnelError::InvalidConfig(_))));
    }

    #[test]
    fn test_parse_toml() {
        let config: TunnelConfig = toml::from_str(
            r#"
            domain = "t.example.org"

            [client]
            resolver = "1.1.1.1:53"
            query_type = "txt"
            downstream_encoder = "base64u"
            fragment_size = 400
            poll_interval = "500ms"

            [server]
            max_users = 4
            idle_timeout = "2m"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());

        let client = config.client_options();
        assert_eq!(client.overrides.query_type, Some(QueryType::Txt));
        assert_eq!(client.overrides.downstream_encoder, Some(Encoder::Base64Alt));
        assert_eq!(client.overrides.fragment_size, Some(400));
        assert_eq!(client.poll_interval, Duration::from_millis(500));
        assert!(client.overrides.lazy_mode);

        let server = config.server_options();
        assert_eq!(server.max_users, 4);
        assert_eq!(server.idle_timeout, Duration::from_secs(120));
        assert_eq!(server.lazy_hold, Duration::from_millis(500));
    }

    #[test]
    fn test_raw_downstream_requires_opaque_records() {
        let mut config = TunnelConfig {
            domain: "t.example.org".into(),
            ..Default::default()
        };
        config.client.downstream_encoder = Some(Encoder::Raw);
        assert!(config.validate().is_err());
        config.client.query_type = Some(QueryType::Null);
        assert!(config.validate().is_ok());
    }
}
