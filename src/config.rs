//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Coordinator configuration.
///
/// Every timing knob lives here so tests can run with millisecond values
/// instead of the production defaults.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Coordinator name for identification.
    pub name: String,
    /// No inbound frame for this long forces a disconnect.
    pub liveness_timeout: Duration,
    /// Interval between per-connection health checks.
    pub health_check_interval: Duration,
    /// Delay between reconnect attempts (plus jitter).
    pub reconnect_delay: Duration,
    /// Reconnect attempts before giving up on an endpoint.
    pub max_reconnect_attempts: u32,
    /// Delay before the first completion poll.
    pub initial_poll_delay: Duration,
    /// Interval between completion polls.
    pub poll_interval: Duration,
    /// Poll ceiling per request (~25 minutes at the default interval).
    pub max_polls: u32,
    /// Software-mutex staleness threshold (force-release after this).
    pub mutex_staleness: Duration,
    /// Worker-state cache time-to-live.
    pub cache_ttl: Duration,
    /// Interval between stale-worker recovery sweeps.
    pub recovery_interval: Duration,
    /// Minimum idle time before a just-released worker accepts again.
    pub min_idle_before_reuse: Duration,
    /// Dedup window for query-style frames.
    pub query_dedup_window: Duration,
    /// Retention for inbound messages (also the sendPrompt dedup window).
    pub message_ttl: Duration,
    /// Interval between inbound-message cleanup sweeps.
    pub cleanup_interval: Duration,
    /// Cap on retained inbound messages per connection.
    pub message_cap: usize,
    /// Minimum spacing between worker-snapshot broadcasts.
    pub broadcast_throttle: Duration,
    /// Debounce applied to broadcast triggers.
    pub broadcast_debounce: Duration,
    /// Grace delay before the post-connect snapshot push.
    pub connect_broadcast_delay: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            name: "promptpool".to_string(),
            liveness_timeout: Duration::from_secs(90),
            health_check_interval: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            initial_poll_delay: Duration::from_secs(3),
            poll_interval: Duration::from_secs(1),
            max_polls: 1500, // ~25 minutes
            mutex_staleness: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(2),
            recovery_interval: Duration::from_secs(10),
            min_idle_before_reuse: Duration::ZERO,
            query_dedup_window: Duration::from_secs(5),
            message_ttl: Duration::from_secs(180),
            cleanup_interval: Duration::from_secs(300),
            message_cap: 50,
            broadcast_throttle: Duration::from_secs(2),
            broadcast_debounce: Duration::from_millis(500),
            connect_broadcast_delay: Duration::from_secs(1),
        }
    }
}

/// A configured remote endpoint, resolved to a WebSocket URL.
///
/// Accepts `host:port`, `http://host[:port]` or `https://host[:port]`;
/// https maps to wss. The path is always `/ws`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Stable identity for deduplicating connections (`host:port`).
    pub key: String,
    pub host: String,
    pub port: u16,
    /// Full WebSocket URL (`ws://host:port/ws` or `wss://…`).
    pub url: String,
}

impl EndpointConfig {
    /// Parse an endpoint descriptor.
    pub fn parse(descriptor: &str) -> Result<Self, ConfigError> {
        let raw = descriptor.trim();
        if raw.is_empty() {
            return Err(ConfigError::InvalidEndpoint {
                value: descriptor.to_string(),
                reason: "empty descriptor".to_string(),
            });
        }

        let (secure, rest) = if let Some(rest) = raw.strip_prefix("https://") {
            (true, rest)
        } else if let Some(rest) = raw.strip_prefix("http://") {
            (false, rest)
        } else {
            (false, raw)
        };

        // Drop any path component; only host[:port] matters.
        let authority = rest.split('/').next().unwrap_or(rest);
        if authority.is_empty() {
            return Err(ConfigError::InvalidEndpoint {
                value: descriptor.to_string(),
                reason: "missing host".to_string(),
            });
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port_str)) => {
                let port = port_str.parse::<u16>().map_err(|_| ConfigError::InvalidEndpoint {
                    value: descriptor.to_string(),
                    reason: format!("invalid port {port_str:?}"),
                })?;
                (host.to_string(), port)
            }
            None => (authority.to_string(), if secure { 443 } else { 80 }),
        };

        if host.is_empty() {
            return Err(ConfigError::InvalidEndpoint {
                value: descriptor.to_string(),
                reason: "missing host".to_string(),
            });
        }

        let scheme = if secure { "wss" } else { "ws" };
        Ok(Self {
            key: format!("{host}:{port}"),
            url: format!("{scheme}://{host}:{port}/ws"),
            host,
            port,
        })
    }

    /// Parse a comma-separated list of endpoint descriptors.
    pub fn parse_list(list: &str) -> Result<Vec<Self>, ConfigError> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::parse)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port() {
        let ep = EndpointConfig::parse("127.0.0.1:9100").unwrap();
        assert_eq!(ep.key, "127.0.0.1:9100");
        assert_eq!(ep.url, "ws://127.0.0.1:9100/ws");
        assert_eq!(ep.port, 9100);
    }

    #[test]
    fn parses_http_scheme_with_default_port() {
        let ep = EndpointConfig::parse("http://bridge.local").unwrap();
        assert_eq!(ep.key, "bridge.local:80");
        assert_eq!(ep.url, "ws://bridge.local:80/ws");
    }

    #[test]
    fn parses_https_as_wss() {
        let ep = EndpointConfig::parse("https://bridge.local:8443/ignored/path").unwrap();
        assert_eq!(ep.url, "wss://bridge.local:8443/ws");
    }

    #[test]
    fn rejects_empty_and_bad_port() {
        assert!(EndpointConfig::parse("  ").is_err());
        assert!(EndpointConfig::parse("host:notaport").is_err());
    }

    #[test]
    fn parse_list_skips_blanks() {
        let eps = EndpointConfig::parse_list("a:1, ,b:2,").unwrap();
        assert_eq!(eps.len(), 2);
        assert_eq!(eps[1].key, "b:2");
    }
}
