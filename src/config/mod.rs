use serde::Deserialize;

/// Complete artery configuration, loadable from TOML with per-field
/// defaults. Missing sections fall back wholesale.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArteryConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub geo: GeoConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

/// Server-side broker settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Socket address the WebSocket server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Per-connection outbound frame buffer. A peer whose buffer is full
    /// loses frames instead of stalling the fan-out.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    /// Seconds of silence before the broker closes a connection.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// How often upstream connectivity is published to viewers (seconds).
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8815".to_string()
}

fn default_outbound_buffer() -> usize {
    64
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_status_interval() -> u64 {
    5
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            outbound_buffer: default_outbound_buffer(),
            idle_timeout_secs: default_idle_timeout(),
            status_interval_secs: default_status_interval(),
        }
    }
}

/// Client-side stream agent settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_server_url")]
    pub url: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Keepalive ping cadence; kept safely below the broker idle timeout.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_cap")]
    pub reconnect_cap_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

fn default_server_url() -> String {
    "ws://localhost:8815/ws".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_ping_interval() -> u64 {
    20
}

fn default_reconnect_base() -> u64 {
    5_000
}

fn default_reconnect_cap() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            connect_timeout_secs: default_connect_timeout(),
            ping_interval_secs: default_ping_interval(),
            reconnect_base_ms: default_reconnect_base(),
            reconnect_cap_ms: default_reconnect_cap(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

/// Affine planar-to-geographic transform anchoring the upstream network
/// grid. Externally configured, never computed from the data. Defaults
/// anchor the Addis Ababa network.
#[derive(Debug, Clone, Deserialize)]
pub struct GeoConfig {
    #[serde(default = "default_base_lat")]
    pub base_lat: f64,
    #[serde(default = "default_base_lng")]
    pub base_lng: f64,
    #[serde(default)]
    pub base_x: f64,
    #[serde(default)]
    pub base_y: f64,
    /// Degrees per meter.
    #[serde(default = "default_scale")]
    pub scale: f64,
}

fn default_base_lat() -> f64 {
    9.0320
}

fn default_base_lng() -> f64 {
    38.7469
}

fn default_scale() -> f64 {
    1.0 / 111_320.0
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            base_lat: default_base_lat(),
            base_lng: default_base_lng(),
            base_x: 0.0,
            base_y: 0.0,
            scale: default_scale(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_capacity")]
    pub capacity: usize,
}

fn default_ledger_capacity() -> usize {
    100
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            capacity: default_ledger_capacity(),
        }
    }
}

/// Load configuration from a TOML file.
pub fn load_config(path: &str) -> Result<ArteryConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ArteryConfig = toml::from_str(&contents)?;
    Ok(config)
}

/// Environment overrides applied on top of the loaded file.
pub fn apply_env_overrides(config: &mut ArteryConfig) {
    if let Ok(addr) = std::env::var("ARTERY_BIND_ADDR") {
        config.broker.bind_addr = addr;
    }
    if let Ok(url) = std::env::var("ARTERY_SERVER_URL") {
        config.agent.url = url;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ArteryConfig::default();
        assert_eq!(config.broker.bind_addr, "0.0.0.0:8815");
        assert_eq!(config.broker.idle_timeout_secs, 60);
        assert_eq!(config.agent.reconnect_base_ms, 5_000);
        assert_eq!(config.agent.reconnect_cap_ms, 30_000);
        assert_eq!(config.agent.max_reconnect_attempts, 10);
        assert_eq!(config.ledger.capacity, 100);
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [broker]
            bind_addr = "127.0.0.1:9900"
            outbound_buffer = 8
            idle_timeout_secs = 30

            [agent]
            url = "ws://example.com/ws"
            reconnect_base_ms = 1000

            [geo]
            base_lat = 48.8566
            base_lng = 2.3522
            scale = 0.00001

            [ledger]
            capacity = 10
        "#;

        let config: ArteryConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.broker.bind_addr, "127.0.0.1:9900");
        assert_eq!(config.broker.outbound_buffer, 8);
        assert_eq!(config.agent.url, "ws://example.com/ws");
        assert_eq!(config.agent.reconnect_base_ms, 1000);
        assert_eq!(config.geo.base_lat, 48.8566);
        assert_eq!(config.ledger.capacity, 10);
    }

    #[test]
    fn test_partial_config() {
        // Missing sections use defaults
        let toml = r#"
            [broker]
            idle_timeout_secs = 15
        "#;

        let config: ArteryConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.broker.idle_timeout_secs, 15);
        assert_eq!(config.broker.bind_addr, "0.0.0.0:8815"); // Default
        assert_eq!(config.agent.ping_interval_secs, 20); // Default
    }

    #[test]
    fn test_empty_config_is_all_defaults() {
        let config: ArteryConfig = toml::from_str("").unwrap();
        assert_eq!(config.broker.bind_addr, "0.0.0.0:8815");
        assert_eq!(config.agent.connect_timeout_secs, 10);
        assert!((config.geo.base_lat - 9.0320).abs() < 1e-9);
    }

    #[test]
    fn test_load_config_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "[broker]\nbind_addr = \"127.0.0.1:0\"\n\n[geo]\nbase_lat = 1.5\n"
        )
        .unwrap();

        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.broker.bind_addr, "127.0.0.1:0");
        assert_eq!(config.geo.base_lat, 1.5);
    }
}
