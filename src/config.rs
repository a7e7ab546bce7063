//! Configuration for gatewatch.
//!
//! Runtime settings come from environment variables with sensible defaults.
//! The monitored fleet comes from a YAML document describing locations and
//! the ISP uplinks behind each one; it is flattened into a target list
//! before any probing starts.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Configuration error types. All variants abort startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("no locations defined in {0}")]
    NoLocations(String),
    #[error("no targets defined in {0}")]
    NoTargets(String),
}

/// Runtime settings loaded from environment variables.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Zabbix trapper address (default: 127.0.0.1)
    pub zabbix_server: String,
    /// Zabbix trapper port (default: 10051)
    pub zabbix_port: u16,
    /// Echo requests per probe (default: 5)
    pub probe_count: u32,
    /// Timeout for a single echo request (default: 3s)
    pub per_probe_timeout: Duration,
    /// Hard deadline for one target's whole probe (default: 30s)
    pub probe_deadline: Duration,
    /// Time between cycle starts in daemon mode (default: 60s)
    pub cycle_interval: Duration,
    /// Concurrent probe cap; `None` means min(target count, 32)
    pub max_in_flight: Option<usize>,
    /// Retries per metric push on transient failure (default: 1)
    pub sink_retries: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            zabbix_server: "127.0.0.1".to_string(),
            zabbix_port: 10051,
            probe_count: 5,
            per_probe_timeout: Duration::from_secs(3),
            probe_deadline: Duration::from_secs(30),
            cycle_interval: Duration::from_secs(60),
            max_in_flight: None,
            sink_retries: 1,
        }
    }
}

impl MonitorConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `GATEWATCH_ZABBIX_SERVER`: collector address (default: 127.0.0.1)
    /// - `GATEWATCH_ZABBIX_PORT`: collector port (default: 10051)
    /// - `GATEWATCH_PROBE_COUNT`: echo requests per probe (default: 5)
    /// - `GATEWATCH_PROBE_TIMEOUT_SECS`: per-echo timeout (default: 3)
    /// - `GATEWATCH_PROBE_DEADLINE_SECS`: per-target deadline (default: 30)
    /// - `GATEWATCH_CYCLE_INTERVAL_SECS`: cycle interval (default: 60)
    /// - `GATEWATCH_MAX_IN_FLIGHT`: concurrent probe cap (default: fleet-sized)
    /// - `GATEWATCH_SINK_RETRIES`: transient push retries (default: 1)
    ///
    /// Unparseable values keep their defaults; a zero probe count or zero
    /// concurrency cap is ignored the same way.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(server) = env::var("GATEWATCH_ZABBIX_SERVER") {
            cfg.zabbix_server = server;
        }
        if let Some(port) = env_parse::<u16>("GATEWATCH_ZABBIX_PORT") {
            cfg.zabbix_port = port;
        }
        if let Some(count) = env_parse::<u32>("GATEWATCH_PROBE_COUNT") {
            if count > 0 {
                cfg.probe_count = count;
            }
        }
        if let Some(secs) = env_parse::<u64>("GATEWATCH_PROBE_TIMEOUT_SECS") {
            cfg.per_probe_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_parse::<u64>("GATEWATCH_PROBE_DEADLINE_SECS") {
            cfg.probe_deadline = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_parse::<u64>("GATEWATCH_CYCLE_INTERVAL_SECS") {
            cfg.cycle_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(cap) = env_parse::<usize>("GATEWATCH_MAX_IN_FLIGHT") {
            if cap > 0 {
                cfg.max_in_flight = Some(cap);
            }
        }
        if let Some(retries) = env_parse::<u32>("GATEWATCH_SINK_RETRIES") {
            cfg.sink_retries = retries;
        }

        cfg
    }

    /// Effective concurrency cap for a fleet of `target_count` targets.
    pub fn in_flight_cap(&self, target_count: usize) -> usize {
        self.max_in_flight
            .unwrap_or_else(|| target_count.min(32))
            .max(1)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

/// One monitored gateway. Built from configuration, never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Target {
    /// `location/isp-id`, unique across the fleet
    pub id: String,
    /// Gateway address to probe
    pub address: String,
    pub location: String,
    pub isp_name: String,
    pub connection_type: String,
    /// Host the collector files this target's metrics under
    pub sink_hostname: String,
}

// Fleet document model. Maps are ordered so the flattened target list is
// stable across runs.

#[derive(Debug, Deserialize)]
struct FleetFile {
    locations: BTreeMap<String, Location>,
}

#[derive(Debug, Deserialize)]
struct Location {
    isps: BTreeMap<String, Uplink>,
}

#[derive(Debug, Deserialize)]
struct Uplink {
    gateway_ip: String,
    zabbix_hostname: String,
    #[serde(default = "default_isp_name")]
    isp_name: String,
    #[serde(default = "default_connection_type")]
    connection_type: String,
}

fn default_isp_name() -> String {
    "Unknown ISP".to_string()
}

fn default_connection_type() -> String {
    "Unknown".to_string()
}

/// Load the fleet document at `path` and flatten it into targets.
pub fn load_targets<P: AsRef<Path>>(path: P) -> Result<Vec<Target>, ConfigError> {
    let path_str = path.as_ref().display().to_string();
    let text = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
        path: path_str.clone(),
        source,
    })?;
    parse_targets(&text, &path_str)
}

/// Parse a fleet document and flatten it into targets.
///
/// A missing `gateway_ip` or `zabbix_hostname` is a parse error; an empty
/// fleet is rejected outright.
pub fn parse_targets(text: &str, origin: &str) -> Result<Vec<Target>, ConfigError> {
    let fleet: FleetFile = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
        path: origin.to_string(),
        source,
    })?;

    if fleet.locations.is_empty() {
        return Err(ConfigError::NoLocations(origin.to_string()));
    }

    let mut targets = Vec::new();
    for (location_name, location) in &fleet.locations {
        for (isp_id, uplink) in &location.isps {
            targets.push(Target {
                id: format!("{}/{}", location_name, isp_id),
                address: uplink.gateway_ip.clone(),
                location: location_name.clone(),
                isp_name: uplink.isp_name.clone(),
                connection_type: uplink.connection_type.clone(),
                sink_hostname: uplink.zabbix_hostname.clone(),
            });
        }
    }

    if targets.is_empty() {
        return Err(ConfigError::NoTargets(origin.to_string()));
    }

    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FLEET: &str = r#"
locations:
  home:
    isps:
      comcast:
        gateway_ip: "203.0.113.1"
        zabbix_hostname: "gw-home-comcast"
        isp_name: "Comcast"
        connection_type: "cable"
      starlink:
        gateway_ip: "203.0.113.2"
        zabbix_hostname: "gw-home-starlink"
  office:
    isps:
      fiber:
        gateway_ip: "198.51.100.1"
        zabbix_hostname: "gw-office-fiber"
        isp_name: "Example Telecom"
        connection_type: "fiber"
"#;

    #[test]
    fn test_default_config() {
        let cfg = MonitorConfig::default();
        assert_eq!(cfg.zabbix_server, "127.0.0.1");
        assert_eq!(cfg.zabbix_port, 10051);
        assert_eq!(cfg.probe_count, 5);
        assert_eq!(cfg.per_probe_timeout, Duration::from_secs(3));
        assert_eq!(cfg.probe_deadline, Duration::from_secs(30));
        assert_eq!(cfg.sink_retries, 1);
    }

    #[test]
    fn test_in_flight_cap() {
        let mut cfg = MonitorConfig::default();
        assert_eq!(cfg.in_flight_cap(4), 4);
        assert_eq!(cfg.in_flight_cap(100), 32);

        cfg.max_in_flight = Some(8);
        assert_eq!(cfg.in_flight_cap(100), 8);
        assert_eq!(cfg.in_flight_cap(2), 8);
    }

    #[test]
    fn test_parse_targets_flattens_fleet() {
        let targets = parse_targets(FLEET, "fleet.yml").unwrap();
        assert_eq!(targets.len(), 3);

        let ids: Vec<&str> = targets.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["home/comcast", "home/starlink", "office/fiber"]);

        let comcast = &targets[0];
        assert_eq!(comcast.address, "203.0.113.1");
        assert_eq!(comcast.location, "home");
        assert_eq!(comcast.isp_name, "Comcast");
        assert_eq!(comcast.connection_type, "cable");
        assert_eq!(comcast.sink_hostname, "gw-home-comcast");
    }

    #[test]
    fn test_parse_targets_applies_defaults() {
        let targets = parse_targets(FLEET, "fleet.yml").unwrap();
        let starlink = &targets[1];
        assert_eq!(starlink.isp_name, "Unknown ISP");
        assert_eq!(starlink.connection_type, "Unknown");
    }

    #[test]
    fn test_parse_targets_missing_gateway_is_fatal() {
        let doc = r#"
locations:
  home:
    isps:
      broken:
        zabbix_hostname: "gw-broken"
"#;
        let err = parse_targets(doc, "fleet.yml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_parse_targets_empty_fleet_is_fatal() {
        let err = parse_targets("locations: {}", "fleet.yml").unwrap_err();
        assert!(matches!(err, ConfigError::NoLocations(_)));

        let doc = r#"
locations:
  home:
    isps: {}
"#;
        let err = parse_targets(doc, "fleet.yml").unwrap_err();
        assert!(matches!(err, ConfigError::NoTargets(_)));
    }

    #[test]
    fn test_load_targets_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FLEET.as_bytes()).unwrap();

        let targets = load_targets(file.path()).unwrap();
        assert_eq!(targets.len(), 3);
    }

    #[test]
    fn test_load_targets_missing_file() {
        let err = load_targets("/nonexistent/fleet.yml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
