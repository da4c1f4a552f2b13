//! Startup configuration, read once from a JSON file.
//!
//! Field names follow the long-standing `config.json` layout, e.g.
//!
//! ```json
//! {
//!     "General": { "BindIP": "0.0.0.0", "DNSPort": 53, "TimeoutMs": 500, "ShowStats": true },
//!     "Servers": ["1.1.1.1", "8.8.8.8"],
//!     "Hosts": [{ "IP": "192.168.1.10", "Name": "nas.lan" }],
//!     "Cnames": [{ "Name": "www.lan", "Cname": "nas.lan" }],
//!     "HTTPlistenPorts": [80],
//!     "Redirect301s": [{ "From": "wiki", "To": "wiki.lan:8080" }]
//! }
//! ```

use crate::protocol::{write_name, ProtocolError};
use crate::resolver::overrides::OverrideTable;
use serde::Deserialize;
use std::{
    fs, io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::warn;

const DNS_PORT: u16 = 53;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid upstream server {0:?}")]
    InvalidUpstream(String),
    #[error("invalid name {name:?}: {source}")]
    InvalidName {
        name: String,
        source: ProtocolError,
    },
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    pub general: General,
    #[serde(rename = "HTTPlistenPorts")]
    pub http_listen_ports: Vec<u16>,
    pub servers: Vec<String>,
    pub hosts: Vec<HostEntry>,
    pub cnames: Vec<CnameEntry>,
    #[serde(rename = "Redirect301s")]
    pub redirects: Vec<Redirect>,
    /// Names whose upstream NXDOMAIN answers should be trusted over an ISP's
    /// rewritten ones. Parsed but not yet acted on.
    #[serde(rename = "NXoverride")]
    pub nx_override: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct General {
    #[serde(rename = "BindIP")]
    pub bind_ip: Ipv4Addr,
    #[serde(rename = "DNSPort")]
    pub dns_port: u16,
    #[serde(rename = "DNSTCPalso")]
    pub dns_tcp_also: bool,
    pub timeout_ms: u64,
    pub show_stats: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct HostEntry {
    #[serde(rename = "IP")]
    pub ip: Ipv4Addr,
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct CnameEntry {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Cname")]
    pub cname: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Redirect {
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "To")]
    pub to: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            general: General::default(),
            http_listen_ports: vec![],
            servers: vec![
                "1.1.1.1".to_string(),
                "8.8.8.8".to_string(),
                "9.9.9.9".to_string(),
            ],
            hosts: vec![],
            cnames: vec![],
            redirects: vec![],
            nx_override: vec![],
        }
    }
}

impl Default for General {
    fn default() -> Self {
        General {
            bind_ip: Ipv4Addr::LOCALHOST,
            dns_port: DNS_PORT,
            dns_tcp_also: false,
            timeout_ms: 1000,
            show_stats: false,
        }
    }
}

impl Config {
    /// Loads `path`, falling back to the built-in defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => Config::from_json(&contents),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Config::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_owned(),
                source,
            }),
        }
    }

    pub fn from_json(contents: &str) -> Result<Config, ConfigError> {
        let config: Config = serde_json::from_str(contents)?;
        config.validate()?;

        if config.general.dns_tcp_also {
            warn!("Ignoring unsupported config: DNSTCPalso = true");
        }

        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let names = self
            .hosts
            .iter()
            .map(|h| &h.name)
            .chain(self.cnames.iter().flat_map(|c| [&c.name, &c.cname]));

        for name in names {
            write_name(name, &mut Vec::new()).map_err(|source| ConfigError::InvalidName {
                name: name.clone(),
                source,
            })?;
        }

        self.upstreams().map(|_| ())
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from((self.general.bind_ip, self.general.dns_port))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.general.timeout_ms)
    }

    /// Upstream servers to race, in configured order.
    ///
    /// Entries are `a.b.c.d` (port 53) or `a.b.c.d:port`. Anything pointing
    /// at 127.0.0.1 is left out so we never forward to ourselves.
    pub fn upstreams(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        let mut upstreams = Vec::with_capacity(self.servers.len());

        for server in &self.servers {
            let addr = parse_upstream(server)?;
            if *addr.ip() == Ipv4Addr::LOCALHOST {
                warn!(%server, "Skipping loopback upstream");
                continue;
            }
            upstreams.push(SocketAddr::V4(addr));
        }

        Ok(upstreams)
    }

    pub fn overrides(&self) -> OverrideTable {
        let table = self
            .cnames
            .iter()
            .fold(OverrideTable::new(), |table, entry| {
                table.with_cname(&entry.name, entry.cname.clone())
            });

        self.hosts
            .iter()
            .fold(table, |table, entry| table.with_host(&entry.name, entry.ip))
    }
}

fn parse_upstream(server: &str) -> Result<SocketAddrV4, ConfigError> {
    let server = server.trim();

    if let Ok(ip) = server.parse::<Ipv4Addr>() {
        return Ok(SocketAddrV4::new(ip, DNS_PORT));
    }

    server
        .parse::<SocketAddrV4>()
        .map_err(|_| ConfigError::InvalidUpstream(server.to_string()))
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::protocol::{AnswerData, Query};

    #[test]
    fn empty_object_uses_defaults() {
        let config = Config::from_json("{}").unwrap();

        assert_eq!(config.bind_addr(), "127.0.0.1:53".parse().unwrap());
        assert_eq!(config.timeout(), Duration::from_secs(1));
        assert_eq!(config.upstreams().unwrap().len(), 3);
        assert!(!config.general.show_stats);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = Config::load(Path::new("/nonexistent/dns-racer/config.json")).unwrap();

        assert_eq!(config.servers, Config::default().servers);
    }

    #[test]
    fn parses_full_config() {
        let config = Config::from_json(
            r#"{
                "General": {
                    "BindIP": "0.0.0.0",
                    "DNSPort": 5353,
                    "DNSTCPalso": true,
                    "TimeoutMs": 250,
                    "ShowStats": true
                },
                "HTTPlistenPorts": [8080],
                "Servers": ["1.1.1.1", "192.0.2.7:5300"],
                "Hosts": [{ "IP": "192.168.1.10", "Name": "nas.lan" }],
                "Cnames": [{ "Name": "www.lan", "Cname": "nas.lan" }],
                "Redirect301s": [{ "From": "wiki", "To": "wiki.lan:8080" }],
                "NXoverride": ["example.net"]
            }"#,
        )
        .unwrap();

        assert_eq!(config.bind_addr(), "0.0.0.0:5353".parse().unwrap());
        assert_eq!(config.timeout(), Duration::from_millis(250));
        assert!(config.general.show_stats);
        assert!(config.general.dns_tcp_also);
        assert_eq!(config.http_listen_ports, vec![8080]);
        assert_eq!(
            config.upstreams().unwrap(),
            vec![
                "1.1.1.1:53".parse::<SocketAddr>().unwrap(),
                "192.0.2.7:5300".parse().unwrap(),
            ]
        );
        assert_eq!(
            config.redirects,
            vec![Redirect {
                from: "wiki".to_string(),
                to: "wiki.lan:8080".to_string(),
            }]
        );
        assert_eq!(config.nx_override, vec!["example.net".to_string()]);
    }

    #[test]
    fn loopback_upstreams_are_filtered() {
        let config = Config::from_json(
            r#"{ "Servers": ["127.0.0.1", "9.9.9.9", "127.0.0.1:5353"] }"#,
        )
        .unwrap();

        assert_eq!(
            config.upstreams().unwrap(),
            vec!["9.9.9.9:53".parse::<SocketAddr>().unwrap()]
        );
    }

    #[test]
    fn invalid_upstream_is_an_error() {
        let result = Config::from_json(r#"{ "Servers": ["dns.example"] }"#);

        assert!(matches!(result, Err(ConfigError::InvalidUpstream(s)) if s == "dns.example"));
    }

    #[test]
    fn invalid_host_address_is_an_error() {
        let result = Config::from_json(r#"{ "Hosts": [{ "IP": "not-an-ip", "Name": "nas.lan" }] }"#);

        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn unencodable_cname_target_is_an_error() {
        let result =
            Config::from_json(r#"{ "Cnames": [{ "Name": "www.lan", "Cname": "nas..lan" }] }"#);

        assert!(matches!(
            result,
            Err(ConfigError::InvalidName { name, .. }) if name == "nas..lan"
        ));
    }

    #[test]
    fn overrides_are_built_from_tables() {
        let config = Config::from_json(
            r#"{
                "Hosts": [
                    { "IP": "192.168.1.10", "Name": "nas.lan" },
                    { "IP": "192.168.1.11", "Name": "www.lan" }
                ],
                "Cnames": [{ "Name": "WWW.lan", "Cname": "nas.lan" }]
            }"#,
        )
        .unwrap();

        let table = config.overrides();

        assert_eq!(
            table.resolve(&Query::new(1, "www.lan")).unwrap().data,
            AnswerData::Cname("nas.lan".to_string())
        );
        assert_eq!(
            table.resolve(&Query::new(1, "nas.lan")).unwrap().data,
            AnswerData::A(Ipv4Addr::new(192, 168, 1, 10))
        );
    }
}
