//! Desktop daemon configuration.

use pairsync_core::CoreConfig;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DesktopConfig {
    /// Plain HTTP bootstrap listener. Serves only the root certificate and
    /// the health check.
    pub listen_addr: String,
    /// LAN address companions use to reach this desktop. The serving leaf
    /// is issued for it.
    pub advertised_ip: IpAddr,
    /// Port of the TLS endpoint that serves the companion API with the
    /// serving leaf.
    pub service_port: u16,
    /// Interface the TLS endpoint binds to.
    pub service_bind_ip: IpAddr,
    /// Listener for ticket and device management. Must be a loopback address.
    pub operator_addr: String,
    /// State directory; the platform data dir when unset.
    pub data_dir: Option<PathBuf>,
    pub max_payload_size: usize,
    /// Redemption attempts allowed per client address per minute.
    pub redeem_rate_limit_per_minute: u32,
    pub cleanup_interval_secs: u64,
    pub core: CoreConfig,
}

impl Default for DesktopConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7420".to_string(),
            advertised_ip: IpAddr::from([127, 0, 0, 1]),
            service_port: 7421,
            service_bind_ip: IpAddr::from([0, 0, 0, 0]),
            operator_addr: "127.0.0.1:7422".to_string(),
            data_dir: None,
            max_payload_size: 1024 * 1024,
            redeem_rate_limit_per_minute: 10,
            cleanup_interval_secs: 60,
            core: CoreConfig::default(),
        }
    }
}

impl DesktopConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml_dep::from_str(&content)?;
        Ok(config)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(pairsync_core::get_data_dir)
    }

    pub fn service_listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.service_bind_ip, self.service_port)
    }

    /// Parsed operator address. Anything off loopback is refused.
    pub fn operator_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr: SocketAddr = self
            .operator_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("operator_addr {}: {}", self.operator_addr, e))?;
        if !addr.ip().is_loopback() {
            anyhow::bail!("operator_addr {} is not a loopback address", addr);
        }
        Ok(addr)
    }

    fn listen_port(&self) -> u16 {
        self.listen_addr
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(7420)
    }

    /// Plain endpoint companions fetch the root certificate from.
    pub fn bootstrap_url(&self) -> String {
        format!("http://{}", host_port(self.advertised_ip, self.listen_port()))
    }

    /// Authenticated endpoint secured by the serving leaf.
    pub fn service_url(&self) -> String {
        format!("https://{}", host_port(self.advertised_ip, self.service_port))
    }
}

fn host_port(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{}:{}", v4, port),
        IpAddr::V6(v6) => format!("[{}]:{}", v6, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: DesktopConfig = toml_dep::from_str(
            r#"
            advertised_ip = "192.168.1.20"

            [core.pairing]
            ticket_ttl_secs = 45
            "#,
        )
        .unwrap();
        assert_eq!(config.core.pairing.ticket_ttl_secs, 45);
        assert_eq!(config.core.session.token_lifetime_secs, 300);
        assert_eq!(config.service_port, 7421);
        assert_eq!(config.bootstrap_url(), "http://192.168.1.20:7420");
        assert_eq!(config.service_url(), "https://192.168.1.20:7421");
    }

    #[test]
    fn listeners_default_to_separate_ports() {
        let config = DesktopConfig::default();
        assert_eq!(
            config.service_listen_addr(),
            "0.0.0.0:7421".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            config.operator_listen_addr().unwrap(),
            "127.0.0.1:7422".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn operator_listener_must_be_loopback() {
        let config = DesktopConfig {
            operator_addr: "0.0.0.0:7422".to_string(),
            ..DesktopConfig::default()
        };
        assert!(config.operator_listen_addr().is_err());

        let config = DesktopConfig {
            operator_addr: "[::1]:7422".to_string(),
            ..DesktopConfig::default()
        };
        assert!(config.operator_listen_addr().is_ok());
    }

    #[test]
    fn ipv6_urls_are_bracketed() {
        let config = DesktopConfig {
            advertised_ip: "fe80::1".parse().unwrap(),
            ..DesktopConfig::default()
        };
        assert_eq!(config.service_url(), "https://[fe80::1]:7421");
    }
}
