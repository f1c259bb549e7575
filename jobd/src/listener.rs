//! Control listener: the first free port of the configured range.

use std::io;
use std::net::{IpAddr, SocketAddr};

use jobctl_common::ControlConfig;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::error::{ControlError, Result};

#[derive(Debug)]
pub struct ControlListener {
    inner: TcpListener,
    port: u16,
    addresses: Vec<String>,
}

impl ControlListener {
    /// Try each port of `[start_port, end_port)` in ascending order and keep
    /// the first that binds.
    pub async fn bind(config: &ControlConfig) -> Result<Self> {
        config.validate()?;
        let ip: IpAddr = config
            .bind_address
            .parse()
            .map_err(|_| ControlError::BindAddress(config.bind_address.clone()))?;

        for port in config.port_range() {
            match TcpListener::bind(SocketAddr::new(ip, port)).await {
                Ok(inner) => {
                    let addresses = advertised_addresses(config, ip);
                    info!(
                        port,
                        addresses = %addresses.join(","),
                        "Control listener bound"
                    );
                    return Ok(Self {
                        inner,
                        port,
                        addresses,
                    });
                }
                Err(err) => debug!(port, "Port unavailable: {}", err),
            }
        }

        Err(ControlError::PortRangeExhausted {
            start: config.start_port,
            end: config.end_port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Addresses workers are told to connect to, most preferred first.
    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept().await
    }
}

fn advertised_addresses(config: &ControlConfig, bound: IpAddr) -> Vec<String> {
    if !config.advertised_addresses.is_empty() {
        return config.advertised_addresses.clone();
    }
    if !bound.is_unspecified() {
        return vec![bound.to_string()];
    }
    let mut detected = interface_addresses();
    if detected.is_empty() {
        detected.push("127.0.0.1".to_string());
    }
    detected
}

/// IPv4 addresses of the local interfaces, loopback last.
#[cfg(unix)]
fn interface_addresses() -> Vec<String> {
    use std::net::SocketAddrV4;

    let addrs = match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => addrs,
        Err(err) => {
            debug!("getifaddrs failed: {}", err);
            return Vec::new();
        }
    };

    let mut ips: Vec<_> = addrs
        .filter_map(|ifaddr| {
            let sin = ifaddr.address?.as_sockaddr_in().copied()?;
            Some(*SocketAddrV4::from(sin).ip())
        })
        .collect();
    ips.sort_by_key(|ip| ip.is_loopback());
    let mut seen = std::collections::HashSet::new();
    ips.retain(|ip| seen.insert(*ip));
    ips.into_iter().map(|ip| ip.to_string()).collect()
}

#[cfg(not(unix))]
fn interface_addresses() -> Vec<String> {
    Vec::new()
}
