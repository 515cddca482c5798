use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::server::request::HANDSHAKE_TIMEOUT;

/// SOCKS4/SOCKS4a proxy server.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Address to listen on
    #[arg(short = 'i', long, default_value = "127.0.0.1")]
    pub listen_ip: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = 1080)]
    pub port: u16,

    /// Seconds a client gets to send its request and have it answered
    #[arg(long = "handshake-timeout", default_value_t = HANDSHAKE_TIMEOUT.as_secs())]
    pub handshake_timeout_secs: u64,
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["socks4a"]).unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:1080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.handshake_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_overrides() {
        let config = Config::try_parse_from([
            "socks4a",
            "-i",
            "0.0.0.0",
            "-p",
            "9050",
            "--handshake-timeout",
            "30",
        ])
        .unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:9050".parse::<SocketAddr>().unwrap());
        assert_eq!(config.handshake_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_port() {
        assert!(Config::try_parse_from(["socks4a", "-p", "70000"]).is_err());
        assert!(Config::try_parse_from(["socks4a", "-i", "nowhere"]).is_err());
    }
}
