use std::{
    net::{Ipv4Addr, SocketAddr},
    str::FromStr,
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Front socket bind address; clients point their NatNeg server override
    /// here.
    pub bind_addr: SocketAddr,

    /// Upstream rendezvous server.
    pub server_host: String,
    pub server_port: u16,

    /// Inactivity window after which a session destroys itself.
    pub session_timeout: Duration,

    /// Receive buffer per socket. NatNeg itself fits in far less, but relayed
    /// game datagrams can approach a full MTU.
    pub recv_buffer_len: usize,

    /// Command-queue depth per session. The dispatcher never blocks on a
    /// session; datagrams beyond this are dropped.
    pub session_queue_len: usize,

    /// Static public IPv4. When unset the public address is discovered
    /// periodically over HTTP.
    pub public_ip: Option<Ipv4Addr>,
    pub public_ip_url: String,
    pub public_ip_refresh: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 27901)),
            server_host: "natneg.server.cnc-online.net".to_string(),
            server_port: 27901,
            session_timeout: Duration::from_secs(60),
            recv_buffer_len: 2048,
            session_queue_len: 64,
            public_ip: None,
            public_ip_url: "https://api.ipify.org".to_string(),
            public_ip_refresh: Duration::from_secs(60),
        }
    }
}

impl ProxyConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let bind_addr = std::env::var("NATNEG_LISTEN_ADDR")
            .ok()
            .and_then(|v| SocketAddr::from_str(&v).ok())
            .unwrap_or(defaults.bind_addr);

        let server_host = std::env::var("NATNEG_SERVER_HOST")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.server_host);

        let server_port = std::env::var("NATNEG_SERVER_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(defaults.server_port);

        let session_timeout = std::env::var("NATNEG_SESSION_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.session_timeout);

        let recv_buffer_len = std::env::var("NATNEG_RECV_BUFFER_LEN")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v >= 1024)
            .unwrap_or(defaults.recv_buffer_len);

        let session_queue_len = std::env::var("NATNEG_SESSION_QUEUE_LEN")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(defaults.session_queue_len);

        let public_ip = std::env::var("NATNEG_PUBLIC_IP")
            .ok()
            .and_then(|v| Ipv4Addr::from_str(v.trim()).ok());

        let public_ip_url = std::env::var("NATNEG_PUBLIC_IP_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.public_ip_url);

        let public_ip_refresh = std::env::var("NATNEG_PUBLIC_IP_REFRESH_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.public_ip_refresh);

        Self {
            bind_addr,
            server_host,
            server_port,
            session_timeout,
            recv_buffer_len,
            session_queue_len,
            public_ip,
            public_ip_url,
            public_ip_refresh,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_legacy_deployment() {
        let cfg = ProxyConfig::default();
        assert_eq!(cfg.bind_addr, SocketAddr::from(([0, 0, 0, 0], 27901)));
        assert_eq!(cfg.server_host, "natneg.server.cnc-online.net");
        assert_eq!(cfg.server_port, 27901);
        assert_eq!(cfg.session_timeout, Duration::from_secs(60));
        assert!(cfg.recv_buffer_len >= 1500);
        assert!(cfg.public_ip.is_none());
    }
}
