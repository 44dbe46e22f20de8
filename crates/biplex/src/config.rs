//! Peer configuration.

use std::str::FromStr;
use std::time::Duration;

use biplex_core::CodecRegistry;

use crate::error::ConfigError;

/// Transport network selector.
///
/// `Unixpacket` and `Quic` are carried for configuration compatibility but
/// rejected at dial/listen time; no QUIC stack is wired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
    Unixpacket,
    Quic,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
            Self::Unix => "unix",
            Self::Unixpacket => "unixpacket",
            Self::Quic => "quic",
        }
    }

    pub(crate) fn check_supported(self) -> Result<(), ConfigError> {
        match self {
            Self::Tcp | Self::Tcp4 | Self::Tcp6 | Self::Unix => Ok(()),
            Self::Unixpacket | Self::Quic => Err(ConfigError::UnsupportedNetwork(self.as_str())),
        }
    }
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "tcp4" => Ok(Self::Tcp4),
            "tcp6" => Ok(Self::Tcp6),
            "unix" => Ok(Self::Unix),
            "unixpacket" => Ok(Self::Unixpacket),
            "quic" => Ok(Self::Quic),
            other => Err(ConfigError::UnknownNetwork(other.to_owned())),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Peer-wide defaults and transport selection.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub network: Network,
    /// Bind IP for TCP networks, socket path for unix.
    pub listen_addr: String,
    /// Bind port for TCP networks; 0 lets the OS pick.
    pub listen_port: u16,
    /// Client dial deadline; zero means no deadline.
    pub default_dial_timeout: Duration,
    /// Sleep between redial attempts.
    pub redial_interval: Duration,
    /// Redial attempts after a disconnect; 0 disables redial, negative means
    /// unbounded.
    pub redial_times: i32,
    /// Maximum lifetime of an accepted session; zero means unlimited.
    pub default_session_age: Duration,
    /// Maximum lifetime of one CALL/PUSH handling context; zero means
    /// unlimited.
    pub default_context_age: Duration,
    /// Handlers slower than this are logged at WARN when `count_time` is on;
    /// zero disables the check.
    pub slow_comet_duration: Duration,
    /// Body codec name used when a message does not specify one.
    pub default_body_codec: String,
    /// Verbose wire logging of whole messages.
    pub print_detail: bool,
    /// Collect per-call timing.
    pub count_time: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            network: Network::Tcp,
            listen_addr: "0.0.0.0".to_owned(),
            listen_port: 9090,
            default_dial_timeout: Duration::ZERO,
            redial_interval: Duration::from_millis(100),
            redial_times: 0,
            default_session_age: Duration::ZERO,
            default_context_age: Duration::ZERO,
            slow_comet_duration: Duration::ZERO,
            default_body_codec: "json".to_owned(),
            print_detail: false,
            count_time: false,
        }
    }
}

impl PeerConfig {
    /// The address a listener binds to.
    pub fn listen_address(&self) -> String {
        match self.network {
            Network::Unix | Network::Unixpacket => self.listen_addr.clone(),
            _ => format!("{}:{}", self.listen_addr, self.listen_port),
        }
    }

    /// Resolve the default body codec against `codecs`.
    pub(crate) fn check(&self, codecs: &CodecRegistry) -> Result<u8, ConfigError> {
        let codec = codecs
            .get_by_name(&self.default_body_codec)
            .map_err(|_| ConfigError::UnknownBodyCodec(self.default_body_codec.clone()))?;
        Ok(codec.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_parse_roundtrip() {
        for name in ["tcp", "tcp4", "tcp6", "unix", "unixpacket", "quic"] {
            assert_eq!(name.parse::<Network>().unwrap().as_str(), name);
        }
        assert!("udp".parse::<Network>().is_err());
    }

    #[test]
    fn unsupported_networks_are_flagged() {
        assert!(Network::Tcp.check_supported().is_ok());
        assert!(Network::Unix.check_supported().is_ok());
        assert!(Network::Quic.check_supported().is_err());
        assert!(Network::Unixpacket.check_supported().is_err());
    }

    #[test]
    fn default_codec_resolves() {
        let cfg = PeerConfig::default();
        let id = cfg.check(&CodecRegistry::with_defaults()).unwrap();
        assert_eq!(id, biplex_core::codec::JSON_CODEC_ID);
    }

    #[test]
    fn unknown_codec_is_rejected() {
        let cfg = PeerConfig {
            default_body_codec: "capnp".into(),
            ..PeerConfig::default()
        };
        assert!(matches!(
            cfg.check(&CodecRegistry::with_defaults()),
            Err(ConfigError::UnknownBodyCodec(_))
        ));
    }

    #[test]
    fn listen_address_shape() {
        let cfg = PeerConfig {
            listen_addr: "127.0.0.1".into(),
            listen_port: 9000,
            ..PeerConfig::default()
        };
        assert_eq!(cfg.listen_address(), "127.0.0.1:9000");

        let unix = PeerConfig {
            network: Network::Unix,
            listen_addr: "/tmp/biplex.sock".into(),
            ..PeerConfig::default()
        };
        assert_eq!(unix.listen_address(), "/tmp/biplex.sock");
    }
}
