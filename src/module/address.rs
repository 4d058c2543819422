//! Module Addresses
//!
//! `tcp://host:port` or `unix:///absolute/path`.

use crate::error::{Error, Result};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleAddress {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl ModuleAddress {
    pub fn parse(address: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidAddress(format!("{}: {}", address, reason));

        let (scheme, rest) = address
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;

        match scheme {
            "tcp" => {
                let (host, port) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| invalid("missing port"))?;
                let host = host.trim_start_matches('[').trim_end_matches(']');
                if host.is_empty() {
                    return Err(invalid("missing host"));
                }
                let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
                Ok(ModuleAddress::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            "unix" => {
                if !rest.starts_with('/') {
                    return Err(invalid("unix socket path must be absolute"));
                }
                Ok(ModuleAddress::Unix(PathBuf::from(rest)))
            }
            other => Err(invalid(&format!("unsupported scheme {}", other))),
        }
    }

    /// `host:port` for TCP addresses
    pub fn host_port(&self) -> Option<String> {
        match self {
            ModuleAddress::Tcp { host, port } if host.contains(':') => {
                Some(format!("[{}]:{}", host, port))
            }
            ModuleAddress::Tcp { host, port } => Some(format!("{}:{}", host, port)),
            ModuleAddress::Unix(_) => None,
        }
    }
}

impl fmt::Display for ModuleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleAddress::Tcp { .. } => {
                write!(f, "tcp://{}", self.host_port().unwrap_or_default())
            }
            ModuleAddress::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

impl std::str::FromStr for ModuleAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_tcp() {
        let address = ModuleAddress::parse("tcp://127.0.0.1:7979").unwrap();
        assert_eq!(
            address,
            ModuleAddress::Tcp {
                host: "127.0.0.1".into(),
                port: 7979
            }
        );
        assert_eq!(address.to_string(), "tcp://127.0.0.1:7979");
    }

    #[test]
    fn test_parse_ipv6() {
        let address = ModuleAddress::parse("tcp://[::1]:7980").unwrap();
        assert_eq!(address.host_port().as_deref(), Some("[::1]:7980"));
    }

    #[test]
    fn test_parse_unix() {
        let address = ModuleAddress::parse("unix:///run/docker/plugins/vo.sock").unwrap();
        assert_eq!(address, ModuleAddress::Unix("/run/docker/plugins/vo.sock".into()));
        assert_eq!(address.host_port(), None);
        assert_eq!(address.to_string(), "unix:///run/docker/plugins/vo.sock");
    }

    #[test]
    fn test_rejects_bad_addresses() {
        for bad in [
            "127.0.0.1:7979",
            "http://localhost:80",
            "tcp://localhost",
            "tcp://:80",
            "tcp://localhost:http",
            "unix://relative.sock",
        ] {
            assert_matches!(ModuleAddress::parse(bad), Err(Error::InvalidAddress(_)), "{}", bad);
        }
    }
}
