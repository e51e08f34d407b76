//! Remote device address.

use std::fmt;

use crate::error::{TermError, TermResult};

/// Host and TCP port of the remote device.
///
/// Only constructed through [`Endpoint::new`] or [`Endpoint::parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Build an endpoint, rejecting an empty host or port 0.
    pub fn new(host: impl Into<String>, port: u16) -> TermResult<Self> {
        let host = host.into().trim().to_string();
        if host.is_empty() {
            return Err(TermError::InvalidEndpoint("empty host".into()));
        }
        if port == 0 {
            return Err(TermError::InvalidEndpoint(format!(
                "port must be in 1-65535 (host {host})"
            )));
        }
        Ok(Self { host, port })
    }

    /// Parse `host`, `host:port` or `[v6addr]:port`.
    ///
    /// A bare host takes `default_port`.
    pub fn parse(target: &str, default_port: u16) -> TermResult<Self> {
        let target = target.trim();

        if let Some(rest) = target.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| TermError::InvalidEndpoint(format!("unclosed '[' in {target}")))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => parse_port(p, target)?,
                None if tail.is_empty() => default_port,
                None => {
                    return Err(TermError::InvalidEndpoint(format!(
                        "unexpected text after address in {target}"
                    )))
                }
            };
            return Self::new(host, port);
        }

        match target.rsplit_once(':') {
            // More than one colon without brackets: a bare IPv6 address.
            Some((host, _)) if host.contains(':') => Self::new(target, default_port),
            Some((host, port)) => Self::new(host, parse_port(port, target)?),
            None => Self::new(target, default_port),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

fn parse_port(port: &str, target: &str) -> TermResult<u16> {
    port.parse::<u16>()
        .map_err(|_| TermError::InvalidEndpoint(format!("bad port '{port}' in {target}")))
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_and_port() {
        let ep = Endpoint::parse("192.168.4.1:8080", 23).unwrap();
        assert_eq!(ep.host(), "192.168.4.1");
        assert_eq!(ep.port(), 8080);
        assert_eq!(ep.to_string(), "192.168.4.1:8080");
    }

    #[test]
    fn parse_bare_host_uses_default() {
        let ep = Endpoint::parse("esp32.local", 23).unwrap();
        assert_eq!(ep.port(), 23);
    }

    #[test]
    fn parse_bracketed_v6() {
        let ep = Endpoint::parse("[::1]:2323", 23).unwrap();
        assert_eq!(ep.host(), "::1");
        assert_eq!(ep.port(), 2323);
        assert_eq!(ep.to_string(), "[::1]:2323");

        let bare = Endpoint::parse("fe80::1", 23).unwrap();
        assert_eq!(bare.host(), "fe80::1");
        assert_eq!(bare.port(), 23);
    }

    #[test]
    fn reject_port_zero() {
        assert!(matches!(
            Endpoint::new("10.0.0.1", 0),
            Err(TermError::InvalidEndpoint(_))
        ));
        assert!(Endpoint::parse("10.0.0.1:0", 23).is_err());
    }

    #[test]
    fn reject_bad_input() {
        assert!(Endpoint::parse("", 23).is_err());
        assert!(Endpoint::parse(":23", 23).is_err());
        assert!(Endpoint::parse("host:99999", 23).is_err());
        assert!(Endpoint::parse("host:abc", 23).is_err());
        assert!(Endpoint::parse("[::1", 23).is_err());
    }
}
