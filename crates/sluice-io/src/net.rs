//! Listener address parsing shared by the socket, proxy, syslog and HTTP
//! consumers.

use std::path::PathBuf;

use sluice_core::SluiceError;

/// A parsed listener endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Udp(String),
    Unix(PathBuf),
}

/// Parse `[host]:port`, `tcp://...`, `udp://...` or `unix:///path`.
///
/// Bare addresses carry no protocol; `prefer_tcp` decides (the socket
/// consumer passes true when an acknowledge response is configured, the
/// proxy always does).
pub fn parse_endpoint(address: &str, prefer_tcp: bool) -> Result<Endpoint, SluiceError> {
    if let Some(path) = address.strip_prefix("unix://") {
        if path.is_empty() {
            return Err(SluiceError::Config(format!(
                "unix address {address:?} has no path"
            )));
        }
        return Ok(Endpoint::Unix(PathBuf::from(path)));
    }
    if let Some(rest) = address.strip_prefix("tcp://") {
        return Ok(Endpoint::Tcp(normalize_host(rest)?));
    }
    if let Some(rest) = address.strip_prefix("udp://") {
        return Ok(Endpoint::Udp(normalize_host(rest)?));
    }
    let host = normalize_host(address)?;
    if prefer_tcp {
        Ok(Endpoint::Tcp(host))
    } else {
        Ok(Endpoint::Udp(host))
    }
}

/// `:port` binds every interface.
pub fn normalize_host(addr: &str) -> Result<String, SluiceError> {
    if addr.is_empty() {
        return Err(SluiceError::Config("empty listener address".to_string()));
    }
    if !addr.contains(':') {
        return Err(SluiceError::Config(format!(
            "listener address {addr:?} has no port"
        )));
    }
    if let Some(port) = addr.strip_prefix(':') {
        Ok(format!("0.0.0.0:{port}"))
    } else {
        Ok(addr.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schemes_pin_the_protocol() {
        assert_eq!(
            parse_endpoint("tcp://127.0.0.1:5880", false).unwrap(),
            Endpoint::Tcp("127.0.0.1:5880".into())
        );
        assert_eq!(
            parse_endpoint("udp://:514", true).unwrap(),
            Endpoint::Udp("0.0.0.0:514".into())
        );
        assert_eq!(
            parse_endpoint("unix:///tmp/sluice.sock", false).unwrap(),
            Endpoint::Unix("/tmp/sluice.sock".into())
        );
    }

    #[test]
    fn bare_addresses_follow_the_ack_rule() {
        assert_eq!(
            parse_endpoint(":5880", true).unwrap(),
            Endpoint::Tcp("0.0.0.0:5880".into())
        );
        assert_eq!(
            parse_endpoint("0.0.0.0:5880", false).unwrap(),
            Endpoint::Udp("0.0.0.0:5880".into())
        );
    }

    #[test]
    fn bad_addresses_are_config_errors() {
        assert!(parse_endpoint("", false).is_err());
        assert!(parse_endpoint("unix://", false).is_err());
        assert!(parse_endpoint("localhost", false).is_err());
    }
}
