//! Normalize user supplied host addresses.
//!
//! Whatever a user enters (bare IP, hostname, full URL), the inventory only
//! ever stores the canonical `scheme://host:port` form, with the default API
//! port of the node type attached when none was given.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use pulse_api_types::NodeType;

/// Why a host failed normalization.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostError {
    InvalidHostFormat,
    InvalidIpAddress,
    InvalidIpv6Address,
    InvalidHostname,
    InvalidPortNumber,
}

impl HostError {
    /// Stable identifier used in API error messages.
    pub fn code(&self) -> &'static str {
        match self {
            HostError::InvalidHostFormat => "invalid_host_format",
            HostError::InvalidIpAddress => "invalid_ip_address",
            HostError::InvalidIpv6Address => "invalid_ipv6_address",
            HostError::InvalidHostname => "invalid_hostname",
            HostError::InvalidPortNumber => "invalid_port_number",
        }
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl std::error::Error for HostError {}

const FORBIDDEN_HOSTNAME_CHARS: &[char] = &['/', '\\', '<', '>', '|', '"', '\'', '`', ';'];

/// Normalize `input` into `scheme://host:port` for the given node type.
pub fn normalize_host(input: &str, ty: NodeType) -> Result<String, HostError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(HostError::InvalidHostFormat);
    }

    let (scheme, rest) = match input.split_once("://") {
        Some(("http", rest)) => ("http", rest),
        Some(("https", rest)) => ("https", rest),
        Some(_) => return Err(HostError::InvalidHostFormat),
        None => ("https", input),
    };

    // strip path, query and fragment
    let authority = rest
        .split(['/', '?', '#'])
        .next()
        .ok_or(HostError::InvalidHostFormat)?;
    if authority.is_empty() {
        return Err(HostError::InvalidHostFormat);
    }

    let (raw_host, raw_port) = split_authority(authority)?;

    let host = validate_host(raw_host)?;

    let port = match raw_port {
        Some(port) => match port.parse::<u16>() {
            Ok(port) if port > 0 => port,
            _ => return Err(HostError::InvalidPortNumber),
        },
        None => ty.default_port(),
    };

    Ok(format!("{scheme}://{host}:{port}"))
}

/// Split an authority into host and optional port.
fn split_authority(authority: &str) -> Result<(&str, Option<&str>), HostError> {
    if let Some(rest) = authority.strip_prefix('[') {
        // bracketed IPv6, optionally followed by :port
        let (host, after) = rest
            .split_once(']')
            .ok_or(HostError::InvalidIpv6Address)?;
        match after {
            "" => Ok((host, None)),
            port => Ok((host, Some(port.strip_prefix(':').ok_or(HostError::InvalidHostFormat)?))),
        }
    } else if authority.matches(':').count() > 1 {
        // bare IPv6 literal without brackets, cannot carry a port
        Ok((authority, None))
    } else {
        match authority.split_once(':') {
            Some((host, port)) => Ok((host, Some(port))),
            None => Ok((authority, None)),
        }
    }
}

/// Validate a host and return it in its canonical (IPv6: bracketed) form.
fn validate_host(host: &str) -> Result<String, HostError> {
    if host.is_empty() {
        return Err(HostError::InvalidHostFormat);
    }

    if host.contains(':') {
        return match host.parse::<Ipv6Addr>() {
            Ok(addr) => Ok(format!("[{addr}]")),
            Err(_) => Err(HostError::InvalidIpv6Address),
        };
    }

    if host.starts_with(|c: char| c.is_ascii_digit()) {
        // looks like an IP, so it has to be one
        return match host.parse::<Ipv4Addr>() {
            Ok(addr) => Ok(addr.to_string()),
            Err(_) => Err(HostError::InvalidIpAddress),
        };
    }

    if host.contains(char::is_whitespace) || host.contains(FORBIDDEN_HOSTNAME_CHARS) {
        return Err(HostError::InvalidHostname);
    }

    Ok(host.to_string())
}

/// Extract the bare host (no scheme, no port, no brackets) from a normalized URL.
pub fn host_part(normalized: &str) -> &str {
    let rest = normalized
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(normalized);

    if let Some(rest) = rest.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else {
        rest.split(':').next().unwrap_or(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_ip_gets_scheme_and_port() {
        assert_eq!(
            normalize_host("10.1.1.5", NodeType::Pve).unwrap(),
            "https://10.1.1.5:8006"
        );
        assert_eq!(
            normalize_host("10.1.1.10", NodeType::Pbs).unwrap(),
            "https://10.1.1.10:8007"
        );
        assert_eq!(
            normalize_host("mail.example.com", NodeType::Pmg).unwrap(),
            "https://mail.example.com:8006"
        );
    }

    #[test]
    fn explicit_parts_are_kept() {
        assert_eq!(
            normalize_host("http://pve1:8443", NodeType::Pve).unwrap(),
            "http://pve1:8443"
        );
        assert_eq!(
            normalize_host("https://10.1.1.5:8006/some/path?x=1#frag", NodeType::Pve).unwrap(),
            "https://10.1.1.5:8006"
        );
    }

    #[test]
    fn ipv6_is_bracketed() {
        assert_eq!(
            normalize_host("fd00::5", NodeType::Pve).unwrap(),
            "https://[fd00::5]:8006"
        );
        assert_eq!(
            normalize_host("[fd00::5]:9000", NodeType::Pbs).unwrap(),
            "https://[fd00::5]:9000"
        );
        assert_eq!(
            normalize_host("fd00::zz", NodeType::Pve),
            Err(HostError::InvalidIpv6Address)
        );
    }

    #[test]
    fn strict_ip_validation() {
        assert_eq!(
            normalize_host("10.1.1.300", NodeType::Pve),
            Err(HostError::InvalidIpAddress)
        );
        assert_eq!(
            normalize_host("1host", NodeType::Pve),
            Err(HostError::InvalidIpAddress)
        );
    }

    #[test]
    fn forbidden_hostname_characters() {
        for host in ["bad host", "bad;host", "bad`host", "bad|host", "bad\"host"] {
            assert_eq!(
                normalize_host(host, NodeType::Pve),
                Err(HostError::InvalidHostname),
                "{host:?} should be rejected"
            );
        }
    }

    #[test]
    fn port_bounds() {
        assert_eq!(
            normalize_host("pve1:0", NodeType::Pve),
            Err(HostError::InvalidPortNumber)
        );
        assert_eq!(
            normalize_host("pve1:65536", NodeType::Pve),
            Err(HostError::InvalidPortNumber)
        );
        assert_eq!(
            normalize_host("pve1:notaport", NodeType::Pve),
            Err(HostError::InvalidPortNumber)
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        for (input, ty) in [
            ("10.1.1.5", NodeType::Pve),
            ("backup.example.com", NodeType::Pbs),
            ("fd00::5", NodeType::Pve),
            ("http://pve1:8443", NodeType::Pve),
        ] {
            let once = normalize_host(input, ty).unwrap();
            let twice = normalize_host(&once, ty).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn host_part_extraction() {
        assert_eq!(host_part("https://10.1.1.5:8006"), "10.1.1.5");
        assert_eq!(host_part("https://[fd00::5]:8006"), "fd00::5");
        assert_eq!(host_part("pve1"), "pve1");
    }
}
