use std::net::{IpAddr, SocketAddr};

use http::header::HeaderName;
use http::HeaderMap;
use ipnet::IpNet;

use crate::config::{ClientAuthConfig, ConfigError};
use crate::error::ProxyError;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Shared-token gate, precomputed from config so the per-request check is a
/// single header lookup and compare.
#[derive(Debug, Clone)]
enum TokenGate {
    Disabled,
    Enabled { header: HeaderName, key: Box<str> },
}

/// Client authentication state, built once at startup.
///
/// Two independent gates checked in order: the IP allow-list (403 on miss)
/// and the shared token header (401 on miss). An empty allow-list and an
/// unset token key disable the respective gate.
#[derive(Debug, Clone)]
pub struct ClientAuth {
    ip_rules: Box<[IpNet]>,
    token: TokenGate,
}

impl ClientAuth {
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for unparseable allow-list entries
    /// or an invalid/missing token header name.
    pub fn from_config(config: &ClientAuthConfig) -> Result<Self, ConfigError> {
        let ip_rules = parse_ip_rules(&config.ip_whitelist)?;

        let token = match config.token_key.as_deref().map(str::trim) {
            None | Some("") => TokenGate::Disabled,
            Some(key) => {
                let header = config
                    .token_header
                    .as_deref()
                    .map(str::trim)
                    .filter(|header| !header.is_empty())
                    .ok_or_else(|| {
                        ConfigError::Validation(
                            "client_authentication.token_header is required when token_key is set"
                                .to_string(),
                        )
                    })?;
                let header = HeaderName::from_bytes(header.as_bytes()).map_err(|err| {
                    ConfigError::Validation(format!(
                        "client_authentication.token_header is not a valid header name: {err}"
                    ))
                })?;
                TokenGate::Enabled {
                    header,
                    key: key.into(),
                }
            }
        };

        Ok(Self { ip_rules, token })
    }

    /// # Errors
    ///
    /// [`ProxyError::IpNotAllowed`] when the allow-list is active and the
    /// client IP matches no rule; [`ProxyError::InvalidToken`] when the token
    /// gate is active and the header is missing or wrong.
    pub fn authorize(&self, client_ip: IpAddr, headers: &HeaderMap) -> Result<(), ProxyError> {
        if !self.ip_rules.is_empty() && !self.ip_rules.iter().any(|net| net.contains(&client_ip)) {
            return Err(ProxyError::IpNotAllowed);
        }

        if let TokenGate::Enabled { header, key } = &self.token {
            let presented = headers.get(header).and_then(|value| value.to_str().ok());
            if presented != Some(key.as_ref()) {
                return Err(ProxyError::InvalidToken);
            }
        }

        Ok(())
    }

    /// The configured token header, for stripping before upstream forwarding.
    #[must_use]
    pub fn token_header(&self) -> Option<&HeaderName> {
        match &self.token {
            TokenGate::Enabled { header, .. } => Some(header),
            TokenGate::Disabled => None,
        }
    }

    #[must_use]
    pub fn ip_gate_enabled(&self) -> bool {
        !self.ip_rules.is_empty()
    }

    #[must_use]
    pub fn ip_rule_count(&self) -> usize {
        self.ip_rules.len()
    }

    #[must_use]
    pub fn token_gate_enabled(&self) -> bool {
        matches!(self.token, TokenGate::Enabled { .. })
    }
}

fn parse_ip_rules(rules: &[String]) -> Result<Box<[IpNet]>, ConfigError> {
    let mut parsed = Vec::with_capacity(rules.len());
    for rule in rules {
        let rule = rule.trim();
        if rule.is_empty() {
            return Err(ConfigError::Validation(
                "client_authentication.ip_whitelist contains an empty entry".to_string(),
            ));
        }
        // A bare IP covers exactly that host.
        let net = if let Ok(net) = rule.parse::<IpNet>() {
            net
        } else if let Ok(addr) = rule.parse::<IpAddr>() {
            IpNet::from(addr)
        } else {
            return Err(ConfigError::Validation(format!(
                "client_authentication.ip_whitelist entry '{rule}' is not an IP or CIDR"
            )));
        };
        parsed.push(net);
    }
    Ok(parsed.into_boxed_slice())
}

/// Resolve the client IP for auth and access logging. The socket peer wins
/// unless forwarded headers are explicitly trusted.
#[must_use]
pub fn client_ip(
    remote_addr: SocketAddr,
    headers: &HeaderMap,
    trust_forwarded_headers: bool,
) -> IpAddr {
    if !trust_forwarded_headers {
        return remote_addr.ip();
    }
    parse_leftmost_forwarded_for(headers).unwrap_or_else(|| remote_addr.ip())
}

fn parse_leftmost_forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    let raw = headers.get(&X_FORWARDED_FOR)?.to_str().ok()?;
    let first = raw.split(',').next()?.trim();
    if first.is_empty() {
        return None;
    }
    if let Ok(ip) = first.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Ok(addr) = first.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientAuthConfig;

    fn auth_with(
        ip_whitelist: &[&str],
        token_header: Option<&str>,
        token_key: Option<&str>,
    ) -> ClientAuth {
        ClientAuth::from_config(&ClientAuthConfig {
            ip_whitelist: ip_whitelist.iter().map(ToString::to_string).collect(),
            token_header: token_header.map(ToString::to_string),
            token_key: token_key.map(ToString::to_string),
        })
        .expect("auth config")
    }

    fn ip(addr: &str) -> IpAddr {
        addr.parse().expect("ip literal")
    }

    #[test]
    fn test_disabled_gates_allow_everything() {
        let auth = auth_with(&[], None, None);
        assert!(!auth.ip_gate_enabled());
        assert!(!auth.token_gate_enabled());
        assert!(auth.authorize(ip("203.0.113.9"), &HeaderMap::new()).is_ok());
    }

    #[test]
    fn test_bare_ip_covers_exactly_that_host() {
        let auth = auth_with(&["127.0.0.1"], None, None);
        assert!(auth.authorize(ip("127.0.0.1"), &HeaderMap::new()).is_ok());
        assert!(matches!(
            auth.authorize(ip("127.0.0.2"), &HeaderMap::new()),
            Err(ProxyError::IpNotAllowed)
        ));
    }

    #[test]
    fn test_cidr_rule_matches_subnet() {
        let auth = auth_with(&["10.0.0.0/8"], None, None);
        assert!(auth.authorize(ip("10.42.0.7"), &HeaderMap::new()).is_ok());
        assert!(auth.authorize(ip("11.0.0.1"), &HeaderMap::new()).is_err());
    }

    #[test]
    fn test_ipv6_rules() {
        let auth = auth_with(&["::1", "fd00::/8"], None, None);
        assert!(auth.authorize(ip("::1"), &HeaderMap::new()).is_ok());
        assert!(auth.authorize(ip("fd00::17"), &HeaderMap::new()).is_ok());
        assert!(auth.authorize(ip("2001:db8::1"), &HeaderMap::new()).is_err());
    }

    #[test]
    fn test_token_gate() {
        let auth = auth_with(&[], Some("X-Api-Token"), Some("0123456789abcdef"));
        assert!(auth.token_gate_enabled());

        let mut headers = HeaderMap::new();
        assert!(matches!(
            auth.authorize(ip("127.0.0.1"), &headers),
            Err(ProxyError::InvalidToken)
        ));

        headers.insert("x-api-token", "wrong".parse().unwrap());
        assert!(auth.authorize(ip("127.0.0.1"), &headers).is_err());

        headers.insert("x-api-token", "0123456789abcdef".parse().unwrap());
        assert!(auth.authorize(ip("127.0.0.1"), &headers).is_ok());
    }

    #[test]
    fn test_ip_gate_checked_before_token() {
        let auth = auth_with(&["127.0.0.1"], Some("X-Api-Token"), Some("0123456789abcdef"));
        let headers = HeaderMap::new();
        assert!(matches!(
            auth.authorize(ip("198.51.100.1"), &headers),
            Err(ProxyError::IpNotAllowed)
        ));
    }

    #[test]
    fn test_token_without_header_name_rejected() {
        let result = ClientAuth::from_config(&ClientAuthConfig {
            ip_whitelist: vec![],
            token_header: None,
            token_key: Some("0123456789abcdef".to_string()),
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_whitelist_entry_rejected() {
        let result = ClientAuth::from_config(&ClientAuthConfig {
            ip_whitelist: vec!["example.com".to_string()],
            token_header: None,
            token_key: None,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_client_ip_ignores_forwarded_by_default() {
        let remote: SocketAddr = "192.0.2.10:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());

        assert_eq!(client_ip(remote, &headers, false), ip("192.0.2.10"));
        assert_eq!(client_ip(remote, &headers, true), ip("203.0.113.7"));
    }

    #[test]
    fn test_client_ip_falls_back_on_garbage_forwarded() {
        let remote: SocketAddr = "192.0.2.10:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "not-an-ip".parse().unwrap());
        assert_eq!(client_ip(remote, &headers, true), ip("192.0.2.10"));
    }
}
