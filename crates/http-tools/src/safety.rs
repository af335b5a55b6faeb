//! Outbound HTTP safety controls (SSRF protection, limits, redaction).
//!
//! The loader and the dispatcher both route every outbound URL through an
//! [`OutboundHttpSafety`] policy. The policy is plain data; the gateway builds it from config.

use serde::Deserialize;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::lookup_host;
use url::Url;

const MAX_REDIRECT_HOPS: usize = 10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SafetyError {
    #[error("outbound HTTP blocked: {0}")]
    Blocked(String),

    #[error("DNS lookup failed for host '{host}': {message}")]
    Dns { host: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectPolicy {
    /// Do not follow redirects.
    None,
    /// Follow redirects, but re-check the destination URL on each hop.
    Checked,
}

#[derive(Debug, Clone)]
pub struct OutboundHttpSafety {
    /// If set, only these hosts are allowed (case-insensitive).
    pub allowed_hosts: Option<HashSet<String>>,
    /// If true, allow private/loopback/link-local/reserved destination IPs.
    pub allow_private_networks: bool,
    /// Maximum response body size (bytes). `None` = unlimited.
    pub max_response_bytes: Option<usize>,
    pub redirects: RedirectPolicy,
}

/// Serializable form of [`OutboundHttpSafety`], as it appears in the gateway config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SafetyConfig {
    pub allow_private_networks: bool,
    pub allowed_hosts: Vec<String>,
    pub max_response_bytes: Option<usize>,
    pub follow_redirects: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            allow_private_networks: true,
            allowed_hosts: Vec::new(),
            max_response_bytes: Some(10 * 1024 * 1024),
            follow_redirects: true,
        }
    }
}

impl From<&SafetyConfig> for OutboundHttpSafety {
    fn from(cfg: &SafetyConfig) -> Self {
        let allowed_hosts: HashSet<String> = cfg
            .allowed_hosts
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        Self {
            allowed_hosts: (!allowed_hosts.is_empty()).then_some(allowed_hosts),
            allow_private_networks: cfg.allow_private_networks,
            max_response_bytes: cfg.max_response_bytes,
            redirects: if cfg.follow_redirects {
                RedirectPolicy::Checked
            } else {
                RedirectPolicy::None
            },
        }
    }
}

impl Default for OutboundHttpSafety {
    fn default() -> Self {
        Self::from(&SafetyConfig::default())
    }
}

impl OutboundHttpSafety {
    /// Most permissive policy: any host, private networks allowed, no size limit.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            allowed_hosts: None,
            allow_private_networks: true,
            max_response_bytes: None,
            redirects: RedirectPolicy::Checked,
        }
    }

    /// Policy for deployments that mount APIs from untrusted spec sources.
    #[must_use]
    pub fn restrictive() -> Self {
        Self {
            allowed_hosts: None,
            allow_private_networks: false,
            max_response_bytes: Some(1024 * 1024),
            redirects: RedirectPolicy::None,
        }
    }

    /// Validate a URL before making an outbound request.
    ///
    /// This rejects non-`http(s)` schemes and applies host/IP restrictions.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is disallowed by the policy (unsupported scheme, host not in
    /// allowlist, or hostname resolves to a disallowed IP range).
    pub async fn check_url(&self, url: &Url) -> Result<(), SafetyError> {
        let host = self.check_static(url)?;
        if self.allow_private_networks || host.parse::<IpAddr>().is_ok() {
            return Ok(());
        }

        let port = url.port_or_known_default().unwrap_or(443);
        let addrs = lookup_host((host.as_str(), port))
            .await
            .map_err(|e| SafetyError::Dns {
                host: host.clone(),
                message: e.to_string(),
            })?;

        let mut saw_any = false;
        for addr in addrs {
            saw_any = true;
            if is_denied_ip(addr.ip()) {
                return Err(SafetyError::Blocked(format!(
                    "host '{host}' resolved to disallowed IP '{}'",
                    addr.ip()
                )));
            }
        }

        if !saw_any {
            return Err(SafetyError::Dns {
                host,
                message: "no addresses returned".to_string(),
            });
        }

        Ok(())
    }

    /// Checks that need no DNS: scheme, allowlist, IP literals. Returns the host on success.
    fn check_static(&self, url: &Url) -> Result<String, SafetyError> {
        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(SafetyError::Blocked(format!(
                "unsupported URL scheme '{scheme}'"
            )));
        }

        let Some(host) = url.host_str() else {
            return Err(SafetyError::Blocked("missing URL host".to_string()));
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');

        if let Some(allowed) = &self.allowed_hosts
            && !allowed.contains(&host.to_ascii_lowercase())
        {
            return Err(SafetyError::Blocked(format!(
                "host '{host}' not in allowlist"
            )));
        }

        if !self.allow_private_networks
            && let Ok(ip) = host.parse::<IpAddr>()
            && is_denied_ip(ip)
        {
            return Err(SafetyError::Blocked(format!(
                "destination IP '{ip}' is not allowed"
            )));
        }

        Ok(host.to_string())
    }

    /// Build the shared HTTP client for this policy.
    ///
    /// Redirect hops are re-checked against the scheme, allowlist and IP-literal rules.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying TLS backend cannot be initialized.
    pub fn build_client(&self, connect_timeout: Duration) -> reqwest::Result<reqwest::Client> {
        let redirect = match self.redirects {
            RedirectPolicy::None => reqwest::redirect::Policy::none(),
            RedirectPolicy::Checked => {
                let policy = self.clone();
                reqwest::redirect::Policy::custom(move |attempt| {
                    if attempt.previous().len() >= MAX_REDIRECT_HOPS {
                        return attempt.error(SafetyError::Blocked("too many redirects".into()));
                    }
                    match policy.check_static(attempt.url()) {
                        Ok(_) => attempt.follow(),
                        Err(e) => {
                            tracing::warn!(url = %redact_url(attempt.url()), error = %e, "redirect blocked");
                            attempt.error(e)
                        }
                    }
                })
            }
        };

        reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(redirect)
            .build()
    }
}

#[must_use]
pub fn redact_url(url: &Url) -> String {
    let mut u = url.clone();
    let _ = u.set_username("");
    let _ = u.set_password(None);
    u.set_query(None);
    u.set_fragment(None);
    u.to_string()
}

/// Render a `reqwest` error without leaking credentials or query strings of the target URL.
#[must_use]
pub fn sanitize_reqwest_error(e: &reqwest::Error) -> String {
    let mut msg = e.to_string();
    if let Some(u) = e.url() {
        msg = msg.replace(u.as_str(), &redact_url(u));
    }
    msg
}

fn is_denied_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_denied_ipv4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_denied_ipv4(v4),
            None => is_denied_ipv6(v6),
        },
    }
}

fn is_denied_ipv4(ip: Ipv4Addr) -> bool {
    if ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
    {
        return true;
    }

    let oct = ip.octets();
    // CGNAT 100.64.0.0/10
    if oct[0] == 100 && (64..=127).contains(&oct[1]) {
        return true;
    }

    oct[0] >= 240
}

fn is_denied_ipv6(ip: Ipv6Addr) -> bool {
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || ip.is_unique_local()
        || ip.is_unicast_link_local()
}
