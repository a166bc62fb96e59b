// SPDX-License-Identifier: MIT OR Apache-2.0
//! Outbound URL validation: scheme, domain allowlist, address ranges, and
//! DNS-rebinding detection.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::net::IpAddr;
use tracing::warn;
use url::Url;

/// A guard rejection, carrying the stable code reported in results.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardViolation {
    /// The target host is on no allowlist, or the URL is unusable.
    #[error("domain not allowed: {0}")]
    DomainNotAllowed(String),
    /// A resolved address fell in a forbidden range, or the scheme is not
    /// plain http(s).
    #[error("blocked outbound target: {0}")]
    SsrfBlocked(String),
    /// The resolved address set changed between validation and dispatch.
    #[error("dns resolution drifted between validation and dispatch")]
    DnsDrift,
}

impl GuardViolation {
    /// Stable code for results and audit records.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::DomainNotAllowed(_) => "DOMAIN_NOT_ALLOWED",
            Self::SsrfBlocked(_) => "SSRF_BLOCKED",
            Self::DnsDrift => "SSRF_DNS_DRIFT",
        }
    }
}

/// DNS resolution seam. The system resolver is the default; tests inject
/// scripted resolvers to exercise rebinding.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// All addresses for `host:port`.
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<BTreeSet<IpAddr>>;
}

/// Resolver backed by the operating system.
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<BTreeSet<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// A URL that passed validation, pinned to the addresses seen then.
#[derive(Debug, Clone)]
pub struct ValidatedUrl {
    /// The parsed target.
    pub url: Url,
    /// Hostname used for the allowlist match.
    pub host: String,
    /// Effective port.
    pub port: u16,
    /// Addresses resolved at validation time.
    pub ips: BTreeSet<IpAddr>,
}

/// Guard settings shared by the http and webhook connectors.
#[derive(Debug, Clone, Default)]
pub struct GuardSettings {
    /// Domains allowed for every tool, unioned with per-tool lists.
    pub global_allowed_domains: Vec<String>,
    /// Admit loopback and private ranges. Local development only; leave off
    /// everywhere else.
    pub allow_private_networks: bool,
}

/// Validate `raw` against the allowlists and address rules.
///
/// # Errors
///
/// Returns the specific [`GuardViolation`].
pub async fn validate_url(
    raw: &str,
    tool_domains: &[String],
    settings: &GuardSettings,
    resolver: &dyn Resolver,
) -> Result<ValidatedUrl, GuardViolation> {
    let url = Url::parse(raw).map_err(|e| GuardViolation::DomainNotAllowed(format!("unparseable url: {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(GuardViolation::SsrfBlocked(format!(
                "scheme '{other}' not permitted"
            )));
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| GuardViolation::DomainNotAllowed("url has no host".into()))?
        .trim_end_matches('.')
        .to_ascii_lowercase();
    let port = url.port_or_known_default().unwrap_or(443);

    // Deny by default: an empty combined allowlist admits nothing.
    let mut allowed: Vec<&str> = tool_domains.iter().map(String::as_str).collect();
    allowed.extend(settings.global_allowed_domains.iter().map(String::as_str));
    if allowed.is_empty() {
        return Err(GuardViolation::DomainNotAllowed(
            "no domains are allowlisted for this tool".into(),
        ));
    }
    if !allowed.iter().any(|candidate| domain_matches(&host, candidate)) {
        warn!(host = %host, "outbound domain rejected");
        return Err(GuardViolation::DomainNotAllowed(format!(
            "host '{host}' is not allowlisted"
        )));
    }

    let ips = resolver
        .resolve(&host, port)
        .await
        .map_err(|e| GuardViolation::SsrfBlocked(format!("resolution failed: {e}")))?;
    if ips.is_empty() {
        return Err(GuardViolation::SsrfBlocked(format!(
            "host '{host}' resolved to no addresses"
        )));
    }
    if !settings.allow_private_networks {
        if let Some(bad) = ips.iter().find(|ip| ip_blocked(**ip)) {
            warn!(host = %host, ip = %bad, "outbound address in forbidden range");
            return Err(GuardViolation::SsrfBlocked(format!(
                "host '{host}' resolves into a forbidden range"
            )));
        }
    }

    Ok(ValidatedUrl {
        url,
        host,
        port,
        ips,
    })
}

/// Re-resolve immediately before dispatch and compare with the validated
/// set. Any difference is treated as a rebinding attempt.
///
/// # Errors
///
/// [`GuardViolation::DnsDrift`] on any difference, [`GuardViolation::SsrfBlocked`]
/// when re-resolution fails outright.
pub async fn recheck(
    validated: &ValidatedUrl,
    resolver: &dyn Resolver,
) -> Result<(), GuardViolation> {
    let now = resolver
        .resolve(&validated.host, validated.port)
        .await
        .map_err(|e| GuardViolation::SsrfBlocked(format!("re-resolution failed: {e}")))?;
    if now != validated.ips {
        warn!(host = %validated.host, "dns drift detected before dispatch");
        return Err(GuardViolation::DnsDrift);
    }
    Ok(())
}

/// Exact match, or `host` is a dot-delimited subdomain of `candidate`.
/// A bare suffix match is not enough: `evilexample.com` must not pass for
/// `example.com`.
#[must_use]
pub fn domain_matches(host: &str, candidate: &str) -> bool {
    let candidate = candidate.trim_end_matches('.').to_ascii_lowercase();
    if candidate.is_empty() {
        return false;
    }
    host == candidate || host.ends_with(&format!(".{candidate}"))
}

/// Forbidden destination ranges: loopback, link-local, private, ULA,
/// unspecified, and broadcast.
#[must_use]
pub fn ip_blocked(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_link_local()
                || v4.is_private()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return ip_blocked(IpAddr::V4(mapped));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                // Unique local addresses, fc00::/7.
                || (first & 0xfe00) == 0xfc00
                // Link-local, fe80::/10.
                || (first & 0xffc0) == 0xfe80
        }
    }
}
