use std::io::Read;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use anyhow::{anyhow, Result};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::HttpConfig;

const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("private or reserved address blocked for host {host}: {ip}")]
    PrivateAddressBlocked { host: String, ip: IpAddr },
    #[error("redirect from {from} to unrelated host {to}")]
    RedirectBlocked { from: String, to: String },
    #[error("download of {url} reached the byte cap ({cap} bytes)")]
    ByteCapExceeded { url: String, cap: u64 },
    #[error("empty response from {url}")]
    EmptyResponse { url: String },
}

/// Response payload plus the headers downstream callers care about.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub data: Vec<u8>,
    pub content_disposition: Option<String>,
    pub content_type: Option<String>,
    pub final_url: String,
}

/// Blocking HTTP client with SSRF guards: hostnames are resolved up front
/// and private/reserved addresses are rejected unless allow-listed;
/// redirects are followed manually and only toward related hosts.
pub struct SafeHttpClient {
    agent: ureq::Agent,
    timeout: Duration,
    retries: u32,
    allowed_redirect_suffixes: Vec<String>,
    allow_hosts: Vec<String>,
}

impl SafeHttpClient {
    pub fn from_config(cfg: &HttpConfig) -> Self {
        Self::new(
            Duration::from_secs(cfg.timeout_secs.max(1)),
            cfg.retries,
            cfg.allowed_redirect_suffixes.clone(),
            cfg.allow_hosts.clone(),
            &cfg.user_agent,
        )
    }

    pub fn new(
        timeout: Duration,
        retries: u32,
        allowed_redirect_suffixes: Vec<String>,
        allow_hosts: Vec<String>,
        user_agent: &str,
    ) -> Self {
        let resolver_allow = allow_hosts.clone();
        let agent = ureq::AgentBuilder::new()
            .redirects(0)
            .timeout(timeout)
            .user_agent(user_agent)
            .resolver(move |netloc: &str| -> std::io::Result<Vec<SocketAddr>> {
                let host = host_of_netloc(netloc);
                let addrs: Vec<SocketAddr> = netloc.to_socket_addrs()?.collect();
                if host_allow_listed(&resolver_allow, &host) {
                    return Ok(addrs);
                }
                for addr in &addrs {
                    if is_private_or_reserved(&addr.ip()) {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::PermissionDenied,
                            HttpError::PrivateAddressBlocked {
                                host: host.clone(),
                                ip: addr.ip(),
                            }
                            .to_string(),
                        ));
                    }
                }
                Ok(addrs)
            })
            .build();
        Self {
            agent,
            timeout,
            retries,
            allowed_redirect_suffixes,
            allow_hosts,
        }
    }

    /// Resolve a hostname and reject private/reserved addresses.
    pub fn resolve_ips(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs: Vec<IpAddr> = (host, 0u16)
            .to_socket_addrs()
            .map_err(|e| anyhow!("failed to resolve {host}: {e}"))?
            .map(|a| a.ip())
            .collect();
        if host_allow_listed(&self.allow_hosts, host) {
            return Ok(addrs);
        }
        for ip in &addrs {
            if is_private_or_reserved(ip) {
                return Err(HttpError::PrivateAddressBlocked {
                    host: host.to_string(),
                    ip: *ip,
                }
                .into());
            }
        }
        Ok(addrs)
    }

    /// Whether a redirect from `src` to `dest` stays on a related host.
    pub fn hosts_related(&self, src: &str, dest: &str) -> bool {
        hosts_share_suffix(src, dest)
            || self
                .allowed_redirect_suffixes
                .iter()
                .any(|suffix| host_matches_suffix(dest, suffix))
    }

    /// GET `url` into memory with a hard byte cap, retrying with
    /// exponential backoff (2^attempt seconds) on failure.
    pub fn get_bytes(&self, url: &str, max_bytes: u64) -> Result<FetchedBody> {
        let mut attempt: u32 = 0;
        loop {
            match self.get_bytes_once(url, max_bytes) {
                Ok(body) => return Ok(body),
                Err(e) => {
                    if attempt >= self.retries {
                        return Err(e.context(format!("failed to download {url}")));
                    }
                    debug!("retrying {} after error: {}", url, e);
                    std::thread::sleep(Duration::from_secs(1u64 << attempt.min(6)));
                    attempt += 1;
                }
            }
        }
    }

    fn get_bytes_once(&self, url: &str, max_bytes: u64) -> Result<FetchedBody> {
        let mut current = Url::parse(url)?;
        let origin_host = current
            .host_str()
            .ok_or_else(|| anyhow!("url has no host: {url}"))?
            .to_string();

        for _ in 0..=MAX_REDIRECTS {
            let resp = match self.agent.get(current.as_str()).set("Accept", "*/*").call() {
                Ok(resp) => resp,
                Err(ureq::Error::Status(code, _)) => {
                    return Err(anyhow!("HTTP status {code} for {current}"));
                }
                Err(e) => return Err(anyhow!("request failed for {current}: {e}")),
            };

            if (300..400).contains(&resp.status()) {
                let location = resp
                    .header("Location")
                    .ok_or_else(|| anyhow!("redirect without Location from {current}"))?;
                let next = current.join(location)?;
                let next_host = next
                    .host_str()
                    .ok_or_else(|| anyhow!("redirect target has no host: {next}"))?;
                if !self.hosts_related(&origin_host, next_host) {
                    return Err(HttpError::RedirectBlocked {
                        from: origin_host,
                        to: next_host.to_string(),
                    }
                    .into());
                }
                current = next;
                continue;
            }

            if let Some(cl) = resp.header("Content-Length") {
                if let Ok(len) = cl.parse::<u64>() {
                    if len > max_bytes {
                        return Err(HttpError::ByteCapExceeded {
                            url: current.to_string(),
                            cap: max_bytes,
                        }
                        .into());
                    }
                }
            }

            let content_disposition = resp.header("Content-Disposition").map(str::to_string);
            let content_type = resp.header("Content-Type").map(str::to_string);

            let mut data = Vec::new();
            resp.into_reader()
                .take(max_bytes)
                .read_to_end(&mut data)
                .map_err(|e| anyhow!("read failed for {current}: {e}"))?;
            if data.is_empty() {
                return Err(HttpError::EmptyResponse {
                    url: current.to_string(),
                }
                .into());
            }
            if data.len() as u64 >= max_bytes {
                // Hitting the cap exactly means the body was likely truncated.
                return Err(HttpError::ByteCapExceeded {
                    url: current.to_string(),
                    cap: max_bytes,
                }
                .into());
            }
            return Ok(FetchedBody {
                data,
                content_disposition,
                content_type,
                final_url: current.to_string(),
            });
        }
        Err(anyhow!("too many redirects for {url}"))
    }

    /// GET a text page (HTML) with a byte cap; decoding is lossy UTF-8.
    pub fn get_text(&self, url: &str, max_bytes: u64) -> Result<String> {
        let body = self.get_bytes(url, max_bytes)?;
        Ok(String::from_utf8_lossy(&body.data).into_owned())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for SafeHttpClient {
    fn default() -> Self {
        Self::from_config(&HttpConfig::default())
    }
}

fn host_of_netloc(netloc: &str) -> String {
    // netloc is "host:port"; IPv6 literals arrive bracketed.
    let trimmed = netloc.trim();
    if let Some(rest) = trimmed.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest).to_string();
    }
    trimmed.rsplit_once(':').map_or(trimmed, |(h, _)| h).to_string()
}

fn host_allow_listed(allow: &[String], host: &str) -> bool {
    allow.iter().any(|h| h.eq_ignore_ascii_case(host))
}

/// Private, loopback, link-local, CGNAT, and otherwise reserved ranges.
pub fn is_private_or_reserved(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || o[0] == 0
                || (o[0] == 100 && (64..128).contains(&o[1])) // 100.64/10 CGNAT
                || o[0] >= 224 // multicast + reserved
        }
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                || (seg[0] & 0xFE00) == 0xFC00 // unique local fc00::/7
                || (seg[0] & 0xFFC0) == 0xFE80 // link local fe80::/10
                || (seg[0] & 0xFF00) == 0xFF00 // multicast
        }
    }
}

fn host_matches_suffix(host: &str, suffix: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let suffix = suffix.trim_start_matches('.').to_ascii_lowercase();
    host == suffix || host.ends_with(&format!(".{suffix}"))
}

/// Two hosts are related when equal or when one is a subdomain of the other.
fn hosts_share_suffix(a: &str, b: &str) -> bool {
    let a = a.to_ascii_lowercase();
    let b = b.to_ascii_lowercase();
    if a == b {
        return true;
    }
    a.ends_with(&format!(".{b}")) || b.ends_with(&format!(".{a}"))
}
