use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use anyhow::Result;
use if_addrs::get_if_addrs;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;

/// Reported when neither remote lookups nor local interfaces yield an address.
pub const UNKNOWN_ADDRESS: &str = "0.0.0.0";

#[derive(Debug)]
struct CachedAddress {
    addr: String,
    fetched_at: Instant,
}

/// Works out the agent's public address, caching it for a fixed TTL.
#[derive(Debug)]
pub struct ExternalIpResolver {
    endpoints: Vec<String>,
    ttl: Duration,
    client: reqwest::Client,
    cache: RwLock<Option<CachedAddress>>,
}

impl ExternalIpResolver {
    pub fn new(cfg: &NetworkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.lookup_timeout)
            .build()?;
        Ok(Self {
            endpoints: cfg.ip_endpoints.clone(),
            ttl: cfg.cache_ttl,
            client,
            cache: RwLock::new(None),
        })
    }

    /// Cached address if still fresh, otherwise a new lookup.
    ///
    /// Concurrent callers that all miss the cache share a single lookup.
    pub async fn resolve(&self) -> String {
        if let Some(addr) = self.fresh(&*self.cache.read().await) {
            return addr;
        }

        let mut cache = self.cache.write().await;
        if let Some(addr) = self.fresh(&cache) {
            return addr;
        }

        match self.lookup().await {
            Some(addr) => {
                *cache = Some(CachedAddress {
                    addr: addr.clone(),
                    fetched_at: Instant::now(),
                });
                addr
            }
            None => {
                warn!("could not determine external address");
                UNKNOWN_ADDRESS.to_string()
            }
        }
    }

    fn fresh(&self, cache: &Option<CachedAddress>) -> Option<String> {
        cache
            .as_ref()
            .filter(|c| c.fetched_at.elapsed() < self.ttl)
            .map(|c| c.addr.clone())
    }

    async fn lookup(&self) -> Option<String> {
        for url in &self.endpoints {
            match self.query(url).await {
                Ok(Some(ip)) => {
                    info!(%ip, via = %url, "external address");
                    return Some(ip.to_string());
                }
                Ok(None) => debug!(via = %url, "lookup returned no usable address"),
                Err(e) => debug!(via = %url, error = %e, "lookup failed"),
            }
        }

        let local = primary_local_ip()?;
        info!(ip = %local, "using local interface address as external address");
        Some(local.to_string())
    }

    async fn query(&self, url: &str) -> reqwest::Result<Option<IpAddr>> {
        let body = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body.trim().parse().ok())
    }
}

/// Non-loopback IPv4 addresses of interfaces on this machine that are up.
pub fn local_interfaces() -> Result<Vec<Ipv4Addr>> {
    let ifaces = get_if_addrs()?;
    Ok(usable_ipv4(
        ifaces.iter().map(|iface| (iface.is_oper_up(), iface.ip())),
    ))
}

/// Keep addresses of up interfaces that are IPv4 and not loopback, first
/// occurrence only.
fn usable_ipv4<I>(candidates: I) -> Vec<Ipv4Addr>
where
    I: IntoIterator<Item = (bool, IpAddr)>,
{
    let mut out = Vec::new();
    for (up, ip) in candidates {
        let IpAddr::V4(v4) = ip else { continue };
        if up && !v4.is_loopback() && !out.contains(&v4) {
            out.push(v4);
        }
    }
    out
}

/// First non-loopback IPv4 address, if any.
pub fn primary_local_ip() -> Option<Ipv4Addr> {
    match local_interfaces() {
        Ok(addrs) => addrs.into_iter().next(),
        Err(e) => {
            warn!(error = %e, "failed to enumerate interfaces");
            None
        }
    }
}
