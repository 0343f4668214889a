//! Root CA management and per-host leaf certificate minting.
//!
//! The dispatcher terminates TLS with leaves signed by a locally-trusted
//! root CA. Leaves and their pre-built rustls server contexts live in
//! bounded insertion-ordered caches so long-running processes facing SNI
//! fan-out stay flat on memory.

mod authority;
mod store;

pub use authority::{CertificateAuthority, LeafCert};
pub use store::BoundedCache;

use claudish_core::error::ProxyError;
use claudish_core::paths::Paths;
use rustls::ServerConfig;
use std::sync::{Arc, Mutex};

pub const LEAF_CACHE_CAPACITY: usize = 100;
pub const CONTEXT_CACHE_CAPACITY: usize = 100;

/// Hosts minted at startup so the first real request skips leaf latency.
pub const PRE_GENERATE_HOSTS: &[&str] = &["api.anthropic.com", "claude.ai"];

struct CachedContext {
    config: Arc<ServerConfig>,
    not_after_unix: i64,
}

/// Shared certificate manager: one CA, two bounded caches.
pub struct CertManager {
    authority: CertificateAuthority,
    leaves: Mutex<BoundedCache<Arc<LeafCert>>>,
    contexts: Mutex<BoundedCache<CachedContext>>,
}

impl CertManager {
    /// Load or create the CA under the proxy cert directory.
    ///
    /// Idempotent; fails when the directory cannot be prepared or the CA
    /// cannot be generated, which is fatal for the proxy.
    pub fn initialize(paths: &Paths) -> Result<Self, ProxyError> {
        Self::with_capacity(paths, LEAF_CACHE_CAPACITY, CONTEXT_CACHE_CAPACITY)
    }

    /// As [`initialize`](Self::initialize) with explicit cache bounds.
    pub fn with_capacity(
        paths: &Paths,
        leaf_capacity: usize,
        context_capacity: usize,
    ) -> Result<Self, ProxyError> {
        let authority = CertificateAuthority::load_or_create(paths)?;
        Ok(Self {
            authority,
            leaves: Mutex::new(BoundedCache::new(leaf_capacity)),
            contexts: Mutex::new(BoundedCache::new(context_capacity)),
        })
    }

    /// PEM pair for a host, minting on miss.
    ///
    /// Concurrent misses for the same host may mint duplicates; the cache
    /// keeps the last writer, which is harmless.
    pub fn get_cert_for_domain(&self, host: &str) -> Result<Arc<LeafCert>, ProxyError> {
        if let Some(leaf) = self.leaves.lock().expect("leaf cache lock").get(host) {
            return Ok(leaf.clone());
        }
        let leaf = Arc::new(self.authority.mint_leaf(host)?);
        self.leaves
            .lock()
            .expect("leaf cache lock")
            .insert(host, leaf.clone());
        Ok(leaf)
    }

    /// rustls server context for a host, ALPN pinned to `http/1.1`.
    ///
    /// Context-cache hits are only served while the underlying leaf is
    /// unexpired; stale entries are dropped and re-minted.
    pub fn server_config_for(&self, host: &str) -> Result<Arc<ServerConfig>, ProxyError> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        {
            let mut contexts = self.contexts.lock().expect("context cache lock");
            match contexts.get(host) {
                Some(ctx) if ctx.not_after_unix > now => return Ok(ctx.config.clone()),
                Some(_) => contexts.remove(host),
                None => {}
            }
        }

        let leaf = self.get_cert_for_domain(host)?;
        let config = Arc::new(leaf.build_server_config()?);
        self.contexts.lock().expect("context cache lock").insert(
            host,
            CachedContext {
                config: config.clone(),
                not_after_unix: leaf.not_after_unix,
            },
        );
        Ok(config)
    }

    /// Mint leaves for the fixed allow-list concurrently.
    pub async fn pre_generate(self: Arc<Self>, hosts: &[&str]) {
        let mut tasks = Vec::with_capacity(hosts.len());
        for host in hosts {
            let manager = self.clone();
            let host = host.to_string();
            tasks.push(tokio::task::spawn_blocking(move || {
                if let Err(e) = manager.get_cert_for_domain(&host) {
                    tracing::warn!("pre-generation for {host} failed: {e}");
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    /// SHA-256 fingerprint of the CA certificate DER.
    pub fn get_ca_fingerprint(&self) -> String {
        self.authority.fingerprint()
    }

    pub fn ca_cert_pem(&self) -> &str {
        self.authority.cert_pem()
    }

    pub fn ca_not_after(&self) -> i64 {
        self.authority.not_after_unix()
    }

    pub fn leaf_cache_len(&self) -> usize {
        self.leaves.lock().expect("leaf cache lock").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, Arc<CertManager>) {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_home(dir.path());
        let manager = Arc::new(CertManager::initialize(&paths).unwrap());
        (dir, manager)
    }

    #[test]
    fn test_initialize_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_home(dir.path());
        let first = CertManager::initialize(&paths).unwrap();
        let second = CertManager::initialize(&paths).unwrap();
        assert_eq!(first.get_ca_fingerprint(), second.get_ca_fingerprint());
    }

    #[test]
    fn test_leaf_cached() {
        let (_dir, manager) = manager();
        let a = manager.get_cert_for_domain("claude.ai").unwrap();
        let b = manager.get_cert_for_domain("claude.ai").unwrap();
        assert_eq!(a.cert_pem, b.cert_pem);
        assert_eq!(manager.leaf_cache_len(), 1);
    }

    #[test]
    fn test_leaf_cache_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_home(dir.path());
        let manager = CertManager::with_capacity(&paths, 3, 3).unwrap();
        for i in 0..5 {
            manager.get_cert_for_domain(&format!("host{i}.example")).unwrap();
        }
        assert_eq!(manager.leaf_cache_len(), 3);
        // Oldest entries were evicted; re-request mints fresh.
        let early = manager.get_cert_for_domain("host0.example").unwrap();
        assert!(early.cert_pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn test_server_config_alpn() {
        let (_dir, manager) = manager();
        let config = manager.server_config_for("api.anthropic.com").unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_fingerprint_shape() {
        let (_dir, manager) = manager();
        let fp = manager.get_ca_fingerprint();
        // 32 bytes as colon-separated hex pairs.
        assert_eq!(fp.split(':').count(), 32);
    }

    #[tokio::test]
    async fn test_pre_generate() {
        let (_dir, manager) = manager();
        manager.clone().pre_generate(PRE_GENERATE_HOSTS).await;
        assert_eq!(manager.leaf_cache_len(), PRE_GENERATE_HOSTS.len());
    }
}
