//! Domain Authorizer (C2, spec.md §4.2): validates that a callback URL
//! resolves to an active, verified, non-expired authorized domain before
//! any network call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use url::Url;

use crate::error::{AuthorizeError, DenyReason};
use crate::glob::matches_any;
use crate::store::ConfigStore;

/// A cached positive or negative decision. Only positive decisions are
/// worth caching (spec.md §4.2: "cache the positive decision"); negative
/// ones are cheap to re-derive and may change as domains get verified.
#[derive(Clone)]
struct CacheEntry {
    decision: Result<(), AuthorizeError>,
    cached_at: Instant,
}

pub struct DomainAuthorizer {
    store: Arc<dyn ConfigStore>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    cache_ttl: Duration,
    cache_cap: usize,
}

impl DomainAuthorizer {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self::with_ttl(store, Duration::from_secs(30), 10_000)
    }

    pub fn with_ttl(store: Arc<dyn ConfigStore>, cache_ttl: Duration, cache_cap: usize) -> Self {
        Self { store, cache: Mutex::new(HashMap::new()), cache_ttl, cache_cap }
    }

    /// `authorize(url) -> {allow, deny(reason)}` per spec.md §4.2's
    /// seven-step decision tree.
    pub async fn authorize(&self, url: &str) -> Result<(), AuthorizeError> {
        if let Some(cached) = self.cached(url) {
            return cached;
        }

        let decision = self.authorize_uncached(url).await;
        self.cache_decision(url, decision.clone());
        decision
    }

    fn cached(&self, url: &str) -> Option<Result<(), AuthorizeError>> {
        let cache = self.cache.lock();
        let entry = cache.get(url)?;
        if entry.cached_at.elapsed() > self.cache_ttl {
            return None;
        }
        Some(entry.decision.clone())
    }

    fn cache_decision(&self, url: &str, decision: Result<(), AuthorizeError>) {
        // Only cache positive decisions, matching spec.md §4.2's guidance.
        if decision.is_err() {
            return;
        }
        let mut cache = self.cache.lock();
        if cache.len() >= self.cache_cap && !cache.contains_key(url) {
            // Size cap: drop an arbitrary entry rather than growing
            // unbounded. A proper LRU is unnecessary at this scale.
            if let Some(key) = cache.keys().next().cloned() {
                cache.remove(&key);
            }
        }
        cache.insert(url.to_string(), CacheEntry { decision, cached_at: Instant::now() });
    }

    async fn authorize_uncached(&self, url: &str) -> Result<(), AuthorizeError> {
        // 1. Parse url.
        let parsed = Url::parse(url).map_err(|_| AuthorizeError::Denied(DenyReason::Malformed))?;
        let scheme = parsed.scheme();
        if !parsed.has_host() || (scheme != "http" && scheme != "https") {
            return Err(AuthorizeError::Denied(DenyReason::Malformed));
        }
        let host = parsed.host_str().ok_or(AuthorizeError::Denied(DenyReason::Malformed))?;
        if host.is_empty() {
            return Err(AuthorizeError::Denied(DenyReason::Malformed));
        }

        // 2. Compute the domain key.
        let domain_key = domain_key(host, parsed.port(), scheme);

        // 3. Look up the domain.
        let domain = self
            .store
            .get_domain_by_name(&domain_key)
            .await
            .map_err(|_| AuthorizeError::Denied(DenyReason::UnknownDomain))?
            .ok_or(AuthorizeError::Denied(DenyReason::UnknownDomain))?;

        // 4. Active / verified / expiry.
        if !domain.active {
            return Err(AuthorizeError::Denied(DenyReason::Inactive));
        }
        if !domain.verified {
            return Err(AuthorizeError::Denied(DenyReason::Unverified));
        }
        if let Some(expires_at) = domain.expires_at {
            if expires_at <= Utc::now() {
                return Err(AuthorizeError::Denied(DenyReason::Expired));
            }
        }

        // 5. HTTPS requirement.
        if domain.require_https && scheme != "https" {
            return Err(AuthorizeError::Denied(DenyReason::HttpsRequired));
        }

        // 6. Path restriction.
        if !domain.allowed_paths.is_empty() && !matches_any(&domain.allowed_paths, parsed.path()) {
            return Err(AuthorizeError::Denied(DenyReason::PathDisallowed));
        }

        Ok(())
    }
}

/// Public helper so the dispatcher can derive the same domain key the
/// authorizer used, for `record_domain_callback` bookkeeping — even when
/// authorization was denied before a domain lookup ever happened.
pub fn domain_key_for_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if !parsed.has_host() {
        return None;
    }
    let scheme = parsed.scheme();
    let host = parsed.host_str()?;
    Some(domain_key(host, parsed.port(), scheme))
}

/// Lowercased host, plus `:port` iff the port is specified and not the
/// scheme default (spec.md §3).
fn domain_key(host: &str, port: Option<u16>, scheme: &str) -> String {
    let host = host.to_lowercase();
    let default_port = match scheme {
        "https" => 443,
        "http" => 80,
        _ => 0,
    };
    match port {
        Some(p) if p != default_port => format!("{host}:{p}"),
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AuthorizedDomain;
    use crate::store::InMemoryConfigStore;
    use std::sync::Arc;

    fn base_domain(name: &str) -> AuthorizedDomain {
        AuthorizedDomain {
            id: uuid::Uuid::new_v4(),
            domain: name.to_string(),
            verified: true,
            active: true,
            allowed_paths: vec![],
            require_https: false,
            expires_at: None,
            ip_whitelist: None,
            max_callbacks_per_minute: None,
            total_callbacks: 0,
            total_failed: 0,
            last_callback_at: None,
        }
    }

    fn authorizer_with(domain: AuthorizedDomain) -> DomainAuthorizer {
        let store = Arc::new(InMemoryConfigStore::new());
        store.insert_domain(domain);
        DomainAuthorizer::new(store)
    }

    #[tokio::test]
    async fn allows_matching_active_domain() {
        let auth = authorizer_with(base_domain("example.com"));
        assert!(auth.authorize("http://example.com/hook").await.is_ok());
    }

    #[tokio::test]
    async fn denies_unknown_domain() {
        let store = Arc::new(InMemoryConfigStore::new());
        let auth = DomainAuthorizer::new(store);
        let err = auth.authorize("http://evil.com/hook").await.unwrap_err();
        assert_eq!(err, AuthorizeError::Denied(DenyReason::UnknownDomain));
    }

    #[tokio::test]
    async fn denies_malformed_url() {
        let store = Arc::new(InMemoryConfigStore::new());
        let auth = DomainAuthorizer::new(store);
        assert_eq!(
            auth.authorize("not-a-url").await.unwrap_err(),
            AuthorizeError::Denied(DenyReason::Malformed)
        );
        assert_eq!(
            auth.authorize("ftp://example.com/x").await.unwrap_err(),
            AuthorizeError::Denied(DenyReason::Malformed)
        );
    }

    #[tokio::test]
    async fn denies_inactive_and_unverified_and_expired() {
        let mut inactive = base_domain("a.com");
        inactive.active = false;
        assert_eq!(
            authorizer_with(inactive).authorize("http://a.com/x").await.unwrap_err(),
            AuthorizeError::Denied(DenyReason::Inactive)
        );

        let mut unverified = base_domain("b.com");
        unverified.verified = false;
        assert_eq!(
            authorizer_with(unverified).authorize("http://b.com/x").await.unwrap_err(),
            AuthorizeError::Denied(DenyReason::Unverified)
        );

        let mut expired = base_domain("c.com");
        expired.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert_eq!(
            authorizer_with(expired).authorize("http://c.com/x").await.unwrap_err(),
            AuthorizeError::Denied(DenyReason::Expired)
        );
    }

    #[tokio::test]
    async fn denies_http_when_https_required() {
        let mut domain = base_domain("secure.com");
        domain.require_https = true;
        let auth = authorizer_with(domain);
        assert_eq!(
            auth.authorize("http://secure.com/x").await.unwrap_err(),
            AuthorizeError::Denied(DenyReason::HttpsRequired)
        );
        assert!(auth.authorize("https://secure.com/x").await.is_ok());
    }

    #[tokio::test]
    async fn denies_disallowed_path() {
        let mut domain = base_domain("paths.com");
        domain.allowed_paths = vec!["/webhooks/*".to_string()];
        let auth = authorizer_with(domain);
        assert_eq!(
            auth.authorize("https://paths.com/other").await.unwrap_err(),
            AuthorizeError::Denied(DenyReason::PathDisallowed)
        );
        assert!(auth.authorize("https://paths.com/webhooks/foo").await.is_ok());
    }

    #[tokio::test]
    async fn non_default_port_is_part_of_domain_key() {
        let mut domain = base_domain("example.com:8443");
        domain.require_https = false;
        let auth = authorizer_with(domain);
        assert!(auth.authorize("http://example.com:8443/hook").await.is_ok());
        assert_eq!(
            auth.authorize("http://example.com/hook").await.unwrap_err(),
            AuthorizeError::Denied(DenyReason::UnknownDomain)
        );
    }

    #[tokio::test]
    async fn default_port_is_omitted_from_domain_key() {
        let domain = base_domain("example.com");
        let auth = authorizer_with(domain);
        assert!(auth.authorize("https://example.com:443/hook").await.is_ok());
    }

    #[tokio::test]
    async fn repeated_authorize_is_idempotent() {
        let auth = authorizer_with(base_domain("stable.com"));
        let first = auth.authorize("http://stable.com/hook").await;
        let second = auth.authorize("http://stable.com/hook").await;
        assert_eq!(first.is_ok(), second.is_ok());
    }
}
