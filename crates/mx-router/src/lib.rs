//! MX-record based routing classification.
//!
//! Given a recipient domain, decide whether its mail is hosted on a
//! russian provider (`RU`), somewhere else (`OTHER`), or could not be
//! determined (`UNKNOWN`). Results of successful lookups are held in a
//! mutex-protected LRU+TTL cache so that repeated classifications of
//! the same domain within the TTL never touch DNS again.

use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

mod cache;
mod resolver;

pub use cache::TtlCache;
pub use resolver::{DnsError, HickoryMxResolver, MxResolver, TestMxResolver};

/// How many resolver sets we walk before giving up on a domain.
const MAX_LOOKUP_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MxClass {
    #[serde(rename = "RU")]
    Ru,
    #[serde(rename = "OTHER")]
    Other,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl std::fmt::Display for MxClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            MxClass::Ru => "RU",
            MxClass::Other => "OTHER",
            MxClass::Unknown => "UNKNOWN",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MxResult {
    pub classification: MxClass,
    pub records: Vec<String>,
    pub ttl_hit: bool,
}

impl MxResult {
    fn fresh(classification: MxClass, records: Vec<String>) -> Self {
        Self {
            classification,
            records,
            ttl_hit: false,
        }
    }
}

/// Routing knobs, loaded from `ROUTING_*` environment variables by the
/// daemon and handed in here as plain data.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    pub enabled: bool,
    pub mx_cache_ttl_hours: u64,
    pub dns_timeout: Duration,
    pub dns_resolvers: Vec<IpAddr>,
    pub ru_mx_patterns: Vec<String>,
    pub ru_mx_tlds: Vec<String>,
    pub force_ru_domains: Vec<String>,
    pub cache_capacity: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mx_cache_ttl_hours: 168,
            dns_timeout: Duration::from_millis(1500),
            dns_resolvers: vec![],
            ru_mx_patterns: vec![
                "yandex.net".to_string(),
                "mail.ru".to_string(),
                "rambler.ru".to_string(),
            ],
            ru_mx_tlds: vec![".ru".to_string(), ".su".to_string()],
            force_ru_domains: vec![],
            cache_capacity: 1024,
        }
    }
}

pub struct MxRouter {
    enabled: bool,
    cache: TtlCache<String, (MxClass, Vec<String>)>,
    resolvers: Vec<Arc<dyn MxResolver>>,
    ru_patterns: Vec<String>,
    ru_tlds: Vec<String>,
    force_ru_domains: Vec<String>,
}

impl MxRouter {
    pub fn new(config: &RoutingConfig) -> anyhow::Result<Self> {
        let mut resolvers: Vec<Arc<dyn MxResolver>> = vec![];
        if !config.dns_resolvers.is_empty() {
            resolvers.push(Arc::new(HickoryMxResolver::with_nameservers(
                &config.dns_resolvers,
                config.dns_timeout,
            )));
        }
        resolvers.push(Arc::new(HickoryMxResolver::system(config.dns_timeout)?));
        Ok(Self::with_resolvers(config, resolvers))
    }

    /// Construct with explicit resolvers; the path tests take.
    pub fn with_resolvers(config: &RoutingConfig, resolvers: Vec<Arc<dyn MxResolver>>) -> Self {
        let ttl = Duration::from_secs((config.mx_cache_ttl_hours * 3600).max(60));
        Self {
            enabled: config.enabled,
            cache: TtlCache::new(config.cache_capacity, ttl),
            resolvers,
            ru_patterns: lowercased(&config.ru_mx_patterns),
            ru_tlds: lowercased(&config.ru_mx_tlds),
            force_ru_domains: lowercased(&config.force_ru_domains),
        }
    }

    /// Classify `domain` by its MX records. DNS failures are never
    /// fatal: after both resolver sets have been tried the result
    /// degrades to `UNKNOWN` and nothing is cached.
    pub async fn classify(&self, domain: &str) -> MxResult {
        if !self.enabled {
            return MxResult::fresh(MxClass::Other, vec![]);
        }

        let normalized = domain.trim().to_lowercase();
        if normalized.is_empty() {
            tracing::warn!("empty domain handed to MX classification");
            return MxResult::fresh(MxClass::Unknown, vec![]);
        }

        if let Some((classification, records)) = self.cache.get(&normalized) {
            return MxResult {
                classification,
                records,
                ttl_hit: true,
            };
        }

        if self.force_ru_domains.contains(&normalized) {
            self.cache.insert(normalized, (MxClass::Ru, vec![]));
            return MxResult::fresh(MxClass::Ru, vec![]);
        }

        let records = match self.resolve_mx(&normalized).await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!("MX lookup failed for {normalized}: {err}");
                return MxResult::fresh(MxClass::Unknown, vec![]);
            }
        };

        if records.is_empty() {
            tracing::info!("MX lookup returned no records for {normalized}");
            return MxResult::fresh(MxClass::Unknown, vec![]);
        }

        let classification = if self.matches_ru(&records) {
            MxClass::Ru
        } else {
            MxClass::Other
        };

        self.cache
            .insert(normalized, (classification, records.clone()));
        MxResult::fresh(classification, records)
    }

    async fn resolve_mx(&self, domain: &str) -> Result<Vec<String>, DnsError> {
        let mut last_error = DnsError::ResolveFailed("no resolvers configured".to_string());
        for (attempt, resolver) in self.resolvers.iter().take(MAX_LOOKUP_ATTEMPTS).enumerate() {
            match resolver.resolve_mx(domain).await {
                Ok(records) => {
                    tracing::debug!("resolved MX for {domain}: {records:?}");
                    return Ok(records);
                }
                Err(err) => {
                    tracing::warn!("attempt {} to resolve MX for {domain} failed: {err}", attempt + 1);
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    fn matches_ru(&self, records: &[String]) -> bool {
        records.iter().any(|record| {
            let lowered = record.to_lowercase();
            self.ru_patterns.iter().any(|p| lowered.contains(p.as_str()))
                || self.ru_tlds.iter().any(|t| lowered.ends_with(t.as_str()))
        })
    }
}

fn lowercased(values: &[String]) -> Vec<String> {
    values
        .iter()
        .filter(|v| !v.is_empty())
        .map(|v| v.to_lowercase())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_config() -> RoutingConfig {
        RoutingConfig {
            enabled: true,
            mx_cache_ttl_hours: 1,
            ru_mx_patterns: vec!["mx.yandex.net".to_string(), "mx.mail.ru".to_string()],
            ru_mx_tlds: vec![".ru".to_string()],
            force_ru_domains: vec!["mail.ru".to_string()],
            ..RoutingConfig::default()
        }
    }

    fn router_with(
        config: RoutingConfig,
        responses: Vec<Result<Vec<String>, DnsError>>,
    ) -> (MxRouter, Arc<TestMxResolver>) {
        let resolver = Arc::new(TestMxResolver::new(responses));
        let router = MxRouter::with_resolvers(&config, vec![resolver.clone()]);
        (router, resolver)
    }

    #[tokio::test]
    async fn force_domain_returns_ru_without_dns() {
        let (router, resolver) = router_with(test_config(), vec![]);

        let result = router.classify("mail.ru").await;

        assert_eq!(result.classification, MxClass::Ru);
        assert!(result.records.is_empty());
        assert!(!result.ttl_hit);

        // the forced answer is cached, so the second call is a TTL hit
        let again = router.classify("mail.ru").await;
        assert_eq!(again.classification, MxClass::Ru);
        assert!(again.ttl_hit);
        assert_eq!(resolver.calls(), 0);
    }

    #[tokio::test]
    async fn second_classification_is_a_cache_hit() {
        let (router, resolver) = router_with(
            test_config(),
            vec![Ok(vec!["mx.yandex.net".to_string()])],
        );

        let first = router.classify("example.ru").await;
        let second = router.classify("example.ru").await;

        assert_eq!(first.classification, MxClass::Ru);
        assert!(!first.ttl_hit);
        assert_eq!(second.classification, MxClass::Ru);
        assert!(second.ttl_hit);
        assert_eq!(second.records, vec!["mx.yandex.net".to_string()]);
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test]
    async fn unknown_after_exhausted_failures_is_not_cached() {
        let (router, resolver) = router_with(
            test_config(),
            vec![
                Err(DnsError::ResolveFailed("timeout".to_string())),
                Err(DnsError::ResolveFailed("timeout".to_string())),
            ],
        );

        let result = router.classify("unreachable.example").await;
        assert_eq!(result.classification, MxClass::Unknown);
        assert!(result.records.is_empty());

        // a later retry issues DNS again instead of serving UNKNOWN from cache
        let again = router.classify("unreachable.example").await;
        assert!(!again.ttl_hit);
        assert_eq!(resolver.calls(), 2);
    }

    #[tokio::test]
    async fn detects_ru_by_tld_suffix() {
        let mut config = test_config();
        config.ru_mx_patterns = vec![];
        config.ru_mx_tlds = vec![".ru".to_string(), ".su".to_string()];
        let (router, _) = router_with(config, vec![Ok(vec!["mail.company.ru".to_string()])]);

        let result = router.classify("company.ru").await;

        assert_eq!(result.classification, MxClass::Ru);
        assert_eq!(result.records, vec!["mail.company.ru".to_string()]);
    }

    #[tokio::test]
    async fn other_when_nothing_matches() {
        let mut config = test_config();
        config.ru_mx_patterns = vec![];
        let (router, _) = router_with(config, vec![Ok(vec!["aspmx.l.google.com".to_string()])]);

        let result = router.classify("company.com").await;

        assert_eq!(result.classification, MxClass::Other);
        assert_eq!(result.records, vec!["aspmx.l.google.com".to_string()]);
    }

    #[tokio::test]
    async fn disabled_routing_short_circuits_to_other() {
        let mut config = test_config();
        config.enabled = false;
        let (router, resolver) = router_with(config, vec![]);

        let result = router.classify("anything.example").await;

        assert_eq!(result.classification, MxClass::Other);
        assert_eq!(resolver.calls(), 0);
    }

    #[tokio::test]
    async fn empty_domain_is_unknown() {
        let (router, _) = router_with(test_config(), vec![]);
        let result = router.classify("  ").await;
        assert_eq!(result.classification, MxClass::Unknown);
    }
}
