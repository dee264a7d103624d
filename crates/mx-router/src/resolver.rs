use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::{ResolveError, TokioResolver};
use parking_lot::Mutex;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum DnsError {
    #[error("invalid DNS name: {0}")]
    InvalidName(String),
    #[error("DNS: {0}")]
    ResolveFailed(String),
}

impl DnsError {
    fn from_resolve(name: &impl fmt::Display, err: ResolveError) -> Self {
        DnsError::ResolveFailed(format!("failed to query MX for {name}: {err}"))
    }
}

/// The DNS seam: the router only ever needs MX exchange hosts,
/// so that is all the trait exposes.
#[async_trait]
pub trait MxResolver: Send + Sync + 'static {
    /// Returns the MX exchange host names for `domain`, lowercased
    /// and with the trailing dot stripped, in answer order.
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<String>, DnsError>;
}

pub struct HickoryMxResolver {
    inner: TokioResolver,
}

impl HickoryMxResolver {
    /// Resolver backed by the system configuration (`/etc/resolv.conf`).
    pub fn system(timeout: Duration) -> Result<Self, ResolveError> {
        let mut builder = TokioResolver::builder_tokio()?;
        builder.options_mut().timeout = timeout;
        builder.options_mut().attempts = 1;
        Ok(Self {
            inner: builder.build(),
        })
    }

    /// Resolver pinned to an explicit set of nameserver addresses.
    pub fn with_nameservers(nameservers: &[IpAddr], timeout: Duration) -> Self {
        let mut config = ResolverConfig::new();
        for &ip in nameservers {
            let addr = SocketAddr::new(ip, 53);
            config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));
        }
        let mut builder =
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default());
        builder.options_mut().timeout = timeout;
        builder.options_mut().attempts = 1;
        Self {
            inner: builder.build(),
        }
    }
}

#[async_trait]
impl MxResolver for HickoryMxResolver {
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<String>, DnsError> {
        let lookup = self
            .inner
            .mx_lookup(domain)
            .await
            .map_err(|err| DnsError::from_resolve(&domain, err))?;

        Ok(lookup
            .into_iter()
            .map(|mx| {
                mx.exchange()
                    .to_string()
                    .trim_end_matches('.')
                    .to_lowercase()
            })
            .collect())
    }
}

/// Scripted resolver for tests: pops one canned response per call and
/// counts how many lookups were actually issued.
#[derive(Default)]
pub struct TestMxResolver {
    responses: Mutex<Vec<Result<Vec<String>, DnsError>>>,
    calls: AtomicUsize,
}

impl TestMxResolver {
    pub fn new(responses: Vec<Result<Vec<String>, DnsError>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MxResolver for TestMxResolver {
    async fn resolve_mx(&self, _domain: &str) -> Result<Vec<String>, DnsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock();
        if responses.is_empty() {
            return Err(DnsError::ResolveFailed("no more responses".to_string()));
        }
        responses.remove(0)
    }
}
