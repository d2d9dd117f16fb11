//! Threat-intelligence enrichment for cache entries.
//!
//! Before a freshly resolved answer becomes visible in the cache, the
//! enricher asks its reputation providers about the domain.  Providers are a
//! closed set of variants rather than open-world dynamic dispatch: disabled,
//! a single provider, or an aggregate that queries all providers in parallel
//! and merges their verdicts (maximum score, union of categories).
//!
//! Enrichment fails open: a provider error or deadline miss yields the
//! benign default, never a lost cache entry.  The whole lookup is bounded by
//! a 200ms deadline so slow providers cannot stall response ingestion.

use std::time::Duration;

use futures::future::join_all;
use serde::Deserialize;
use tokio::time::timeout;

use dns_types::protocol::types::DomainName;

/// The overall enrichment deadline.
pub const ENRICHMENT_DEADLINE: Duration = Duration::from_millis(200);

/// A provider's (or the merged) verdict about a domain.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ThreatSignal {
    /// 0 to 100; above 80 is malicious, 51 to 80 suspicious.
    pub score: u8,
    pub categories: Vec<String>,
}

/// The configured enrichment capability.
pub enum ThreatIntel {
    /// No lookups; every domain scores 0.
    Disabled,
    Single(ThreatProvider),
    Aggregate(Vec<ThreatProvider>),
}

impl ThreatIntel {
    /// Look a domain up.  Always returns a signal: failures and deadline
    /// misses degrade to the benign default.
    pub async fn check_domain(&self, domain: &DomainName) -> ThreatSignal {
        let name = domain.to_dotted_string();

        match self {
            ThreatIntel::Disabled => ThreatSignal::default(),
            ThreatIntel::Single(provider) => {
                match timeout(ENRICHMENT_DEADLINE, provider.check_domain(&name)).await {
                    Ok(Ok(signal)) => signal,
                    Ok(Err(error)) => {
                        tracing::debug!(provider = %provider.name, %error, "threat lookup failed");
                        ThreatSignal::default()
                    }
                    Err(_) => {
                        tracing::debug!(provider = %provider.name, "threat lookup timed out");
                        ThreatSignal::default()
                    }
                }
            }
            ThreatIntel::Aggregate(providers) => {
                // each lookup is individually bounded by the shared
                // deadline, so the whole join completes within it and the
                // verdicts that did arrive still count
                let lookups = providers.iter().map(|provider| {
                    let name = name.clone();
                    async move {
                        match timeout(ENRICHMENT_DEADLINE, provider.check_domain(&name)).await {
                            Ok(Ok(signal)) => Some(signal),
                            Ok(Err(error)) => {
                                tracing::debug!(provider = %provider.name, %error, "threat lookup failed");
                                None
                            }
                            Err(_) => {
                                tracing::debug!(provider = %provider.name, "threat lookup timed out");
                                None
                            }
                        }
                    }
                });

                let mut merged = ThreatSignal::default();
                for signal in join_all(lookups).await.into_iter().flatten() {
                    merged.score = merged.score.max(signal.score.min(100));
                    for category in signal.categories {
                        if !merged.categories.contains(&category) {
                            merged.categories.push(category);
                        }
                    }
                }
                merged
            }
        }
    }
}

/// One external reputation source, queried over HTTPS.
pub struct ThreatProvider {
    name: String,
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    score: u8,
    #[serde(default)]
    categories: Vec<String>,
}

impl ThreatProvider {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }

    /// `GET {endpoint}?domain={domain}`, expecting
    /// `{"score": 0..100, "categories": [...]}`.
    pub async fn check_domain(&self, domain: &str) -> Result<ThreatSignal, ProviderError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("domain", domain)])
            .timeout(ENRICHMENT_DEADLINE)
            .send()
            .await?
            .error_for_status()?;

        let body: ProviderResponse = response.json().await?;
        Ok(ThreatSignal {
            score: body.score.min(100),
            categories: body.categories,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::test_util::*;

    #[tokio::test]
    async fn disabled_intel_scores_zero() {
        let intel = ThreatIntel::Disabled;
        let signal = intel.check_domain(&domain("www.example.com.")).await;

        assert_eq!(0, signal.score);
        assert!(signal.categories.is_empty());
    }

    #[tokio::test]
    async fn unreachable_provider_fails_open() {
        // nothing listens on this address, so the lookup errors quickly
        let intel = ThreatIntel::Single(ThreatProvider::new(
            "dead",
            "http://127.0.0.1:9/threat",
        ));
        let signal = intel.check_domain(&domain("www.example.com.")).await;

        assert_eq!(ThreatSignal::default(), signal);
    }

    #[tokio::test]
    async fn aggregate_of_unreachable_providers_fails_open() {
        let intel = ThreatIntel::Aggregate(vec![
            ThreatProvider::new("dead-1", "http://127.0.0.1:9/threat"),
            ThreatProvider::new("dead-2", "http://127.0.0.1:9/threat"),
        ]);
        let signal = intel.check_domain(&domain("www.example.com.")).await;

        assert_eq!(ThreatSignal::default(), signal);
    }
}
