//! # Verification Executor
//!
//! Accepts a factual claim, fetches candidate sources through the guarded
//! transport, and composes a cached verdict:
//!
//! - **Fingerprinting**: the cache key is the SHA-256 of the normalized
//!   claim (trimmed, whitespace-collapsed, lowercased), so equivalent
//!   phrasings share a verdict.
//! - **Two-stage sourcing**: trusted domains are queried first; general
//!   sources only when trusted evidence is insufficient.
//! - **Bounded concurrency**: fetches run under a semaphore; a per-request
//!   budget stops new fetches and discards stragglers.
//! - **Degradation, never failure**: fetch errors weaken the verdict but
//!   `verify()` always returns a record.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;

use crate::config::VerificationConfig;
use crate::kv::KvStore;
use crate::logging::{LogContext, Logger};
use crate::net::{GuardedClient, OutboundRequest};
use crate::util::{Clock, SystemClock};

/// Key prefix for cached verdicts; versioned for schema evolution.
const CACHE_PREFIX: &str = "verify:v1";

// ============================================================================
// Claim fingerprinting
// ============================================================================

/// Canonical claim text: trimmed, inner whitespace collapsed, lowercased.
pub fn normalize_claim(claim: &str) -> String {
    claim
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// SHA-256 of the normalized claim, lowercase hex.
pub fn claim_hash(claim: &str) -> String {
    hex::encode(Sha256::digest(normalize_claim(claim).as_bytes()))
}

// ============================================================================
// Records
// ============================================================================

/// Verdict status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Verified,
    LikelyTrue,
    Uncertain,
    LikelyFalse,
    Refuted,
    Unverifiable,
}

/// One consulted source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    /// Registrable domain of the source.
    pub domain: String,
    /// Full URL that was fetched.
    pub url: String,
    /// Whether the domain is on the trusted list.
    pub trusted: bool,
}

/// Where the time went.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationTiming {
    /// Whole call.
    pub total_ms: u64,
    /// Source fetching.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_ms: Option<u64>,
    /// Verdict composition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_ms: Option<u64>,
}

/// The cached, returnable verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRecord {
    /// Fingerprint of the normalized claim.
    pub claim_hash: String,
    /// Verdict.
    pub status: VerdictStatus,
    /// Verdict confidence in `[0, 1]`, monotonic in trusted corroboration.
    pub confidence: f64,
    /// Sources that were successfully consulted.
    pub sources: Vec<SourceRef>,
    /// Supporting excerpt, when one was captured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    /// Human-readable composition of the verdict.
    pub explanation: String,
    /// Timing breakdown.
    pub timing: VerificationTiming,
    /// When the record was computed.
    pub cached_at: DateTime<Utc>,
    /// When the cache entry lapses.
    pub expires_at: DateTime<Utc>,
    /// Age of the cache entry at read time; set only on cache hits.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cache_age_secs: Option<u64>,
}

// ============================================================================
// Seams: sources and evidence
// ============================================================================

/// A fetchable candidate source.
#[derive(Debug, Clone)]
pub struct CandidateSource {
    /// URL to fetch.
    pub url: String,
    /// Registrable domain.
    pub domain: String,
    /// Whether the domain is trusted.
    pub trusted: bool,
}

/// Produces candidate sources for a claim. Trusted candidates must sort
/// before general ones.
pub trait SourceProvider: Send + Sync {
    /// Up to `max` candidates, trusted first.
    fn candidates(&self, claim: &str, max: usize) -> Vec<CandidateSource>;
}

/// Default provider: a search URL per trusted domain, then general
/// fallbacks.
pub struct QuerySourceProvider {
    trusted_domains: Vec<String>,
    general_domains: Vec<String>,
}

impl QuerySourceProvider {
    /// Build from the configured trusted list plus built-in general
    /// fallbacks.
    pub fn new(trusted_domains: Vec<String>) -> Self {
        Self {
            trusted_domains,
            general_domains: vec!["duckduckgo.com".to_string(), "search.marginalia.nu".to_string()],
        }
    }

    fn search_url(domain: &str, claim: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(claim.as_bytes()).collect();
        format!("https://{}/search?q={}", domain, encoded)
    }
}

impl SourceProvider for QuerySourceProvider {
    fn candidates(&self, claim: &str, max: usize) -> Vec<CandidateSource> {
        let normalized = normalize_claim(claim);
        let trusted = self.trusted_domains.iter().map(|domain| CandidateSource {
            url: Self::search_url(domain, &normalized),
            domain: domain.clone(),
            trusted: true,
        });
        let general = self.general_domains.iter().map(|domain| CandidateSource {
            url: Self::search_url(domain, &normalized),
            domain: domain.clone(),
            trusted: false,
        });
        trusted.chain(general).take(max).collect()
    }
}

/// What one source's content says about the claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceSignal {
    /// The content supports the claim.
    Corroborates,
    /// The content contradicts the claim.
    Conflicts,
    /// Nothing usable either way.
    Inconclusive,
}

/// Assesses fetched content against a claim.
pub trait EvidenceAnalyzer: Send + Sync {
    /// Judge one body of text.
    fn assess(&self, claim: &str, body: &str) -> EvidenceSignal;
}

/// Deterministic term-overlap analyzer.
///
/// Corroboration requires most of the claim's significant terms to appear;
/// an explicit debunking marker alongside substantial overlap reads as a
/// conflict.
pub struct KeywordAnalyzer;

const CONFLICT_MARKERS: [&str; 6] = ["false", "myth", "debunked", "hoax", "incorrect", "untrue"];

impl EvidenceAnalyzer for KeywordAnalyzer {
    fn assess(&self, claim: &str, body: &str) -> EvidenceSignal {
        let body_lower = body.to_lowercase();
        let terms: Vec<String> = normalize_claim(claim)
            .split(' ')
            .filter(|t| t.len() > 2)
            .map(|t| t.to_string())
            .collect();
        if terms.is_empty() {
            return EvidenceSignal::Inconclusive;
        }
        let present = terms.iter().filter(|t| body_lower.contains(t.as_str())).count();
        let coverage = present as f64 / terms.len() as f64;

        if coverage >= 0.4 && CONFLICT_MARKERS.iter().any(|m| body_lower.contains(m)) {
            return EvidenceSignal::Conflicts;
        }
        if coverage >= 0.6 {
            return EvidenceSignal::Corroborates;
        }
        EvidenceSignal::Inconclusive
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Claim-verification executor.
pub struct VerificationExecutor {
    config: VerificationConfig,
    kv: Arc<dyn KvStore>,
    client: Arc<GuardedClient>,
    provider: Arc<dyn SourceProvider>,
    analyzer: Arc<dyn EvidenceAnalyzer>,
    semaphore: Arc<Semaphore>,
    logger: Logger,
    clock: Arc<dyn Clock>,
}

struct SourceOutcome {
    source: SourceRef,
    signal: EvidenceSignal,
    excerpt: Option<String>,
}

impl VerificationExecutor {
    /// Build an executor with the default provider and analyzer.
    pub fn new(
        config: VerificationConfig,
        kv: Arc<dyn KvStore>,
        client: Arc<GuardedClient>,
        logger: &Logger,
    ) -> Self {
        let provider = Arc::new(QuerySourceProvider::new(config.trusted_domains.clone()));
        Self::with_seams(config, kv, client, provider, Arc::new(KeywordAnalyzer), logger)
    }

    /// Build an executor with injected source provider and analyzer.
    pub fn with_seams(
        config: VerificationConfig,
        kv: Arc<dyn KvStore>,
        client: Arc<GuardedClient>,
        provider: Arc<dyn SourceProvider>,
        analyzer: Arc<dyn EvidenceAnalyzer>,
        logger: &Logger,
    ) -> Self {
        let permits = config.max_concurrent_verifications.max(1);
        Self {
            config,
            kv,
            client,
            provider,
            analyzer,
            semaphore: Arc::new(Semaphore::new(permits)),
            logger: logger.child(LogContext::component("verification")),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Verify a claim. Always returns a record; failures degrade the
    /// verdict rather than erroring.
    pub async fn verify(&self, claim: &str) -> VerificationRecord {
        let started = Instant::now();
        let hash = claim_hash(claim);

        if !self.config.enabled {
            return self.unverifiable(&hash, "verification is disabled", started);
        }

        // Cache hit: return with the age noted.
        let cache_key = format!("{}:{}", CACHE_PREFIX, hash);
        if let Ok(Some(raw)) = self.kv.get(&cache_key).await {
            if let Ok(mut record) = serde_json::from_str::<VerificationRecord>(&raw) {
                let now = self.clock.now();
                if record.expires_at > now {
                    record.cache_age_secs =
                        Some((now - record.cached_at).num_seconds().max(0) as u64);
                    return record;
                }
            }
        }

        let deadline = started + std::time::Duration::from_millis(self.config.budget_ms);
        let candidates = self
            .provider
            .candidates(claim, self.config.max_verifications_per_request);

        let fetch_started = Instant::now();
        let (trusted, general): (Vec<_>, Vec<_>) =
            candidates.into_iter().partition(|c| c.trusted);

        let mut outcomes = self.fetch_stage(claim, trusted, deadline).await;
        let trusted_support = outcomes
            .iter()
            .filter(|o| o.signal == EvidenceSignal::Corroborates)
            .count();
        if trusted_support == 0 && Instant::now() < deadline {
            outcomes.extend(self.fetch_stage(claim, general, deadline).await);
        }
        let fetch_ms = fetch_started.elapsed().as_millis() as u64;

        if outcomes.is_empty() {
            let reason = if Instant::now() >= deadline {
                "verification budget exhausted before any source responded"
            } else {
                "no source could be fetched"
            };
            return self.unverifiable(&hash, reason, started);
        }

        let analysis_started = Instant::now();
        let record = self.compose(&hash, outcomes, started, fetch_ms, analysis_started);

        if let Ok(raw) = serde_json::to_string(&record) {
            if let Err(err) = self
                .kv
                .set(&cache_key, &raw, Some(self.config.cache_ttl_secs))
                .await
            {
                self.logger
                    .warn(&format!("verdict cache write failed: {}", err));
            }
        }

        record
    }

    /// Fetch one stage of candidates concurrently under the semaphore and
    /// the budget deadline. Results landing after the deadline are
    /// discarded.
    async fn fetch_stage(
        &self,
        claim: &str,
        candidates: Vec<CandidateSource>,
        deadline: Instant,
    ) -> Vec<SourceOutcome> {
        let fetches = candidates.into_iter().filter_map(|candidate| {
            if Instant::now() >= deadline {
                // Budget spent: stop spawning.
                return None;
            }
            let semaphore = self.semaphore.clone();
            let client = self.client.clone();
            let analyzer = self.analyzer.clone();
            let claim = claim.to_string();
            Some(async move {
                let _permit = semaphore.acquire().await.ok()?;
                let request = OutboundRequest::get().with_deadline(deadline);
                let response = client.fetch(&candidate.url, request).await.ok()?;
                if Instant::now() >= deadline || !response.is_success() {
                    return None;
                }
                let body = String::from_utf8_lossy(&response.body).into_owned();
                let signal = analyzer.assess(&claim, &body);
                let excerpt = match signal {
                    EvidenceSignal::Corroborates => Some(snippet(&body)),
                    _ => None,
                };
                Some(SourceOutcome {
                    source: SourceRef {
                        domain: candidate.domain,
                        url: candidate.url,
                        trusted: candidate.trusted,
                    },
                    signal,
                    excerpt,
                })
            })
        });

        join_all(fetches).await.into_iter().flatten().collect()
    }

    /// Verdict composition. Corroborations accumulate support with trusted
    /// sources weighted far above general ones; conflicts accumulate
    /// opposition the same way. Confidence is monotonic in the number of
    /// corroborating trusted sources.
    fn compose(
        &self,
        hash: &str,
        outcomes: Vec<SourceOutcome>,
        started: Instant,
        fetch_ms: u64,
        analysis_started: Instant,
    ) -> VerificationRecord {
        const TRUSTED_SUPPORT: f64 = 0.45;
        const GENERAL_SUPPORT: f64 = 0.20;
        const TRUSTED_OPPOSE: f64 = 0.40;
        const GENERAL_OPPOSE: f64 = 0.15;

        let mut support = 0.0_f64;
        let mut oppose = 0.0_f64;
        let mut corroborating_trusted = 0usize;
        let mut corroborating = 0usize;
        let mut conflicting = 0usize;
        let mut evidence: Option<String> = None;

        for outcome in &outcomes {
            match outcome.signal {
                EvidenceSignal::Corroborates => {
                    corroborating += 1;
                    if outcome.source.trusted {
                        corroborating_trusted += 1;
                    }
                    let weight = if outcome.source.trusted {
                        TRUSTED_SUPPORT
                    } else {
                        GENERAL_SUPPORT
                    };
                    support = 1.0 - (1.0 - support) * (1.0 - weight);
                    if evidence.is_none() {
                        evidence = outcome.excerpt.clone();
                    }
                }
                EvidenceSignal::Conflicts => {
                    conflicting += 1;
                    let weight = if outcome.source.trusted {
                        TRUSTED_OPPOSE
                    } else {
                        GENERAL_OPPOSE
                    };
                    oppose = 1.0 - (1.0 - oppose) * (1.0 - weight);
                }
                EvidenceSignal::Inconclusive => {}
            }
        }

        let score = (support * (1.0 - oppose)).clamp(0.0, 1.0);
        let (status, confidence) = if oppose >= 0.5 && support < 0.3 {
            (VerdictStatus::Refuted, oppose)
        } else if oppose >= 0.3 && oppose > support {
            (VerdictStatus::LikelyFalse, oppose)
        } else if score >= 0.7 && corroborating_trusted >= 1 {
            (VerdictStatus::Verified, score)
        } else if score >= 0.4 {
            (VerdictStatus::LikelyTrue, score)
        } else {
            (VerdictStatus::Uncertain, score.max(0.05))
        };

        let explanation = format!(
            "{} of {} sources corroborate ({} trusted), {} conflict",
            corroborating,
            outcomes.len(),
            corroborating_trusted,
            conflicting
        );

        let now = self.clock.now();
        VerificationRecord {
            claim_hash: hash.to_string(),
            status,
            confidence: (confidence * 1000.0).round() / 1000.0,
            sources: outcomes.into_iter().map(|o| o.source).collect(),
            evidence,
            explanation,
            timing: VerificationTiming {
                total_ms: started.elapsed().as_millis() as u64,
                fetch_ms: Some(fetch_ms),
                analysis_ms: Some(analysis_started.elapsed().as_millis() as u64),
            },
            cached_at: now,
            expires_at: now + ChronoDuration::seconds(self.config.cache_ttl_secs as i64),
            cache_age_secs: None,
        }
    }

    fn unverifiable(&self, hash: &str, explanation: &str, started: Instant) -> VerificationRecord {
        let now = self.clock.now();
        VerificationRecord {
            claim_hash: hash.to_string(),
            status: VerdictStatus::Unverifiable,
            confidence: 0.0,
            sources: Vec::new(),
            evidence: None,
            explanation: explanation.to_string(),
            timing: VerificationTiming {
                total_ms: started.elapsed().as_millis() as u64,
                fetch_ms: None,
                analysis_ms: None,
            },
            cached_at: now,
            expires_at: now,
            cache_age_secs: None,
        }
    }
}

/// A short, whitespace-flattened excerpt for the evidence field.
fn snippet(body: &str) -> String {
    let flat = body.split_whitespace().collect::<Vec<_>>().join(" ");
    flat.chars().take(240).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchConfig;
    use crate::logging::{LoggerConfig, MemorySink};
    use crate::kv::MemoryKv;
    use crate::net::{ScriptedTransport, SsrfGuard, StaticResolver};
    use proptest::prelude::*;

    fn quiet_logger() -> Logger {
        Logger::with_sink(LoggerConfig::default(), Arc::new(MemorySink::new()))
    }

    struct FixedProvider(Vec<CandidateSource>);

    impl SourceProvider for FixedProvider {
        fn candidates(&self, _claim: &str, max: usize) -> Vec<CandidateSource> {
            self.0.iter().take(max).cloned().collect()
        }
    }

    fn source(domain: &str, trusted: bool) -> CandidateSource {
        CandidateSource {
            url: format!("https://{}/search?q=x", domain),
            domain: domain.to_string(),
            trusted,
        }
    }

    fn executor_with(
        transport: Arc<ScriptedTransport>,
        provider: Arc<dyn SourceProvider>,
        kv: Arc<MemoryKv>,
        enabled: bool,
    ) -> VerificationExecutor {
        let resolver = Arc::new(StaticResolver::new());
        for host in ["trusted.test", "general.test", "wikipedia.org", "duckduckgo.com"] {
            resolver.insert(host, vec!["93.184.216.34".parse().unwrap()]);
        }
        let logger = quiet_logger();
        let guard = Arc::new(SsrfGuard::new(
            FetchConfig {
                enabled: true,
                ..FetchConfig::default()
            },
            resolver,
            &logger,
        ));
        let client = Arc::new(GuardedClient::new(guard, transport));
        let config = VerificationConfig {
            enabled,
            ..VerificationConfig::default()
        };
        VerificationExecutor::with_seams(
            config,
            kv,
            client,
            provider,
            Arc::new(KeywordAnalyzer),
            &logger,
        )
    }

    #[test]
    fn normalization_collapses_and_folds() {
        assert_eq!(
            normalize_claim("  The   Moon\torbits\nEarth "),
            "the moon orbits earth"
        );
    }

    #[test]
    fn equivalent_claims_share_a_hash() {
        assert_eq!(
            claim_hash("The Moon orbits Earth"),
            claim_hash("  the   moon ORBITS earth\n")
        );
        assert_ne!(claim_hash("a"), claim_hash("b"));
        assert_eq!(claim_hash("x").len(), 64);
    }

    #[test]
    fn keyword_analyzer_signals() {
        let analyzer = KeywordAnalyzer;
        assert_eq!(
            analyzer.assess(
                "water boils at one hundred degrees",
                "At sea level, water boils at one hundred degrees Celsius."
            ),
            EvidenceSignal::Corroborates
        );
        assert_eq!(
            analyzer.assess(
                "water boils at one hundred degrees",
                "The idea that water boils at one hundred degrees everywhere is a myth."
            ),
            EvidenceSignal::Conflicts
        );
        assert_eq!(
            analyzer.assess("water boils", "entirely unrelated text"),
            EvidenceSignal::Inconclusive
        );
    }

    #[tokio::test]
    async fn disabled_executor_returns_unverifiable_with_hash() {
        let transport = Arc::new(ScriptedTransport::new());
        let provider = Arc::new(FixedProvider(vec![source("trusted.test", true)]));
        let executor = executor_with(transport, provider, Arc::new(MemoryKv::new()), false);

        let record = executor.verify("the sky is blue").await;
        assert_eq!(record.status, VerdictStatus::Unverifiable);
        assert_eq!(record.confidence, 0.0);
        assert_eq!(record.claim_hash, claim_hash("the sky is blue"));
    }

    #[tokio::test]
    async fn trusted_corroboration_verifies() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_response(
            200,
            b"Multiple studies confirm the sky appears blue due to Rayleigh scattering.",
        );
        let provider = Arc::new(FixedProvider(vec![
            source("trusted.test", true),
            source("general.test", false),
        ]));
        let executor = executor_with(transport, provider, Arc::new(MemoryKv::new()), true);

        let record = executor.verify("the sky appears blue").await;
        assert!(matches!(
            record.status,
            VerdictStatus::Verified | VerdictStatus::LikelyTrue
        ));
        assert!(record.confidence > 0.3);
        assert!(record.sources.iter().any(|s| s.trusted));
        assert!(record.timing.fetch_ms.is_some());
    }

    #[tokio::test]
    async fn verdicts_are_cached_and_age_is_noted() {
        let kv = Arc::new(MemoryKv::new());
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_response(200, b"the sky appears blue everywhere you look");
        let provider = Arc::new(FixedProvider(vec![source("trusted.test", true)]));
        let executor = executor_with(transport.clone(), provider, kv.clone(), true);

        let first = executor.verify("the sky appears blue").await;
        assert!(first.cache_age_secs.is_none());
        assert!(kv
            .exists(&format!("verify:v1:{}", first.claim_hash))
            .await
            .unwrap());

        let fetches_before = transport.executed().len();
        let second = executor.verify("THE SKY   appears blue").await;
        assert!(second.cache_age_secs.is_some());
        assert_eq!(second.claim_hash, first.claim_hash);
        // No new fetches on the hit.
        assert_eq!(transport.executed().len(), fetches_before);
    }

    #[tokio::test]
    async fn fetch_failures_degrade_to_unverifiable() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_error("connection refused");
        let provider = Arc::new(FixedProvider(vec![source("trusted.test", true)]));
        let executor = executor_with(transport, provider, Arc::new(MemoryKv::new()), true);

        let record = executor.verify("anything at all").await;
        assert_eq!(record.status, VerdictStatus::Unverifiable);
    }

    #[tokio::test]
    async fn conflicts_push_toward_refuted() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_response(
            200,
            b"This claim that the earth is flat has been thoroughly debunked; the claim is false.",
        );
        let provider = Arc::new(FixedProvider(vec![source("trusted.test", true)]));
        let executor = executor_with(transport, provider, Arc::new(MemoryKv::new()), true);

        let record = executor.verify("the earth is flat").await;
        assert!(matches!(
            record.status,
            VerdictStatus::Refuted | VerdictStatus::LikelyFalse
        ));
    }

    proptest! {
        #[test]
        fn hash_ignores_whitespace_shape(words in proptest::collection::vec("[a-z]{1,8}", 1..6)) {
            let tight = words.join(" ");
            let loose = words.join("  \t ");
            prop_assert_eq!(claim_hash(&tight), claim_hash(&format!("  {}  ", loose)));
        }
    }
}
