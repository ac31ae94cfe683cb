//! Redirect guard.
//!
//! Wraps transport so every hop of a redirect chain goes through the *full*
//! SSRF check, with no shortcuts for "same host" or "already checked". Loops
//! are detected over the set of normalized URLs visited; the hop count is
//! bounded by the guard decision's `max_redirects`. Method semantics follow
//! the standard: 307/308 preserve method and body, 301/302/303 degrade to
//! GET with an empty body. The caller's deadline propagates across hops.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use super::ssrf::SsrfGuard;
use super::transport::{HttpTransport, OutboundRequest, TransportResponse};
use super::url::parse_url;
use crate::error::{CoreError, CoreResult};

/// Guarded HTTP client: SSRF check, pinned transport, guarded redirects.
pub struct GuardedClient {
    guard: Arc<SsrfGuard>,
    transport: Arc<dyn HttpTransport>,
}

impl GuardedClient {
    /// Compose a guard and a transport.
    pub fn new(guard: Arc<SsrfGuard>, transport: Arc<dyn HttpTransport>) -> Self {
        Self { guard, transport }
    }

    /// Fetch a URL, following redirects under guard when the policy allows
    /// them. Every hop re-runs the full SSRF check against the new URL.
    pub async fn fetch(
        &self,
        url: &str,
        request: OutboundRequest,
    ) -> CoreResult<TransportResponse> {
        let mut current_url = url.to_string();
        let mut current_request = request;
        let mut visited: HashSet<String> = HashSet::new();
        let mut hops: u32 = 0;

        loop {
            if let Some(deadline) = current_request.deadline {
                if Instant::now() >= deadline {
                    return Err(CoreError::Cancelled);
                }
            }

            let decision = self.guard.check(&current_url).await;
            let requirements = match decision.transport {
                Some(requirements) => requirements,
                None => {
                    return Err(CoreError::PolicyDenied {
                        reason: decision
                            .deny_reason
                            .unwrap_or_else(|| "POLICY_DENIED".to_string()),
                        detail: decision.message,
                    });
                }
            };

            if let Ok(parsed) = parse_url(&current_url) {
                visited.insert(parsed.normalized());
            }

            let response = self
                .transport
                .execute(&requirements, current_request.clone())
                .await
                .map_err(CoreError::from)?;

            let Some(location) = response.redirect_location().map(|s| s.to_string()) else {
                return Ok(response);
            };
            if !requirements.allow_redirects {
                return Ok(response);
            }

            hops += 1;
            if hops > requirements.max_redirects {
                return Err(CoreError::PolicyDenied {
                    reason: "TOO_MANY_REDIRECTS".to_string(),
                    detail: Some(format!("exceeded {} hops", requirements.max_redirects)),
                });
            }

            let next_url = resolve_location(&current_url, &location)?;
            let next_normalized = parse_url(&next_url)?.normalized();
            if visited.contains(&next_normalized) {
                return Err(CoreError::PolicyDenied {
                    reason: "REDIRECT_LOOP".to_string(),
                    detail: Some(next_normalized),
                });
            }

            // 303 (and the legacy 301/302) switch to GET and drop the body;
            // 307/308 replay the request as-is.
            if matches!(response.status, 301 | 302 | 303) {
                current_request.method = reqwest::Method::GET;
                current_request.body = None;
            }

            tracing::debug!(from = %current_url, to = %next_url, hop = hops, "following redirect");
            current_url = next_url;
        }
    }
}

/// Resolve a `Location` header against the current URL; relative targets
/// are joined, absolute targets stand alone.
fn resolve_location(base: &str, location: &str) -> CoreResult<String> {
    let base_url = url::Url::parse(base)
        .map_err(|e| CoreError::MalformedInput(format!("invalid base url: {}", e)))?;
    let joined = base_url
        .join(location)
        .map_err(|e| CoreError::MalformedInput(format!("invalid redirect target: {}", e)))?;
    Ok(joined.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchConfig;
    use crate::error::ErrorKind;
    use crate::logging::{Logger, LoggerConfig, MemorySink};
    use crate::net::dns::StaticResolver;
    use crate::net::transport::ScriptedTransport;

    fn client_with(
        config: FetchConfig,
        resolver: Arc<StaticResolver>,
        transport: Arc<ScriptedTransport>,
    ) -> GuardedClient {
        let logger = Logger::with_sink(LoggerConfig::default(), Arc::new(MemorySink::new()));
        let guard = Arc::new(SsrfGuard::new(config, resolver, &logger));
        GuardedClient::new(guard, transport)
    }

    fn resolver_for(hosts: &[&str]) -> Arc<StaticResolver> {
        let resolver = Arc::new(StaticResolver::new());
        for host in hosts {
            resolver.insert(host, vec!["93.184.216.34".parse().unwrap()]);
        }
        resolver
    }

    fn fetch_config() -> FetchConfig {
        FetchConfig {
            enabled: true,
            ..FetchConfig::default()
        }
    }

    #[tokio::test]
    async fn plain_fetch_returns_response() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_response(200, b"hello");
        let client = client_with(fetch_config(), resolver_for(&["a.test"]), transport);

        let response = client
            .fetch("http://a.test/", OutboundRequest::get())
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hello");
    }

    #[tokio::test]
    async fn redirects_are_followed_under_guard() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_redirect(302, "http://b.test/next");
        transport.push_response(200, b"done");
        let resolver = resolver_for(&["a.test", "b.test"]);
        let client = client_with(fetch_config(), resolver.clone(), transport.clone());

        let response = client
            .fetch("http://a.test/", OutboundRequest::post(b"data".to_vec()))
            .await
            .unwrap();
        assert_eq!(response.status, 200);

        // Both hostnames were resolved: each hop ran the full check.
        assert_eq!(resolver.lookups(), vec!["a.test", "b.test"]);

        // 302 degraded the replayed request to GET with no body.
        let executed = transport.executed();
        assert_eq!(executed.len(), 2);
        assert_eq!(executed[1].1.method, reqwest::Method::GET);
        assert!(executed[1].1.body.is_none());
    }

    #[tokio::test]
    async fn preserving_redirects_keep_method_and_body() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_redirect(307, "http://b.test/next");
        transport.push_response(200, b"done");
        let client = client_with(
            fetch_config(),
            resolver_for(&["a.test", "b.test"]),
            transport.clone(),
        );

        client
            .fetch("http://a.test/", OutboundRequest::post(b"data".to_vec()))
            .await
            .unwrap();

        let executed = transport.executed();
        assert_eq!(executed[1].1.method, reqwest::Method::POST);
        assert_eq!(executed[1].1.body.as_deref(), Some(b"data".as_slice()));
    }

    #[tokio::test]
    async fn redirect_to_blocked_target_is_denied() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_redirect(302, "http://169.254.169.254/latest/meta-data/");
        let client = client_with(fetch_config(), resolver_for(&["a.test"]), transport);

        let err = client
            .fetch("http://a.test/", OutboundRequest::get())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PolicyDenied);
    }

    #[tokio::test]
    async fn redirect_loop_is_detected() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_redirect(302, "http://b.test/");
        transport.push_redirect(302, "http://a.test/");
        let client = client_with(fetch_config(), resolver_for(&["a.test", "b.test"]), transport);

        let err = client
            .fetch("http://a.test/", OutboundRequest::get())
            .await
            .unwrap_err();
        match err {
            CoreError::PolicyDenied { reason, .. } => assert_eq!(reason, "REDIRECT_LOOP"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn hop_budget_is_enforced() {
        let transport = Arc::new(ScriptedTransport::new());
        // Endless chain of distinct targets.
        transport.push_redirect(302, "http://b.test/1");
        transport.push_redirect(302, "http://a.test/2");
        transport.push_redirect(302, "http://b.test/3");
        transport.push_redirect(302, "http://a.test/4");
        let mut config = fetch_config();
        config.max_redirects = 2;
        let client = client_with(config, resolver_for(&["a.test", "b.test"]), transport);

        let err = client
            .fetch("http://a.test/", OutboundRequest::get())
            .await
            .unwrap_err();
        match err {
            CoreError::PolicyDenied { reason, .. } => assert_eq!(reason, "TOO_MANY_REDIRECTS"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn redirects_are_not_followed_when_disabled() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_redirect(302, "http://b.test/");
        let mut config = fetch_config();
        config.allow_redirects = false;
        let client = client_with(config, resolver_for(&["a.test"]), transport.clone());

        let response = client
            .fetch("http://a.test/", OutboundRequest::get())
            .await
            .unwrap();
        assert_eq!(response.status, 302);
        assert_eq!(transport.executed().len(), 1);
    }

    #[tokio::test]
    async fn relative_locations_resolve_against_base() {
        assert_eq!(
            resolve_location("http://a.test/x/y", "/z").unwrap(),
            "http://a.test/z"
        );
        assert_eq!(
            resolve_location("http://a.test/x/", "next").unwrap(),
            "http://a.test/x/next"
        );
        assert_eq!(
            resolve_location("http://a.test/", "https://b.test/q").unwrap(),
            "https://b.test/q"
        );
    }
}
