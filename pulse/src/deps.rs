//! Outbound dependency interceptor.
//!
//! Wraps a `reqwest::Client` under a dependency name chosen at wrap time;
//! every call through the wrapper is timed and recorded. When the caller
//! also supplies a [`BreakerProbe`], its state is surfaced alongside the
//! dependency's aggregates.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use crate::engine::Pulse;
use crate::model::DependencyMetric;

/// Optional circuit-breaker introspection for a wrapped dependency.
///
/// Implementations report `open`, `closed` or `half-open`.
pub trait BreakerProbe: Send + Sync {
    fn state(&self) -> &'static str;
}

/// An instrumented HTTP client for one named dependency.
#[derive(Clone)]
pub struct DependencyClient {
    name: String,
    client: reqwest::Client,
    pulse: Arc<Pulse>,
    breaker: Option<Arc<dyn BreakerProbe>>,
}

impl DependencyClient {
    pub(crate) fn new(name: String, client: reqwest::Client, pulse: Arc<Pulse>) -> Self {
        Self {
            name,
            client,
            pulse,
            breaker: None,
        }
    }

    /// Attach a circuit-breaker probe whose state shows up in the
    /// dependency's stats.
    #[must_use]
    pub fn with_breaker(mut self, breaker: Arc<dyn BreakerProbe>) -> Self {
        self.pulse
            .register_breaker(&self.name, Arc::clone(&breaker));
        self.breaker = Some(breaker);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current breaker state, when a probe is attached.
    pub fn breaker_state(&self) -> Option<&'static str> {
        self.breaker.as_ref().map(|b| b.state())
    }

    /// The wrapped client, for calls that must not be observed.
    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    /// Start building a request; the terminal [`Self::execute`] records it.
    pub fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client.request(method, url)
    }

    /// Convenience GET.
    pub async fn get(&self, url: &str) -> Result<reqwest::Response, reqwest::Error> {
        let request = self.client.get(url).build()?;
        self.execute(request).await
    }

    /// Execute a built request, recording one [`DependencyMetric`].
    pub async fn execute(
        &self,
        request: reqwest::Request,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let method = request.method().to_string();
        let url = request.url().to_string();
        let request_bytes = request
            .body()
            .and_then(reqwest::Body::as_bytes)
            .map_or(0, |b| b.len() as u64);

        let started = Instant::now();
        let result = self.client.execute(request).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;

        let (status, response_bytes, error) = match &result {
            Ok(response) => (
                response.status().as_u16(),
                response.content_length().unwrap_or(0),
                None,
            ),
            Err(e) => (0, 0, Some(e.to_string())),
        };

        self.pulse.submit_dependency(DependencyMetric {
            name: self.name.clone(),
            method,
            url,
            status,
            latency_ms,
            request_bytes,
            response_bytes,
            error,
            timestamp: Utc::now(),
        });

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedBreaker(&'static str);

    impl BreakerProbe for FixedBreaker {
        fn state(&self) -> &'static str {
            self.0
        }
    }

    #[tokio::test]
    async fn breaker_state_is_surfaced() {
        let pulse = Pulse::start(crate::config::PulseConfig::default_for_test());
        let client = pulse
            .wrap_client(reqwest::Client::new(), "payments")
            .with_breaker(Arc::new(FixedBreaker("half-open")));
        assert_eq!(client.breaker_state(), Some("half-open"));
        assert_eq!(client.name(), "payments");
        pulse.shutdown().await;
    }
}
