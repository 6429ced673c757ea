//! Per-model failover chain
//!
//! A chain is the primary provider for a model followed by the fallback
//! models of the other configured endpoints. Each failure is sorted into an
//! [`ErrorClass`]: transient errors are retried on the same link after a
//! backoff, an overloaded upstream hands over to the next link at once, and
//! anything else skips straight to the next link.

use anyhow::{Result, anyhow, bail};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::types::{ChatRequest, ChatResponse, LlmProvider};

/// How a provider failure is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rate limits, 5xx, dropped connections: back off and retry this link
    Transient,
    /// Upstream saturated: move on without sleeping, so callers with a
    /// deadline still see the overload instead of a timeout
    Overloaded,
    /// Bad key, bad request and the like: retrying cannot help
    Fatal,
}

const OVERLOAD_MARKERS: [&str; 2] = ["overloaded", "529"];

const TRANSIENT_MARKERS: [&str; 12] = [
    "429",
    "500",
    "502",
    "503",
    "504",
    "rate limit",
    "rate_limit",
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "temporarily unavailable",
];

/// Sort a provider error by its full context chain
pub fn classify_error(err: &anyhow::Error) -> ErrorClass {
    let text = format!("{:#}", err).to_lowercase();
    if OVERLOAD_MARKERS.iter().any(|m| text.contains(m)) {
        ErrorClass::Overloaded
    } else if TRANSIENT_MARKERS.iter().any(|m| text.contains(m)) {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

pub struct ModelRouter {
    chain: Vec<Box<dyn LlmProvider>>,
    /// Tries per link for transient errors
    attempts: u32,
    /// First backoff; doubles on every further try of the same link
    backoff: Duration,
}

impl std::fmt::Debug for ModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRouter")
            .field("chain", &self.describe())
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl ModelRouter {
    pub fn new(chain: Vec<Box<dyn LlmProvider>>) -> Result<Self> {
        if chain.is_empty() {
            bail!("A model chain needs at least one provider");
        }
        Ok(Self {
            chain,
            attempts: 2,
            backoff: Duration::from_millis(500),
        })
    }

    /// Chain of one, tried once
    pub fn single(provider: Box<dyn LlmProvider>) -> Self {
        Self {
            chain: vec![provider],
            attempts: 1,
            backoff: Duration::from_millis(500),
        }
    }

    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    /// `provider/model` links joined by arrows, primary first
    pub fn describe(&self) -> String {
        self.chain
            .iter()
            .map(|p| format!("{}/{}", p.provider_name(), p.model()))
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub async fn chat(&self, request: &ChatRequest<'_>) -> Result<ChatResponse> {
        let mut last_error = None;

        for (link, provider) in self.chain.iter().enumerate() {
            match self.try_link(provider.as_ref(), request).await {
                Ok(response) => {
                    if link > 0 {
                        info!(
                            "Served by fallback {}/{}",
                            provider.provider_name(),
                            provider.model()
                        );
                    }
                    return Ok(response);
                }
                Err(e) => last_error = Some(e),
            }
        }

        let err = last_error.unwrap_or_else(|| anyhow!("empty model chain"));
        Err(err.context(format!("Every provider in [{}] failed", self.describe())))
    }

    async fn try_link(
        &self,
        provider: &dyn LlmProvider,
        request: &ChatRequest<'_>,
    ) -> Result<ChatResponse> {
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            let err = match provider.chat(request).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            let class = classify_error(&err);
            warn!(
                "{}/{} failed ({:?}, try {}/{}): {:#}",
                provider.provider_name(),
                provider.model(),
                class,
                attempt,
                self.attempts,
                err
            );
            if class != ErrorClass::Transient || attempt >= self.attempts {
                return Err(err);
            }
            debug!("Retrying {} in {:?}", provider.provider_name(), delay);
            tokio::time::sleep(delay).await;
            delay *= 2;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::super::types::{ChatUsage, ResponseFormat, StopReason};

    fn request() -> ChatRequest<'static> {
        ChatRequest {
            system: "system",
            messages: &[],
            temperature: None,
            format: ResponseFormat::Text,
        }
    }

    /// Fails `failures` times with `error`, then answers with its own name
    struct Flaky {
        name: &'static str,
        error: &'static str,
        failures: u32,
        calls: Arc<AtomicU32>,
    }

    impl Flaky {
        fn boxed(
            name: &'static str,
            error: &'static str,
            failures: u32,
        ) -> (Box<dyn LlmProvider>, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            let provider = Flaky {
                name,
                error,
                failures,
                calls: calls.clone(),
            };
            (Box::new(provider), calls)
        }
    }

    #[async_trait]
    impl LlmProvider for Flaky {
        fn provider_name(&self) -> &str {
            self.name
        }
        fn model(&self) -> &str {
            "m1"
        }
        async fn chat(&self, _request: &ChatRequest<'_>) -> Result<ChatResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(anyhow!("{}", self.error));
            }
            Ok(ChatResponse {
                text: self.name.to_string(),
                stop_reason: StopReason::EndTurn,
                usage: ChatUsage::default(),
            })
        }
    }

    #[test]
    fn test_classify_error() {
        let class = |s: &str| classify_error(&anyhow!("{}", s));
        assert_eq!(class("status 529: Overloaded"), ErrorClass::Overloaded);
        assert_eq!(class("overloaded_error"), ErrorClass::Overloaded);
        assert_eq!(class("status 429: rate limit exceeded"), ErrorClass::Transient);
        assert_eq!(class("request timed out"), ErrorClass::Transient);
        assert_eq!(class("status 401: unauthorized"), ErrorClass::Fatal);

        let wrapped = anyhow!("status 503").context("Anthropic request failed");
        assert_eq!(classify_error(&wrapped), ErrorClass::Transient);
    }

    #[test]
    fn test_empty_chain_rejected() {
        assert!(ModelRouter::new(vec![]).is_err());
    }

    #[test]
    fn test_describe_lists_links_in_order() {
        let (a, _) = Flaky::boxed("anthropic", "", 0);
        let (b, _) = Flaky::boxed("openai", "", 0);
        let router = ModelRouter::new(vec![a, b]).unwrap();
        assert_eq!(router.describe(), "anthropic/m1 -> openai/m1");
        assert_eq!(router.len(), 2);
    }

    #[tokio::test]
    async fn test_transient_error_retries_same_link() {
        let (primary, calls) = Flaky::boxed("primary", "status 503", 1);
        let (fallback, fallback_calls) = Flaky::boxed("fallback", "", 0);
        let router = ModelRouter::new(vec![primary, fallback])
            .unwrap()
            .with_retry(3, Duration::from_millis(1));

        let response = router.chat(&request()).await.unwrap();
        assert_eq!(response.text, "primary");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fatal_error_moves_on_without_retrying() {
        let (primary, calls) = Flaky::boxed("primary", "status 401: unauthorized", 5);
        let (fallback, _) = Flaky::boxed("fallback", "", 0);
        let router = ModelRouter::new(vec![primary, fallback])
            .unwrap()
            .with_retry(3, Duration::from_millis(1));

        assert_eq!(router.chat(&request()).await.unwrap().text, "fallback");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_overload_hands_over_without_backoff() {
        let (primary, calls) = Flaky::boxed("primary", "status 529: Overloaded", 5);
        let (fallback, _) = Flaky::boxed("fallback", "", 0);
        // a backoff this long would stall the test if it were honoured
        let router = ModelRouter::new(vec![primary, fallback])
            .unwrap()
            .with_retry(3, Duration::from_secs(600));

        let response = tokio::time::timeout(Duration::from_secs(5), router.chat(&request()))
            .await
            .expect("no backoff on overload")
            .unwrap();
        assert_eq!(response.text, "fallback");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_chain_keeps_last_error() {
        let (a, _) = Flaky::boxed("a", "status 401", 5);
        let (b, _) = Flaky::boxed("b", "status 529: Overloaded", 5);
        let router = ModelRouter::new(vec![a, b]).unwrap();

        let err = router.chat(&request()).await.unwrap_err();
        let text = format!("{:#}", err);
        assert!(text.contains("Every provider in [a/m1 -> b/m1] failed"));
        assert!(text.contains("Overloaded"));
    }
}
