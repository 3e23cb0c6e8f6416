use dashmap::DashMap;
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::chunking::split_into_chunks;
use super::types::{GenerateParams, Generation, ProviderAdapter, ProviderError, RouterError};
use crate::config::LlmConfig;
use crate::models::StreamEvent;

/// Normalized router output. Ends with `Err(AllProvidersFailed)` when every
/// provider failed.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, RouterError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStrategy {
    /// Try providers in priority order, fall back on failure
    Primary,
}

impl RoutingStrategy {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "primary" | "" => RoutingStrategy::Primary,
            other => {
                warn!("Routing strategy '{}' is not supported, using primary fallback", other);
                RoutingStrategy::Primary
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub timeout: Duration,
    /// Reserved for hedged requests, not used by the primary strategy
    pub hedge_delay: Duration,
    pub strategy: RoutingStrategy,
    pub chunk_max_chars: usize,
}

impl RouterConfig {
    pub fn from_settings(config: &LlmConfig) -> Self {
        Self {
            timeout: config.request_timeout(),
            hedge_delay: Duration::from_millis(config.hedge_delay_ms),
            strategy: RoutingStrategy::parse(&config.routing_strategy),
            chunk_max_chars: config.chunk_max_chars,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(15_000),
            hedge_delay: Duration::from_millis(250),
            strategy: RoutingStrategy::Primary,
            chunk_max_chars: 40,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Generated {
    pub text: String,
    pub provider: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub latency_ms: Option<u64>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouterHealth {
    pub status: String,
    pub active_providers: usize,
    pub total_providers: usize,
}

/// Selects a live provider, falls back across the rest, and normalizes their
/// output into [`StreamEvent`]s.
pub struct ProviderRouter {
    providers: Vec<Arc<dyn ProviderAdapter>>,
    /// provider name -> last observed latency in seconds
    latency: Arc<DashMap<String, f64>>,
    config: RouterConfig,
}

impl ProviderRouter {
    pub fn new(providers: Vec<Arc<dyn ProviderAdapter>>, config: RouterConfig) -> Self {
        info!(
            "Provider router ready: {} providers ({} active), timeout={:?}, strategy={:?}",
            providers.len(),
            providers.iter().filter(|p| p.is_enabled()).count(),
            config.timeout,
            config.strategy
        );
        Self {
            providers,
            latency: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Enabled providers in priority order
    pub fn active_providers(&self) -> Vec<Arc<dyn ProviderAdapter>> {
        self.providers
            .iter()
            .filter(|p| p.is_enabled())
            .cloned()
            .collect()
    }

    /// Buffered generation with primary-then-fallback
    pub async fn generate(&self, params: &GenerateParams) -> Result<Generated, RouterError> {
        let active = self.active_providers();
        if active.is_empty() {
            warn!("No LLM providers enabled");
            return Err(RouterError::NoProvidersAvailable);
        }

        let mut last_error = None;
        for provider in active {
            let name = provider.name().to_string();
            let started = Instant::now();

            let outcome = timeout(self.config.timeout, async {
                provider.generate(params).await?.collect().await
            })
            .await
            .unwrap_or(Err(ProviderError::Timeout(self.config.timeout)));

            match outcome {
                Ok(text) => {
                    record_latency(&self.latency, &name, started.elapsed());
                    debug!("Provider {} answered in {:?}", name, started.elapsed());
                    return Ok(Generated { text, provider: name });
                }
                Err(e) => {
                    warn!("Provider {} failed: {}", name, e);
                    last_error = Some(format!("{}: {}", name, e));
                }
            }
        }

        Err(RouterError::AllProvidersFailed { last_error })
    }

    /// Streaming generation.
    ///
    /// Fails up front with `NoProvidersAvailable` (no events at all) when
    /// nothing is enabled. Otherwise every attempt emits `start` once its
    /// stream is obtained, deltas as fragments arrive, then `complete`. A
    /// failing provider gets an `error` event naming it and the next one is
    /// tried. Output already sent is never retracted.
    pub fn generate_stream(&self, params: GenerateParams) -> Result<EventStream, RouterError> {
        let active = self.active_providers();
        if active.is_empty() {
            warn!("No LLM providers enabled");
            return Err(RouterError::NoProvidersAvailable);
        }

        let latency = Arc::clone(&self.latency);
        let config = self.config.clone();

        let stream = async_stream::stream! {
            let mut last_error: Option<String> = None;

            for provider in active {
                let name = provider.name().to_string();
                let started = Instant::now();

                let generation = match timeout(config.timeout, provider.generate(&params)).await {
                    Ok(Ok(generation)) => generation,
                    Ok(Err(e)) => {
                        warn!("Provider {} failed to start: {}", name, e);
                        last_error = Some(format!("{}: {}", name, e));
                        yield Ok(StreamEvent::provider_error(&name, e.to_string()));
                        continue;
                    }
                    Err(_) => {
                        let e = ProviderError::Timeout(config.timeout);
                        warn!("Provider {} failed to start: {}", name, e);
                        last_error = Some(format!("{}: {}", name, e));
                        yield Ok(StreamEvent::provider_error(&name, e.to_string()));
                        continue;
                    }
                };

                yield Ok(StreamEvent::provider_start(&name));

                match generation {
                    Generation::Text(text) => {
                        record_latency(&latency, &name, started.elapsed());
                        for piece in split_into_chunks(&text, config.chunk_max_chars) {
                            yield Ok(StreamEvent::delta(piece));
                        }
                        yield Ok(StreamEvent::Complete { conversation_id: None });
                        return;
                    }
                    Generation::Stream(mut fragments) => {
                        let mut first_fragment = true;
                        let mut failure: Option<ProviderError> = None;

                        loop {
                            match timeout(config.timeout, fragments.next()).await {
                                Ok(Some(Ok(fragment))) => {
                                    if first_fragment {
                                        record_latency(&latency, &name, started.elapsed());
                                        first_fragment = false;
                                    }
                                    if !fragment.is_empty() {
                                        yield Ok(StreamEvent::delta(fragment));
                                    }
                                }
                                Ok(Some(Err(e))) => {
                                    failure = Some(e);
                                    break;
                                }
                                Ok(None) => break,
                                Err(_) => {
                                    failure = Some(ProviderError::Timeout(config.timeout));
                                    break;
                                }
                            }
                        }

                        match failure {
                            None => {
                                if first_fragment {
                                    record_latency(&latency, &name, started.elapsed());
                                }
                                yield Ok(StreamEvent::Complete { conversation_id: None });
                                return;
                            }
                            Some(e) => {
                                warn!("Provider {} failed mid-stream: {}", name, e);
                                last_error = Some(format!("{}: {}", name, e));
                                yield Ok(StreamEvent::provider_error(&name, e.to_string()));
                            }
                        }
                    }
                }
            }

            warn!("All providers failed, last error: {:?}", last_error);
            yield Ok(StreamEvent::error("All providers failed"));
            yield Err(RouterError::AllProvidersFailed { last_error });
        };

        Ok(Box::pin(stream))
    }

    pub fn providers_report(&self) -> Vec<ProviderStatus> {
        self.providers
            .iter()
            .map(|provider| {
                let name = provider.name().to_string();
                let latency_ms = self
                    .latency
                    .get(&name)
                    .map(|seconds| (*seconds * 1000.0).round() as u64);
                ProviderStatus {
                    name,
                    latency_ms,
                    status: if provider.is_enabled() { "active" } else { "disabled" }.to_string(),
                }
            })
            .collect()
    }

    pub fn health(&self) -> RouterHealth {
        RouterHealth {
            status: "ok".to_string(),
            active_providers: self.active_providers().len(),
            total_providers: self.providers.len(),
        }
    }
}

fn record_latency(latency: &DashMap<String, f64>, provider: &str, elapsed: Duration) {
    latency.insert(provider.to_string(), elapsed.as_secs_f64());
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// What a scripted provider does when called
    #[derive(Clone)]
    pub enum Script {
        Text(String),
        Fragments(Vec<String>),
        /// Yields these fragments, then fails
        FailAfter(Vec<String>),
        Fail(String),
        Hang,
    }

    pub struct ScriptedProvider {
        pub name: String,
        pub enabled: bool,
        pub script: Script,
        pub calls: Mutex<Vec<GenerateParams>>,
    }

    impl ScriptedProvider {
        pub fn new(name: &str, script: Script) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                enabled: true,
                script,
                calls: Mutex::new(Vec::new()),
            })
        }

        pub fn disabled(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                enabled: false,
                script: Script::Fail("disabled provider was called".to_string()),
                calls: Mutex::new(Vec::new()),
            })
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_enabled(&self) -> bool {
            self.enabled
        }

        async fn generate(&self, params: &GenerateParams) -> Result<Generation, ProviderError> {
            self.calls.lock().push(params.clone());
            match &self.script {
                Script::Text(text) => Ok(Generation::Text(text.clone())),
                Script::Fragments(fragments) => {
                    let items: Vec<Result<String, ProviderError>> =
                        fragments.iter().cloned().map(Ok).collect();
                    Ok(Generation::Stream(Box::pin(futures::stream::iter(items))))
                }
                Script::FailAfter(fragments) => {
                    let mut items: Vec<Result<String, ProviderError>> =
                        fragments.iter().cloned().map(Ok).collect();
                    items.push(Err(ProviderError::Decode("connection reset".to_string())));
                    Ok(Generation::Stream(Box::pin(futures::stream::iter(items))))
                }
                Script::Fail(message) => Err(ProviderError::Api { status: 500, body: message.clone() }),
                Script::Hang => futures::future::pending().await,
            }
        }
    }

    pub fn router_with(providers: Vec<Arc<ScriptedProvider>>) -> ProviderRouter {
        let adapters = providers
            .into_iter()
            .map(|p| p as Arc<dyn ProviderAdapter>)
            .collect();
        ProviderRouter::new(
            adapters,
            RouterConfig {
                timeout: Duration::from_millis(200),
                chunk_max_chars: 10,
                ..RouterConfig::default()
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    async fn drain(stream: EventStream) -> (Vec<StreamEvent>, Option<RouterError>) {
        let mut events = Vec::new();
        let mut terminal = None;
        let mut stream = stream;
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => events.push(event),
                Err(e) => terminal = Some(e),
            }
        }
        (events, terminal)
    }

    fn names(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::name).collect()
    }

    #[tokio::test]
    async fn test_non_stream_falls_back_in_priority_order() {
        let first = ScriptedProvider::new("first", Script::Fail("boom".into()));
        let second = ScriptedProvider::new("second", Script::Fail("rate limited".into()));
        let third = ScriptedProvider::new("third", Script::Text("answer".into()));
        let fourth = ScriptedProvider::new("fourth", Script::Text("unused".into()));
        let router = router_with(vec![first.clone(), second.clone(), third.clone(), fourth.clone()]);

        let generated = router.generate(&GenerateParams::new("hi")).await.unwrap();

        assert_eq!(generated, Generated { text: "answer".into(), provider: "third".into() });
        assert_eq!(first.call_count(), 1);
        assert_eq!(second.call_count(), 1);
        assert_eq!(third.call_count(), 1);
        assert_eq!(fourth.call_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_emits_one_error_per_failed_provider() {
        let first = ScriptedProvider::new("first", Script::Fail("boom".into()));
        let second = ScriptedProvider::new("second", Script::FailAfter(vec!["par".into()]));
        let third = ScriptedProvider::new("third", Script::Fragments(vec!["Hel".into(), "lo".into()]));
        let router = router_with(vec![first.clone(), second.clone(), third.clone()]);

        let (events, terminal) = drain(router.generate_stream(GenerateParams::new("hi").streaming(true)).unwrap()).await;

        assert!(terminal.is_none());
        assert_eq!(
            events,
            vec![
                StreamEvent::provider_error("first", "API error 500: boom"),
                StreamEvent::provider_start("second"),
                StreamEvent::delta("par"),
                StreamEvent::provider_error("second", "malformed response: connection reset"),
                StreamEvent::provider_start("third"),
                StreamEvent::delta("Hel"),
                StreamEvent::delta("lo"),
                StreamEvent::Complete { conversation_id: None },
            ]
        );
        assert_eq!(first.call_count(), 1);
        assert_eq!(second.call_count(), 1);
    }

    #[tokio::test]
    async fn test_no_enabled_providers_fails_without_events() {
        let router = router_with(vec![ScriptedProvider::disabled("a"), ScriptedProvider::disabled("b")]);

        assert!(matches!(
            router.generate_stream(GenerateParams::new("hi").streaming(true)),
            Err(RouterError::NoProvidersAvailable)
        ));
        assert_eq!(
            router.generate(&GenerateParams::new("hi")).await,
            Err(RouterError::NoProvidersAvailable)
        );
    }

    #[tokio::test]
    async fn test_disabled_providers_are_skipped() {
        let off = ScriptedProvider::disabled("off");
        let on = ScriptedProvider::new("on", Script::Text("ok".into()));
        let router = router_with(vec![off.clone(), on]);

        let generated = router.generate(&GenerateParams::new("hi")).await.unwrap();
        assert_eq!(generated.provider, "on");
        assert_eq!(off.call_count(), 0);
    }

    #[tokio::test]
    async fn test_all_failed_emits_final_error_then_raises() {
        let router = router_with(vec![
            ScriptedProvider::new("a", Script::Fail("x".into())),
            ScriptedProvider::new("b", Script::Fail("y".into())),
        ]);

        let (events, terminal) = drain(router.generate_stream(GenerateParams::new("hi").streaming(true)).unwrap()).await;

        assert_eq!(names(&events), vec!["error", "error", "error"]);
        assert_eq!(events.last(), Some(&StreamEvent::error("All providers failed")));
        assert!(matches!(terminal, Some(RouterError::AllProvidersFailed { .. })));

        let buffered = router.generate(&GenerateParams::new("hi")).await;
        assert!(matches!(buffered, Err(RouterError::AllProvidersFailed { last_error: Some(ref e) }) if e.starts_with("b:")));
    }

    #[tokio::test]
    async fn test_single_string_is_chunked_for_streaming() {
        let text = "The router splits whole answers into small whitespace bounded pieces";
        let router = router_with(vec![ScriptedProvider::new("solo", Script::Text(text.into()))]);

        let (events, _) = drain(router.generate_stream(GenerateParams::new("hi").streaming(true)).unwrap()).await;

        let deltas: Vec<&str> = events.iter().filter_map(StreamEvent::delta_text).collect();
        assert!(deltas.len() > 1);
        assert_eq!(deltas.concat(), text);
        assert!(deltas.iter().all(|d| d.chars().count() <= 10));
        assert_eq!(events.first(), Some(&StreamEvent::provider_start("solo")));
        assert_eq!(events.last(), Some(&StreamEvent::Complete { conversation_id: None }));
    }

    #[tokio::test]
    async fn test_empty_fragments_suppressed_and_empty_answer_is_success() {
        let router = router_with(vec![ScriptedProvider::new(
            "gaps",
            Script::Fragments(vec!["".into(), "a".into(), "".into()]),
        )]);
        let (events, _) = drain(router.generate_stream(GenerateParams::new("hi").streaming(true)).unwrap()).await;
        assert_eq!(names(&events), vec!["start", "content_block_delta", "complete"]);

        let router = router_with(vec![ScriptedProvider::new("silent", Script::Text(String::new()))]);
        let (events, terminal) = drain(router.generate_stream(GenerateParams::new("hi").streaming(true)).unwrap()).await;
        assert!(terminal.is_none());
        assert_eq!(names(&events), vec!["start", "complete"]);
        assert_eq!(router.generate(&GenerateParams::new("hi")).await.unwrap().text, "");
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let slow = ScriptedProvider::new("slow", Script::Hang);
        let fast = ScriptedProvider::new("fast", Script::Text("quick".into()));
        let router = router_with(vec![slow.clone(), fast]);

        let generated = router.generate(&GenerateParams::new("hi")).await.unwrap();
        assert_eq!(generated.provider, "fast");

        let (events, _) = drain(router.generate_stream(GenerateParams::new("hi").streaming(true)).unwrap()).await;
        assert!(matches!(&events[0], StreamEvent::Error { provider: Some(p), .. } if p == "slow"));
        assert_eq!(slow.call_count(), 2);
    }

    #[tokio::test]
    async fn test_report_marks_latency_and_status() {
        let off = ScriptedProvider::disabled("off");
        let on = ScriptedProvider::new("on", Script::Text("ok".into()));
        let router = router_with(vec![on, off]);

        let before = router.providers_report();
        assert_eq!(before[0].latency_ms, None);

        router.generate(&GenerateParams::new("hi")).await.unwrap();
        let report = router.providers_report();

        assert_eq!(report[0].name, "on");
        assert_eq!(report[0].status, "active");
        assert!(report[0].latency_ms.is_some());
        assert_eq!(report[1].status, "disabled");
        assert_eq!(report[1].latency_ms, None);

        let health = router.health();
        assert_eq!((health.active_providers, health.total_providers), (1, 2));
    }
}
