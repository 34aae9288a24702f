//! Tiered completion driver: retry within a tier, fall back once to the
//! other tier, never replay a stream that already produced output.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use switchboard_core::cancel::CancelScope;
use switchboard_core::config::LlmConfig;
use switchboard_core::retry::Backoff;

use crate::openai::OpenAiCompatProvider;
use crate::provider::{CompletionRequest, LlmProvider, ModelTier, ProviderError};
use crate::stream::CompletionEvent;

pub struct TieredDriver {
    fast: Box<dyn LlmProvider>,
    slow: Box<dyn LlmProvider>,
    max_retries: u32,
}

impl TieredDriver {
    pub fn new(fast: Box<dyn LlmProvider>, slow: Box<dyn LlmProvider>, max_retries: u32) -> Self {
        Self {
            fast,
            slow,
            max_retries,
        }
    }

    pub fn from_config(cfg: &LlmConfig) -> Self {
        Self::new(
            Box::new(OpenAiCompatProvider::new("fast", &cfg.fast)),
            Box::new(OpenAiCompatProvider::new("slow", &cfg.slow)),
            cfg.max_retries,
        )
    }

    fn provider(&self, tier: ModelTier) -> &dyn LlmProvider {
        match tier {
            ModelTier::Fast => &*self.fast,
            ModelTier::Slow => &*self.slow,
        }
    }

    /// Stream a completion into `tx`, starting on `tier`.
    ///
    /// Attempts within a tier are retried with jittered backoff while they
    /// fail transiently and *before* any event reached the caller — a
    /// stream that already emitted output is never replayed, the error is
    /// surfaced instead. When a tier is exhausted the other tier is tried
    /// once under the same rules.
    pub async fn complete(
        &self,
        req: &CompletionRequest,
        tier: ModelTier,
        tx: mpsc::Sender<CompletionEvent>,
        cancel: &CancelScope,
    ) -> Result<(), ProviderError> {
        let mut last_err: Option<ProviderError> = None;

        for (hop, current) in [tier, tier.other()].into_iter().enumerate() {
            if hop > 0 {
                info!(tier = current.as_str(), "falling back to other model tier");
            }
            let provider = self.provider(current);
            let mut backoff = Backoff::new(
                Duration::from_millis(200),
                Duration::from_secs(5),
                self.max_retries,
            );

            loop {
                let forwarded = Arc::new(AtomicUsize::new(0));
                let result = self
                    .attempt(provider, req, tx.clone(), cancel, forwarded.clone())
                    .await;

                match result {
                    Ok(()) => return Ok(()),
                    Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
                    Err(e) => {
                        let streamed = forwarded.load(Ordering::SeqCst) > 0;
                        warn!(
                            provider = provider.name(),
                            err = %e,
                            streamed,
                            "completion attempt failed"
                        );
                        if streamed || !e.is_transient() {
                            // Partial output or a non-retriable failure:
                            // this tier is done, try the other one.
                            last_err = Some(e);
                            break;
                        }
                        let delay = match &e {
                            ProviderError::RateLimited { retry_after_ms } => backoff
                                .next_delay()
                                .map(|d| d.max(Duration::from_millis(*retry_after_ms))),
                            _ => backoff.next_delay(),
                        };
                        match delay {
                            Some(d) => {
                                last_err = Some(e);
                                tokio::time::sleep(d).await;
                            }
                            None => {
                                last_err = Some(e);
                                break;
                            }
                        }
                    }
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| ProviderError::Unavailable("all tiers failed".to_string())))
    }

    /// Run one provider attempt behind a private channel so we can count
    /// what actually reached the caller before deciding on a retry.
    async fn attempt(
        &self,
        provider: &dyn LlmProvider,
        req: &CompletionRequest,
        tx: mpsc::Sender<CompletionEvent>,
        cancel: &CancelScope,
        forwarded: Arc<AtomicUsize>,
    ) -> Result<(), ProviderError> {
        let (attempt_tx, mut attempt_rx) = mpsc::channel::<CompletionEvent>(32);

        let forward = async {
            while let Some(event) = attempt_rx.recv().await {
                forwarded.fetch_add(1, Ordering::SeqCst);
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        };

        let (result, ()) = tokio::join!(provider.complete_stream(req, attempt_tx, cancel), forward);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct FailTimes {
        failures: AtomicU32,
        then_text: &'static str,
    }

    #[async_trait]
    impl LlmProvider for FailTimes {
        fn name(&self) -> &str {
            "fail-times"
        }
        async fn complete_stream(
            &self,
            _req: &CompletionRequest,
            tx: mpsc::Sender<CompletionEvent>,
            _cancel: &CancelScope,
        ) -> Result<(), ProviderError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ProviderError::Unavailable("down".to_string()));
            }
            let _ = tx
                .send(CompletionEvent::TextDelta {
                    text: self.then_text.to_string(),
                })
                .await;
            let _ = tx
                .send(CompletionEvent::Done {
                    finish_reason: "stop".to_string(),
                })
                .await;
            Ok(())
        }
    }

    struct AlwaysDown;

    #[async_trait]
    impl LlmProvider for AlwaysDown {
        fn name(&self) -> &str {
            "always-down"
        }
        async fn complete_stream(
            &self,
            _req: &CompletionRequest,
            _tx: mpsc::Sender<CompletionEvent>,
            _cancel: &CancelScope,
        ) -> Result<(), ProviderError> {
            Err(ProviderError::Unavailable("down".to_string()))
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            messages: vec![crate::provider::ChatMessage::user("hi")],
            tools: Vec::new(),
            max_tokens: 64,
        }
    }

    async fn drain(mut rx: mpsc::Receiver<CompletionEvent>) -> Vec<CompletionEvent> {
        let mut out = Vec::new();
        while let Some(e) = rx.recv().await {
            out.push(e);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn retries_within_tier() {
        let driver = TieredDriver::new(
            Box::new(FailTimes {
                failures: AtomicU32::new(2),
                then_text: "ok",
            }),
            Box::new(AlwaysDown),
            3,
        );
        let (tx, rx) = mpsc::channel(8);
        let scope = CancelScope::root();
        driver
            .complete(&request(), ModelTier::Fast, tx, &scope)
            .await
            .unwrap();
        let events = drain(rx).await;
        assert!(matches!(&events[0], CompletionEvent::TextDelta { text } if text == "ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_other_tier() {
        let driver = TieredDriver::new(
            Box::new(AlwaysDown),
            Box::new(FailTimes {
                failures: AtomicU32::new(0),
                then_text: "from slow",
            }),
            1,
        );
        let (tx, rx) = mpsc::channel(8);
        let scope = CancelScope::root();
        driver
            .complete(&request(), ModelTier::Fast, tx, &scope)
            .await
            .unwrap();
        let events = drain(rx).await;
        assert!(
            matches!(&events[0], CompletionEvent::TextDelta { text } if text == "from slow")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn all_tiers_down_errors() {
        let driver = TieredDriver::new(Box::new(AlwaysDown), Box::new(AlwaysDown), 1);
        let (tx, _rx) = mpsc::channel(8);
        let scope = CancelScope::root();
        let err = driver
            .complete(&request(), ModelTier::Fast, tx, &scope)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }

    struct CancelAware;

    #[async_trait]
    impl LlmProvider for CancelAware {
        fn name(&self) -> &str {
            "cancel-aware"
        }
        async fn complete_stream(
            &self,
            _req: &CompletionRequest,
            _tx: mpsc::Sender<CompletionEvent>,
            cancel: &CancelScope,
        ) -> Result<(), ProviderError> {
            cancel.cancelled().await;
            Err(ProviderError::Cancelled)
        }
    }

    #[tokio::test]
    async fn cancellation_is_not_retried() {
        let driver = TieredDriver::new(Box::new(CancelAware), Box::new(CancelAware), 3);
        let (tx, _rx) = mpsc::channel(8);
        let scope = CancelScope::root();
        scope.cancel();
        let err = driver
            .complete(&request(), ModelTier::Fast, tx, &scope)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
    }
}
