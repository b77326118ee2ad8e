//! One chat exchange: load the session, ask the model, record the reply.

use crate::prompt::PromptStore;
use crate::provider::{ChatRequest, Provider};
use crate::session::{SessionManager, SessionRecord};
use chrono::Utc;
use futures_util::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tutor_common::config::LlmConfig;
use tutor_common::{Error, Result};

/// Reply fragments for a streamed exchange.
pub type ReplyStream = BoxStream<'static, Result<String>>;

/// Model settings applied to every request.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<i64>,
}

impl From<&LlmConfig> for GenerationSettings {
    fn from(config: &LlmConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

/// Runs chat exchanges against the session store and the model.
///
/// An exchange is appended to the session only after the model has
/// produced its whole reply. A failed or abandoned exchange leaves the
/// stored history as it was and only records the access time.
pub struct ChatService {
    sessions: Arc<SessionManager>,
    prompts: Arc<PromptStore>,
    provider: Arc<dyn Provider>,
    settings: GenerationSettings,
}

impl ChatService {
    pub fn new(
        sessions: Arc<SessionManager>,
        prompts: Arc<PromptStore>,
        provider: Arc<dyn Provider>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            sessions,
            prompts,
            provider,
            settings,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    fn request_for(&self, record: &SessionRecord, message: &str) -> ChatRequest {
        let mut request = ChatRequest::new(&self.settings.model, record.history().to_vec(), message);
        request.temperature = self.settings.temperature;
        request.max_tokens = self.settings.max_tokens;
        request
    }

    /// Send `message` in `session_id` and return the full reply.
    pub async fn exchange(&self, session_id: &str, message: &str) -> Result<String> {
        validate(session_id, message)?;

        let guard = self.sessions.lock(session_id).await;
        let mut record = self.sessions.get_or_create(session_id, &self.prompts).await;

        let response = match self.provider.chat(self.request_for(&record, message)).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Model call failed, exchange not recorded");
                self.sessions.save(&record).await;
                return Err(Error::from(e));
            }
        };

        self.sessions
            .append_exchange(&mut record, message, &response.content)
            .await;
        drop(guard);

        tracing::info!(
            session_id = %session_id,
            provider = %self.provider.name(),
            turns = record.history().len(),
            latency_ms = response.latency_ms,
            "Chat exchange completed"
        );

        self.sessions.maybe_sweep(Utc::now()).await;
        Ok(response.content)
    }

    /// Send `message` in `session_id` and stream the reply.
    ///
    /// Errors before the first fragment are returned directly. Later
    /// errors arrive as the final stream item. Dropping the stream cancels
    /// the upstream call.
    pub async fn exchange_stream(&self, session_id: &str, message: &str) -> Result<ReplyStream> {
        validate(session_id, message)?;

        let guard = self.sessions.lock(session_id).await;
        let mut record = self.sessions.get_or_create(session_id, &self.prompts).await;

        let cancel = CancellationToken::new();
        let started = self
            .provider
            .chat_stream(self.request_for(&record, message), cancel.clone())
            .await;
        let mut upstream = match started {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Model stream failed to start");
                self.sessions.save(&record).await;
                return Err(Error::from(e));
            }
        };

        let (tx, rx) = mpsc::channel::<Result<String>>(32);
        let sessions = Arc::clone(&self.sessions);
        let session_id = session_id.to_string();
        let message = message.to_string();

        tokio::spawn(async move {
            let mut reply = String::new();

            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        cancel.cancel();
                        tracing::info!(session_id = %session_id, "Client left mid-stream, exchange not recorded");
                        sessions.save(&record).await;
                        return;
                    }
                    item = upstream.next() => match item {
                        Some(Ok(fragment)) => {
                            reply.push_str(&fragment);
                            if tx.send(Ok(fragment)).await.is_err() {
                                cancel.cancel();
                                sessions.save(&record).await;
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::error!(session_id = %session_id, error = %e, "Model stream failed, exchange not recorded");
                            let _ = tx.send(Err(Error::from(e))).await;
                            sessions.save(&record).await;
                            return;
                        }
                        None => break,
                    },
                }
            }

            sessions.append_exchange(&mut record, &message, &reply).await;
            drop(guard);

            tracing::info!(
                session_id = %session_id,
                turns = record.history().len(),
                chars = reply.len(),
                "Streamed chat exchange completed"
            );

            sessions.maybe_sweep(Utc::now()).await;
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

fn validate(session_id: &str, message: &str) -> Result<()> {
    if session_id.is_empty() {
        return Err(Error::InvalidInput("No sessionId provided".into()));
    }
    if message.is_empty() {
        return Err(Error::InvalidInput("No message provided".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatResponse, FragmentStream, ProviderError, TokenUsage};
    use async_trait::async_trait;
    use futures_util::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tutor_common::config::{FrontendConfig, PromptConfig, SessionConfig};
    use tutor_store::StoreHandle;

    /// Echoes the message and records how many turns it was sent.
    #[derive(Default)]
    struct EchoProvider {
        fail: bool,
        last_turns: AtomicUsize,
    }

    #[async_trait]
    impl Provider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        async fn chat(&self, request: ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
            self.last_turns.store(request.turns().count(), Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            if self.fail {
                return Err(ProviderError::new("echo", &request.model, "boom"));
            }
            Ok(ChatResponse {
                provider: "echo".into(),
                model: request.model,
                content: format!("echo: {}", request.message),
                usage: TokenUsage::default(),
                finish_reason: None,
                latency_ms: 0,
            })
        }

        async fn chat_stream(
            &self,
            request: ChatRequest,
            _cancel: CancellationToken,
        ) -> std::result::Result<FragmentStream, ProviderError> {
            let mut items = vec![Ok("echo: ".to_string()), Ok(request.message.clone())];
            if self.fail {
                items.push(Err(ProviderError::new("echo", &request.model, "cut off")));
            }
            Ok(stream::iter(items).boxed())
        }
    }

    /// Sends one fragment, then waits until the exchange is cancelled.
    #[derive(Default)]
    struct StallingProvider {
        cancel: std::sync::Mutex<Option<CancellationToken>>,
    }

    #[async_trait]
    impl Provider for StallingProvider {
        fn name(&self) -> &str {
            "stalling"
        }

        async fn chat(&self, request: ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
            Err(ProviderError::new("stalling", &request.model, "stream only"))
        }

        async fn chat_stream(
            &self,
            _request: ChatRequest,
            cancel: CancellationToken,
        ) -> std::result::Result<FragmentStream, ProviderError> {
            *self.cancel.lock().unwrap() = Some(cancel.clone());
            let first = stream::iter(vec![Ok("partial".to_string())]);
            let rest = stream::once(async move { cancel.cancelled().await })
                .filter_map(|()| async { None::<std::result::Result<String, ProviderError>> });
            Ok(first.chain(rest).boxed())
        }
    }

    fn service(provider: EchoProvider) -> (ChatService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreHandle::memory();
        let prompts = PromptStore::new(
            store.clone(),
            &PromptConfig {
                default_prompt: "Teach Java".into(),
                default_subject: "Java".into(),
                defaults_file: dir.path().join("defaults.json"),
            },
            &FrontendConfig::default(),
        );
        let sessions = SessionManager::new(store, &SessionConfig::default());
        let service = ChatService::new(
            Arc::new(sessions),
            Arc::new(prompts),
            Arc::new(provider),
            GenerationSettings::from(&LlmConfig::default()),
        );
        (service, dir)
    }

    #[tokio::test]
    async fn test_exchange_records_history() {
        let (service, _dir) = service(EchoProvider::default());

        assert_eq!(service.exchange("s1", "hi").await.unwrap(), "echo: hi");
        assert_eq!(service.exchange("s1", "again").await.unwrap(), "echo: again");

        let record = service.sessions().load("s1").await.unwrap();
        assert_eq!(record.history().len(), 6);
        assert_eq!(record.history()[5].text(), "echo: again");
    }

    #[tokio::test]
    async fn test_model_sees_seed_and_history() {
        let provider = Arc::new(EchoProvider::default());
        let (service, _dir) = service(EchoProvider::default());
        let service = ChatService {
            provider: provider.clone(),
            ..service
        };

        service.exchange("s1", "one").await.unwrap();
        assert_eq!(provider.last_turns.load(Ordering::SeqCst), 3);
        service.exchange("s1", "two").await.unwrap();
        assert_eq!(provider.last_turns.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_failed_exchange_appends_nothing() {
        let (service, _dir) = service(EchoProvider {
            fail: true,
            ..Default::default()
        });

        let err = service.exchange("s1", "hi").await.unwrap_err();
        assert_eq!(err.status_code(), 500);

        let record = service.sessions().load("s1").await.unwrap();
        assert_eq!(record.history().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_fields_rejected() {
        let (service, _dir) = service(EchoProvider::default());

        let err = service.exchange("", "hi").await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid input: No sessionId provided");
        let err = service.exchange("s1", "").await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(service.sessions().load("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_exchanges_keep_every_turn() {
        let (service, _dir) = service(EchoProvider::default());
        let service = Arc::new(service);

        let a = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.exchange("shared", "first").await })
        };
        let b = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.exchange("shared", "second").await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let record = service.sessions().load("shared").await.unwrap();
        assert_eq!(record.history().len(), 6);
    }

    #[tokio::test]
    async fn test_stream_records_after_completion() {
        let (service, _dir) = service(EchoProvider::default());

        let fragments: Vec<String> = service
            .exchange_stream("s1", "hi")
            .await
            .unwrap()
            .map(|f| f.unwrap())
            .collect()
            .await;
        assert_eq!(fragments.concat(), "echo: hi");

        // The append happens after the last fragment is delivered
        let mut record = None;
        for _ in 0..50 {
            record = service.sessions().load("s1").await.filter(|r| r.history().len() == 4);
            if record.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(record.unwrap().history()[3].text(), "echo: hi");
    }

    #[tokio::test]
    async fn test_stream_failure_appends_nothing() {
        let (service, _dir) = service(EchoProvider {
            fail: true,
            ..Default::default()
        });

        let items: Vec<Result<String>> = service
            .exchange_stream("s1", "hi")
            .await
            .unwrap()
            .collect()
            .await;
        assert!(items.last().unwrap().is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let record = service.sessions().load("s1").await.unwrap();
        assert_eq!(record.history().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_exchange_records_access_time() {
        let (service, _dir) = service(EchoProvider {
            fail: true,
            ..Default::default()
        });
        let earlier = Utc::now() - chrono::TimeDelta::hours(3);

        let mut record = service.sessions().get_or_create("s1", &service.prompts).await;
        record.touch(earlier);
        service.sessions().save(&record).await;

        service.exchange("s1", "hi").await.unwrap_err();

        let stored = service.sessions().load("s1").await.unwrap();
        assert_eq!(stored.history().len(), 2);
        assert!(stored.last_accessed() > earlier);
    }

    #[tokio::test]
    async fn test_dropped_stream_cancels_upstream() {
        let provider = Arc::new(StallingProvider::default());
        let (service, _dir) = service(EchoProvider::default());
        let service = ChatService {
            provider: provider.clone(),
            ..service
        };

        let mut replies = service.exchange_stream("s1", "hi").await.unwrap();
        assert_eq!(replies.next().await.unwrap().unwrap(), "partial");
        drop(replies);

        let cancel = provider.cancel.lock().unwrap().clone().unwrap();
        tokio::time::timeout(Duration::from_secs(1), cancel.cancelled())
            .await
            .expect("upstream call should be cancelled");

        let _guard = tokio::time::timeout(Duration::from_secs(1), service.sessions().lock("s1"))
            .await
            .expect("session lock should be released");
        let record = service.sessions().load("s1").await.unwrap();
        assert_eq!(record.history().len(), 2);
    }
}
