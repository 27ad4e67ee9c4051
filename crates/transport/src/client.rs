use std::future::Future;
use std::pin::Pin;

use futures::StreamExt;
use serde::Deserialize;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use salon_chat::{ChatEvent, ConversationId};

use crate::error::{
    EmptyBaseUrlSnafu, HttpSnafu, NetworkSnafu, TransportError, TransportResult,
};
use crate::request::{
    ChatRequest, DeploymentHeaders, HEADER_DEPLOYMENT_CONFIG, HEADER_DEPLOYMENT_NAME, StreamMode,
};
use crate::sse::SseDecoder;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type TransportWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Receiving side of one chat stream.
///
/// Events arrive in order; the channel closes after the terminal event or a
/// failure item. Dropping the stream cancels the worker's connection.
pub struct ChatEventStream {
    events: mpsc::UnboundedReceiver<TransportResult<ChatEvent>>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl ChatEventStream {
    pub async fn recv(&mut self) -> Option<TransportResult<ChatEvent>> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TransportResult<ChatEvent>> {
        self.events.try_recv().ok()
    }

    /// Signals cancellation to the stream worker. Returns false when the
    /// worker is already gone.
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for ChatEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// A started stream: the event receiver plus the worker future that drives
/// the connection. The caller spawns the worker.
pub struct ChatStreamHandle {
    pub stream: ChatEventStream,
    pub worker: TransportWorker,
}

/// Builds the channel trio connecting a stream worker to its consumer.
///
/// Public so alternate transports (and tests) can produce
/// [`ChatStreamHandle`]s without a live connection.
pub fn event_channel() -> (
    mpsc::UnboundedSender<TransportResult<ChatEvent>>,
    ChatEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ChatEventStream {
            events: event_rx,
            cancel_tx: Some(cancel_tx),
        },
        cancel_rx,
    )
}

/// The seam the chat session talks through to reach the backend.
pub trait ChatTransport: Send + Sync {
    /// Opens a chat stream; the returned worker must be spawned to drive it.
    fn open_stream(
        &self,
        request: ChatRequest,
        mode: StreamMode,
        headers: &DeploymentHeaders,
    ) -> TransportResult<ChatStreamHandle>;

    /// Asks the backend to produce a title for the conversation.
    fn generate_title<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, TransportResult<Option<String>>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateTitleResponse {
    #[serde(default)]
    title: Option<String>,
}

/// SSE chat transport over reqwest.
pub struct HttpChatTransport {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpChatTransport {
    pub fn new(config: TransportConfig) -> TransportResult<Self> {
        let base_url = config.base_url.trim().trim_end_matches('/').to_string();
        ensure!(
            !base_url.is_empty(),
            EmptyBaseUrlSnafu {
                stage: "new-transport",
            }
        );

        let http = reqwest::Client::builder().build().context(HttpSnafu {
            stage: "build-http-client",
        })?;

        Ok(Self {
            http,
            base_url,
            auth_token: config.auth_token.filter(|token| !token.trim().is_empty()),
        })
    }

    fn chat_stream_endpoint(&self, mode: StreamMode, agent_id: Option<&str>) -> String {
        let mut endpoint = format!("{}/v1/chat-stream", self.base_url);
        if mode == StreamMode::Regenerate {
            endpoint.push_str("/regenerate");
        }
        if let Some(agent_id) = agent_id {
            endpoint.push_str("?agent_id=");
            endpoint.push_str(agent_id);
        }
        endpoint
    }

    async fn run_stream_worker(
        http: reqwest::Client,
        endpoint: String,
        auth_token: Option<String>,
        headers: DeploymentHeaders,
        request: ChatRequest,
        event_tx: mpsc::UnboundedSender<TransportResult<ChatEvent>>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let mut builder = http.post(&endpoint).json(&request);
        if let Some(token) = &auth_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(name) = &headers.name {
            builder = builder.header(HEADER_DEPLOYMENT_NAME, name);
        }
        if let Some(config) = &headers.config {
            builder = builder.header(HEADER_DEPLOYMENT_CONFIG, config);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(source) => {
                tracing::error!(endpoint = %endpoint, error = %source, "failed to open chat stream");
                let _ = event_tx.send(Err(TransportError::Http {
                    stage: "open-stream",
                    source,
                }));
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(endpoint = %endpoint, status = status.as_u16(), "chat stream rejected");
            let _ = event_tx.send(Err(TransportError::Network {
                stage: "open-stream-status",
                status: status.as_u16(),
            }));
            return;
        }

        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut cancelled = false;
        let mut failed = false;

        'read: loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    cancelled = true;
                    // The connection drops with the body stream; nothing else
                    // is read after a cancel.
                    tracing::debug!(endpoint = %endpoint, "chat stream cancelled");
                    break;
                }
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => {
                        for payload in decoder.push(&bytes) {
                            if !dispatch_payload(&payload, &event_tx) {
                                failed = true;
                                break 'read;
                            }
                        }
                    }
                    Some(Err(source)) => {
                        failed = true;
                        tracing::warn!(endpoint = %endpoint, error = %source, "chat stream transfer failed");
                        let _ = event_tx.send(Err(TransportError::StreamProtocol {
                            stage: "read-stream-chunk",
                            code: "transfer",
                            details: source.to_string(),
                        }));
                        break;
                    }
                    None => break,
                }
            }
        }

        if !cancelled && !failed {
            if let Some(payload) = decoder.finish() {
                dispatch_payload(&payload, &event_tx);
            }
        }
    }
}

/// Decodes one SSE data payload into a chat event and forwards it.
///
/// Returns false when the worker should stop reading: either the consumer
/// went away or the payload was undecodable.
fn dispatch_payload(
    payload: &str,
    event_tx: &mpsc::UnboundedSender<TransportResult<ChatEvent>>,
) -> bool {
    match serde_json::from_str::<ChatEvent>(payload) {
        Ok(event) => event_tx.send(Ok(event)).is_ok(),
        Err(source) => {
            tracing::warn!(error = %source, "failed to decode chat stream payload");
            let _ = event_tx.send(Err(TransportError::StreamProtocol {
                stage: "decode-stream-payload",
                code: "decode",
                details: source.to_string(),
            }));
            false
        }
    }
}

impl ChatTransport for HttpChatTransport {
    fn open_stream(
        &self,
        request: ChatRequest,
        mode: StreamMode,
        headers: &DeploymentHeaders,
    ) -> TransportResult<ChatStreamHandle> {
        let endpoint = self.chat_stream_endpoint(mode, request.agent_id.as_deref());
        let (event_tx, stream, cancel_rx) = event_channel();
        let worker: TransportWorker = Box::pin(Self::run_stream_worker(
            self.http.clone(),
            endpoint,
            self.auth_token.clone(),
            headers.clone(),
            request,
            event_tx,
            cancel_rx,
        ));
        Ok(ChatStreamHandle { stream, worker })
    }

    fn generate_title<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, TransportResult<Option<String>>> {
        Box::pin(async move {
            let endpoint = format!(
                "{}/v1/conversations/{}/generate-title",
                self.base_url, conversation_id
            );
            let mut builder = self.http.post(&endpoint);
            if let Some(token) = &self.auth_token {
                builder = builder.bearer_auth(token);
            }

            let response = builder.send().await.context(HttpSnafu {
                stage: "generate-title",
            })?;
            let status = response.status();
            ensure!(
                status.is_success(),
                NetworkSnafu {
                    stage: "generate-title-status",
                    status: status.as_u16(),
                }
            );

            let payload: GenerateTitleResponse = response.json().await.context(HttpSnafu {
                stage: "read-title-response",
            })?;
            Ok(payload.title.filter(|title| !title.trim().is_empty()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> HttpChatTransport {
        HttpChatTransport::new(TransportConfig {
            base_url: "http://localhost:8000/".to_string(),
            auth_token: None,
        })
        .unwrap()
    }

    #[test]
    fn rejects_empty_base_url() {
        let result = HttpChatTransport::new(TransportConfig {
            base_url: "   ".to_string(),
            auth_token: None,
        });
        assert!(matches!(result, Err(TransportError::EmptyBaseUrl { .. })));
    }

    #[test]
    fn builds_chat_and_regenerate_endpoints() {
        let transport = transport();
        assert_eq!(
            transport.chat_stream_endpoint(StreamMode::Chat, None),
            "http://localhost:8000/v1/chat-stream"
        );
        assert_eq!(
            transport.chat_stream_endpoint(StreamMode::Regenerate, Some("zitatki")),
            "http://localhost:8000/v1/chat-stream/regenerate?agent_id=zitatki"
        );
    }

    #[tokio::test]
    async fn dropping_the_stream_signals_cancellation() {
        let (_event_tx, stream, cancel_rx) = event_channel();
        drop(stream);
        assert!(cancel_rx.await.is_ok());
    }

    #[tokio::test]
    async fn undecodable_payload_surfaces_protocol_error() {
        let (event_tx, mut stream, _cancel_rx) = event_channel();
        assert!(!dispatch_payload("not json", &event_tx));
        let item = stream.recv().await.unwrap();
        let error = item.unwrap_err();
        assert_eq!(error.protocol_code(), Some("decode"));
    }

    #[tokio::test]
    async fn events_flow_through_the_channel_in_order() {
        let (event_tx, mut stream, _cancel_rx) = event_channel();
        assert!(dispatch_payload(
            r#"{"event":"text-generation","data":{"text":"a"}}"#,
            &event_tx
        ));
        assert!(dispatch_payload(
            r#"{"event":"text-generation","data":{"text":"b"}}"#,
            &event_tx
        ));
        let first = stream.recv().await.unwrap().unwrap();
        let second = stream.recv().await.unwrap().unwrap();
        assert_eq!(
            first,
            ChatEvent::TextGeneration {
                text: "a".to_string()
            }
        );
        assert_eq!(
            second,
            ChatEvent::TextGeneration {
                text: "b".to_string()
            }
        );
    }
}
