//! Ollama provider implementation

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::conversation::Message;

use super::{ChunkStream, ModelRuntime, ProviderError};

/// Talks to an Ollama server over its `/api/chat` endpoint.
///
/// `timeout` bounds a whole batch request. A streamed reply may run longer;
/// there it bounds the wait for the response head and for each body read.
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

impl From<&Message> for OllamaMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role.as_str().to_string(),
            content: message.content.clone(),
        }
    }
}

/// One response object. Batch mode returns a single one; streaming mode
/// returns one per line, the last with `done: true`.
#[derive(Debug, Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .build()
            .map_err(ProviderError::RequestFailed)?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    async fn post(
        &self,
        model: &str,
        messages: &[Message],
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let request = OllamaRequest {
            model,
            messages: messages.iter().map(OllamaMessage::from).collect(),
            stream,
        };

        tracing::debug!(model, turns = messages.len(), stream, "Sending chat request to Ollama");

        let builder = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request);

        let response = if stream {
            tokio::time::timeout(self.timeout, builder.send())
                .await
                .map_err(|_| ProviderError::Timeout(self.timeout))?
        } else {
            builder.timeout(self.timeout).send().await
        }
        .map_err(|e| self.request_error(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::InvalidResponse(format!(
                "{}: {}",
                status, body
            )));
        }

        Ok(response)
    }

    fn request_error(&self, error: reqwest::Error) -> ProviderError {
        request_error(error, self.timeout)
    }
}

fn request_error(error: reqwest::Error, timeout: Duration) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout(timeout)
    } else {
        ProviderError::RequestFailed(error)
    }
}

/// Decode one NDJSON line of a streaming response.
///
/// Returns the text fragment it carries and whether it was the last one.
fn decode_line(line: &[u8]) -> Result<Option<(String, bool)>, ProviderError> {
    let line = trim_ascii(line);
    if line.is_empty() {
        return Ok(None);
    }

    let chunk: OllamaResponse = serde_json::from_slice(line)
        .map_err(|e| ProviderError::InvalidResponse(format!("malformed stream line: {e}")))?;

    if let Some(error) = chunk.error {
        return Err(ProviderError::InvalidResponse(error));
    }

    let content = chunk.message.map(|m| m.content).unwrap_or_default();
    Ok(Some((content, chunk.done)))
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &bytes[start..end]
}

#[async_trait]
impl ModelRuntime for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn chat(&self, model: &str, messages: &[Message]) -> Result<String, ProviderError> {
        let response = self.post(model, messages, false).await?;

        let ollama_response: OllamaResponse =
            response.json().await.map_err(|e| self.request_error(e))?;

        if let Some(error) = ollama_response.error {
            return Err(ProviderError::InvalidResponse(error));
        }

        ollama_response
            .message
            .map(|m| m.content)
            .ok_or_else(|| ProviderError::InvalidResponse("response has no message".into()))
    }

    async fn chat_stream(
        &self,
        model: &str,
        messages: &[Message],
    ) -> Result<ChunkStream, ProviderError> {
        let response = self.post(model, messages, true).await?;
        let timeout = self.timeout;

        let stream = async_stream::try_stream! {
            let mut body = Box::pin(response.bytes_stream());
            let mut buffer: Vec<u8> = Vec::new();
            let mut finished = false;

            loop {
                // Bounds each read, not the whole reply
                let next = tokio::time::timeout(timeout, body.next())
                    .await
                    .map_err(|_| ProviderError::Timeout(timeout))?;
                let Some(bytes) = next else {
                    break;
                };
                let bytes = bytes.map_err(|e| request_error(e, timeout))?;
                buffer.extend_from_slice(&bytes);

                while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline).collect();
                    if let Some((content, done)) = decode_line(&line)? {
                        if !content.is_empty() {
                            yield content;
                        }
                        if done {
                            finished = true;
                            break;
                        }
                    }
                }

                if finished {
                    break;
                }
            }

            if !finished {
                // The final object may arrive without a trailing newline
                match decode_line(&buffer)? {
                    Some((content, true)) => {
                        if !content.is_empty() {
                            yield content;
                        }
                    }
                    _ => {
                        Err::<(), _>(ProviderError::InvalidResponse(
                            "stream ended before the model finished".into(),
                        ))?;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::Router;
    use futures::TryStreamExt;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn history() -> Vec<Message> {
        vec![Message::user("Hello")]
    }

    #[test]
    fn test_decode_line() {
        let line = br#"{"model":"llama3.1","message":{"role":"assistant","content":"Hi"},"done":false}"#;
        assert_eq!(decode_line(line).unwrap(), Some(("Hi".to_string(), false)));

        let last = br#"{"model":"llama3.1","message":{"role":"assistant","content":""},"done":true}"#;
        assert_eq!(decode_line(last).unwrap(), Some((String::new(), true)));

        assert_eq!(decode_line(b"  \n").unwrap(), None);
        assert!(decode_line(b"{not json").is_err());
        assert!(matches!(
            decode_line(br#"{"error":"model 'nope' not found"}"#),
            Err(ProviderError::InvalidResponse(msg)) if msg.contains("nope")
        ));
    }

    #[test]
    fn test_message_conversion() {
        let message = Message::assistant("Hi there", "gemma2");
        let converted = OllamaMessage::from(&message);
        assert_eq!(converted.role, "assistant");
        assert_eq!(converted.content, "Hi there");
    }

    #[tokio::test]
    async fn test_batch_chat() {
        let router = Router::new().route(
            "/api/chat",
            post(|axum::Json(body): axum::Json<serde_json::Value>| async move {
                assert_eq!(body["model"], "llama3.1");
                assert_eq!(body["stream"], false);
                assert_eq!(body["messages"][0]["role"], "user");
                axum::Json(serde_json::json!({
                    "message": { "role": "assistant", "content": "Hi there" },
                    "done": true
                }))
            }),
        );
        let url = serve(router).await;

        let provider = OllamaProvider::new(url, Duration::from_secs(5)).unwrap();
        let reply = provider.chat("llama3.1", &history()).await.unwrap();
        assert_eq!(reply, "Hi there");
    }

    #[tokio::test]
    async fn test_streaming_chat() {
        let router = Router::new().route(
            "/api/chat",
            post(|| async {
                concat!(
                    r#"{"message":{"role":"assistant","content":"Hi"},"done":false}"#,
                    "\n",
                    r#"{"message":{"role":"assistant","content":" there"},"done":false}"#,
                    "\n",
                    r#"{"message":{"role":"assistant","content":""},"done":true}"#,
                )
            }),
        );
        let url = serve(router).await;

        let provider = OllamaProvider::new(url, Duration::from_secs(5)).unwrap();
        let chunks: Vec<String> = provider
            .chat_stream("llama3.1", &history())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks, vec!["Hi".to_string(), " there".to_string()]);
    }

    #[tokio::test]
    async fn test_truncated_stream_is_an_error() {
        let router = Router::new().route(
            "/api/chat",
            post(|| async { "{\"message\":{\"role\":\"assistant\",\"content\":\"Hi\"},\"done\":false}\n" }),
        );
        let url = serve(router).await;

        let provider = OllamaProvider::new(url, Duration::from_secs(5)).unwrap();
        let result: Result<Vec<String>, _> = provider
            .chat_stream("llama3.1", &history())
            .await
            .unwrap()
            .try_collect()
            .await;
        assert!(matches!(result, Err(ProviderError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn test_error_status_is_invalid_response() {
        let router = Router::new().route(
            "/api/chat",
            post(|| async { (axum::http::StatusCode::NOT_FOUND, "model not found") }),
        );
        let url = serve(router).await;

        let provider = OllamaProvider::new(url, Duration::from_secs(5)).unwrap();
        let err = provider.chat("missing", &history()).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse(msg) if msg.contains("404")));
    }

    /// Serves `lines` as a chunked body, pausing `gap` before each one
    fn paced_stream(lines: Vec<&'static str>, gap: Duration) -> Router {
        Router::new().route(
            "/api/chat",
            post(move || {
                let lines = lines.clone();
                async move {
                    let body = async_stream::stream! {
                        for line in lines {
                            tokio::time::sleep(gap).await;
                            yield Ok::<_, std::convert::Infallible>(format!("{line}\n"));
                        }
                    };
                    axum::body::Body::from_stream(body)
                }
            }),
        )
    }

    #[tokio::test]
    async fn test_steady_stream_outlives_the_timeout() {
        let fragment = r#"{"message":{"role":"assistant","content":"."},"done":false}"#;
        let mut lines = vec![fragment; 8];
        lines.push(r#"{"message":{"role":"assistant","content":""},"done":true}"#);
        let url = serve(paced_stream(lines, Duration::from_millis(150))).await;

        // About 1.35 s in total, but never more than 150 ms between reads
        let provider = OllamaProvider::new(url, Duration::from_millis(500)).unwrap();
        let chunks: Vec<String> = provider
            .chat_stream("llama3.1", &history())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.concat(), "........");
    }

    #[tokio::test]
    async fn test_stalled_stream_times_out() {
        let lines = vec![
            r#"{"message":{"role":"assistant","content":"Hi"},"done":false}"#,
            r#"{"message":{"role":"assistant","content":""},"done":true}"#,
        ];
        let url = serve(paced_stream(lines, Duration::from_secs(2))).await;

        let provider = OllamaProvider::new(url, Duration::from_millis(200)).unwrap();
        let result: Result<Vec<String>, _> = match provider.chat_stream("llama3.1", &history()).await {
            Ok(stream) => stream.try_collect().await,
            Err(e) => Err(e),
        };
        assert!(matches!(result, Err(ProviderError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_slow_runtime_times_out() {
        let router = Router::new().route(
            "/api/chat",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "too late"
            }),
        );
        let url = serve(router).await;

        let provider = OllamaProvider::new(url, Duration::from_millis(100)).unwrap();
        let err = provider.chat("llama3.1", &history()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));
    }
}
