//! HTTP streaming transport.
//!
//! Posts a [`StreamRequest`] as JSON and reads the response body as
//! newline-delimited events. Lines may carry an SSE `data: ` prefix:
//!
//! ```text
//! data: {"type":"chunk","content":"Recursion "}
//! data: {"type":"chunk","content":"is "}
//! data: {"type":"complete","message":{"id":"...","metadata":{"tokens":42}}}
//! ```
//!
//! An `{"type":"error","error":"..."}` line ends the stream with an error;
//! `data: [DONE]` ends it successfully. Non-2xx responses fail the open.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::TransportSettings;
use crate::error::{ChatError, ChatResult};
use crate::transport::{StreamEvent, StreamHandle, StreamRequest, StreamTransport};

/// Transport speaking to the chat backend over HTTP
#[derive(Debug, Clone)]
pub struct HttpStreamTransport {
    settings: TransportSettings,
    client: reqwest::Client,
}

impl HttpStreamTransport {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings,
            client: reqwest::Client::new(),
        }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }
}

#[async_trait]
impl StreamTransport for HttpStreamTransport {
    async fn open(&self, request: StreamRequest) -> ChatResult<StreamHandle> {
        let url = self.settings.stream_url();
        debug!(url = %url, session_id = %request.session_id, continuation = request.is_continuation, "Opening stream");

        let mut builder = self
            .client
            .post(&url)
            .header("Accept", "text/event-stream")
            .json(&request);
        if let Some(ref key) = self.settings.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ChatError::Transport(format!("Network error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Transport(format!(
                "Chat API error {}: {}",
                status,
                body.trim()
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_body(response, tx));
        Ok(StreamHandle::new(rx, move || pump.abort()))
    }
}

/// Forward decoded body events until a terminal event or end of body
async fn pump_body(response: reqwest::Response, tx: mpsc::UnboundedSender<StreamEvent>) {
    let mut body = response.bytes_stream();
    let mut decoder = EventDecoder::default();

    while let Some(next) = body.next().await {
        let bytes = match next {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tx.send(StreamEvent::error(format!("Stream interrupted: {}", e)));
                return;
            }
        };
        for event in decoder.push(&bytes) {
            if forward(&tx, event) {
                return;
            }
        }
    }

    for event in decoder.finish() {
        if forward(&tx, event) {
            return;
        }
    }
    // Body ended without a terminal event; dropping `tx` reports it
}

/// Send one event; true when the pump should stop
fn forward(tx: &mpsc::UnboundedSender<StreamEvent>, event: StreamEvent) -> bool {
    let terminal = event.is_terminal();
    tx.send(event).is_err() || terminal
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireEvent {
    Chunk {
        content: String,
    },
    #[serde(alias = "done")]
    Complete {
        #[serde(default)]
        message: Option<serde_json::Value>,
        #[serde(default)]
        metadata: Option<serde_json::Value>,
    },
    Error {
        error: String,
    },
}

impl From<WireEvent> for StreamEvent {
    fn from(wire: WireEvent) -> Self {
        match wire {
            WireEvent::Chunk { content } => StreamEvent::Chunk(content),
            WireEvent::Complete { message, metadata } => StreamEvent::Complete {
                metadata: metadata.or_else(|| message.and_then(|m| m.get("metadata").cloned())),
            },
            WireEvent::Error { error } => StreamEvent::Error(error),
        }
    }
}

/// Splits a byte stream into lines and decodes each into an event.
///
/// Bytes are buffered until a newline so multi-byte characters and JSON
/// objects may straddle network chunks.
#[derive(Debug, Default)]
pub struct EventDecoder {
    pending: Vec<u8>,
}

impl EventDecoder {
    /// Feed bytes; returns the events completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        self.pending.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(event) = decode_line(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
        }
        events
    }

    /// Decode whatever is left after the body ends
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let rest = std::mem::take(&mut self.pending);
        decode_line(&String::from_utf8_lossy(&rest))
            .into_iter()
            .collect()
    }
}

fn decode_line(line: &str) -> Option<StreamEvent> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }

    let payload = match line.strip_prefix("data:") {
        Some(rest) => rest.trim_start(),
        None if is_sse_field(line) => return None,
        None => line,
    };

    if payload == "[DONE]" {
        return Some(StreamEvent::complete());
    }

    match serde_json::from_str::<WireEvent>(payload) {
        Ok(wire) => Some(wire.into()),
        Err(e) => {
            warn!(error = %e, "Skipping undecodable stream line");
            None
        }
    }
}

fn is_sse_field(line: &str) -> bool {
    ["event:", "id:", "retry:"]
        .iter()
        .any(|field| line.starts_with(field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_decode_plain_and_sse_lines() {
        let mut decoder = EventDecoder::default();
        let events = decoder.push(
            b"{\"type\":\"chunk\",\"content\":\"Hello\"}\n\
              data: {\"type\":\"chunk\",\"content\":\", world\"}\n\n\
              : keep-alive\n\
              event: message\n\
              data: {\"type\":\"complete\"}\n",
        );

        assert_eq!(
            events,
            vec![
                StreamEvent::chunk("Hello"),
                StreamEvent::chunk(", world"),
                StreamEvent::complete(),
            ]
        );
    }

    #[test]
    fn test_decode_across_chunk_boundaries() {
        let line = "data: {\"type\":\"chunk\",\"content\":\"héllo\"}\n".as_bytes();
        let split = line.iter().position(|b| *b == 0xc3).unwrap() + 1;
        let mut decoder = EventDecoder::default();

        assert!(decoder.push(&line[..split]).is_empty());
        assert_eq!(decoder.push(&line[split..]), vec![StreamEvent::chunk("héllo")]);
    }

    #[test]
    fn test_chunk_content_is_verbatim() {
        let mut decoder = EventDecoder::default();
        let events = decoder.push(b"data: {\"type\":\"chunk\",\"content\":\"  two spaces\\n\"}\n");
        assert_eq!(events, vec![StreamEvent::chunk("  two spaces\n")]);
    }

    #[test]
    fn test_decode_terminal_variants() {
        let mut decoder = EventDecoder::default();
        assert_eq!(decoder.push(b"data: [DONE]\n"), vec![StreamEvent::complete()]);
        assert_eq!(
            decoder.push(b"{\"type\":\"error\",\"error\":\"rate limited\"}\n"),
            vec![StreamEvent::error("rate limited")]
        );
        assert_eq!(
            decoder.push(b"{\"type\":\"complete\",\"message\":{\"id\":\"m1\",\"metadata\":{\"tokens\":42}}}\n"),
            vec![StreamEvent::Complete {
                metadata: Some(json!({"tokens": 42}))
            }]
        );
    }

    #[test]
    fn test_skip_garbage_and_flush_tail() {
        let mut decoder = EventDecoder::default();
        assert!(decoder.push(b"not json\n").is_empty());
        assert!(decoder.push(b"{\"type\":\"chunk\",\"content\":\"tail\"}").is_empty());
        assert_eq!(decoder.finish(), vec![StreamEvent::chunk("tail")]);
        assert!(decoder.finish().is_empty());
    }

    fn request() -> StreamRequest {
        StreamRequest {
            session_id: "s1".to_string(),
            content: "Explain recursion".to_string(),
            personality_id: None,
            provider_id: None,
            user_id: "u1".to_string(),
            is_continuation: false,
            partial_content: None,
        }
    }

    /// Serve one canned HTTP response and return the raw request received
    async fn serve_once(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if received.len() >= header_end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&received).to_string()
        });

        (base_url, server)
    }

    #[tokio::test]
    async fn test_streams_events_over_http() {
        let (base_url, server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n\
             data: {\"type\":\"chunk\",\"content\":\"Recursion \"}\n\n\
             data: {\"type\":\"chunk\",\"content\":\"is \"}\n\n\
             data: {\"type\":\"chunk\",\"content\":\"self-reference.\"}\n\n\
             data: {\"type\":\"complete\"}\n\n",
        )
        .await;

        let transport = HttpStreamTransport::new(TransportSettings {
            base_url,
            stream_path: "/api/chat/stream".to_string(),
            api_key: Some("secret".to_string()),
        });

        let mut handle = transport.open(request()).await.unwrap();
        let mut text = String::new();
        loop {
            match handle.next_event().await {
                Some(StreamEvent::Chunk(chunk)) => text.push_str(&chunk),
                Some(StreamEvent::Complete { .. }) => break,
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(text, "Recursion is self-reference.");

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /api/chat/stream"));
        assert!(raw.to_ascii_lowercase().contains("authorization: bearer secret"));
        assert!(raw.contains("\"sessionId\":\"s1\""));
    }

    #[tokio::test]
    async fn test_non_success_status_fails_open() {
        let (base_url, _server) = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 11\r\nConnection: close\r\n\r\nmaintenance",
        )
        .await;

        let transport = HttpStreamTransport::new(TransportSettings {
            base_url,
            ..Default::default()
        });

        let err = transport.open(request()).await.unwrap_err();
        match err {
            ChatError::Transport(message) => {
                assert!(message.contains("503"));
                assert!(message.contains("maintenance"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let transport = HttpStreamTransport::new(TransportSettings {
            base_url,
            ..Default::default()
        });

        match transport.open(request()).await.unwrap_err() {
            ChatError::Transport(message) => assert!(message.starts_with("Network error")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
