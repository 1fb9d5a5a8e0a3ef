//! Client for Dot-OCR style document parsers exposed through an
//! OpenAI-compatible chat completions endpoint.

use crate::error::RecognitionError;
use crate::layout::{parse_layout, LayoutElement, LayoutStreamParser};
use crate::raster::NormalizedImage;
use crate::recognizer::{RecognitionRequest, Recognizer, TokenSink};
use async_trait::async_trait;
use base64::Engine as _;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_CHAT_COMPLETIONS_ENDPOINT: &str = "v1/chat/completions";
pub const DEFAULT_MODEL: &str = "dotsocr-model";
pub const DEFAULT_MAX_TOKENS: u32 = 2048;

pub const DEFAULT_INSTRUCTION: &str = "Please output the layout information from the PDF image, \
including each layout element's bbox, its category, and the corresponding text content within the bbox.\n\n\
1. Bbox format: [x1, y1, x2, y2]\n\n\
2. Layout Categories: The possible categories are ['Caption', 'Footnote', 'Formula', 'List-item', \
'Page-footer', 'Page-header', 'Picture', 'Section-header', 'Table', 'Text', 'Title'].\n\n\
3. Text Extraction & Formatting Rules:\n\
    - Picture: For the 'Picture' category, the text field should be omitted.\n\
    - Formula: Format its text as LaTeX.\n\
    - Table: Format its text as HTML.\n\
    - All Others (Text, Title, etc.): Format their text as Markdown.\n\n\
4. Constraints:\n\
    - The output text must be the original text from the image, with no translation.\n\
    - All layout elements must be sorted according to human reading order.\n\n\
5. Final Output: The entire output must be a single JSON object.";

const ERROR_BODY_PREVIEW: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteOptions {
    pub base_url: String,
    pub chat_completions_endpoint: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub instruction: String,
    pub api_key: Option<String>,
    pub stream: bool,
    pub connect_timeout: Duration,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            chat_completions_endpoint: DEFAULT_CHAT_COMPLETIONS_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.0,
            max_tokens: DEFAULT_MAX_TOKENS,
            instruction: DEFAULT_INSTRUCTION.to_string(),
            api_key: None,
            stream: false,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: [ContentPart<'a>; 2],
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    ImageUrl { image_url: ImageUrl },
    Text { text: &'a str },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChoiceContent>,
    #[serde(default)]
    delta: Option<ChoiceContent>,
}

#[derive(Deserialize, Default)]
struct ChoiceContent {
    #[serde(default)]
    content: Option<String>,
}

impl ChatResponse {
    fn message_content(self) -> Option<String> {
        self.choices.into_iter().next()?.message?.content
    }

    fn delta_content(self) -> Option<String> {
        self.choices.into_iter().next()?.delta?.content
    }
}

/// Splits a byte stream into server-sent-event `data:` payloads. Chunks may
/// end anywhere, including inside a UTF-8 sequence.
#[derive(Debug, Default)]
struct SseDecoder {
    pending: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                events.push(data.trim_start().to_string());
            }
        }
        events
    }
}

pub struct RemoteRecognizer {
    client: Client,
    endpoint: Url,
    options: RemoteOptions,
}

impl RemoteRecognizer {
    pub fn new(options: RemoteOptions) -> Result<Self, RecognitionError> {
        let endpoint = endpoint_url(&options.base_url, &options.chat_completions_endpoint)?;
        let client = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(|e| RecognitionError::backend(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            options,
        })
    }

    fn request_body<'a>(&'a self, data_uri: String) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.options.model,
            temperature: self.options.temperature,
            max_tokens: self.options.max_tokens,
            stream: self.options.stream,
            messages: [ChatMessage {
                role: "user",
                content: [
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: data_uri },
                    },
                    ContentPart::Text {
                        text: &self.options.instruction,
                    },
                ],
            }],
        }
    }

    async fn send(
        &self,
        image: Arc<NormalizedImage>,
        request: &RecognitionRequest,
        sink: &TokenSink,
    ) -> Result<(), RecognitionError> {
        let png = tokio::task::spawn_blocking(move || image.encode_png())
            .await
            .map_err(RecognitionError::backend)?
            .map_err(|e| RecognitionError::backend(format!("png encode failed: {e}")))?;
        let data_uri = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(png)
        );

        let remaining = request.remaining();
        if remaining.is_zero() {
            return Err(RecognitionError::Timeout);
        }
        let mut builder = self
            .client
            .post(self.endpoint.clone())
            .timeout(remaining)
            .json(&self.request_body(data_uri));
        if let Some(key) = self.options.api_key.as_deref().filter(|k| !k.is_empty()) {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let preview: String = body.chars().take(ERROR_BODY_PREVIEW).collect();
            warn!(
                target: "ocr.remote",
                event = "remote.http_error",
                status = status.as_u16(),
                response = %preview,
            );
            return Err(RecognitionError::Backend(format!(
                "remote service answered {status}: {preview}"
            )));
        }

        if self.options.stream {
            self.consume_stream(response, sink).await
        } else {
            let reply: ChatResponse = response.json().await.map_err(map_transport_error)?;
            let content = reply
                .message_content()
                .ok_or_else(|| RecognitionError::backend("remote reply has no message content"))?;
            sink.extend(parse_layout(&content));
            Ok(())
        }
    }

    async fn consume_stream(
        &self,
        response: reqwest::Response,
        sink: &TokenSink,
    ) -> Result<(), RecognitionError> {
        let mut decoder = SseDecoder::default();
        let mut parser = LayoutStreamParser::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_transport_error)?;
            for data in decoder.push(&chunk) {
                if data == "[DONE]" {
                    return finish_stream(&parser);
                }
                let delta = serde_json::from_str::<ChatResponse>(&data)
                    .map_err(|e| RecognitionError::backend(format!("bad stream chunk: {e}")))?
                    .delta_content();
                if let Some(fragment) = delta {
                    let tokens = parser
                        .feed(&fragment)
                        .into_iter()
                        .filter_map(LayoutElement::into_token);
                    sink.extend(tokens);
                }
            }
        }
        finish_stream(&parser)
    }
}

fn finish_stream(parser: &LayoutStreamParser) -> Result<(), RecognitionError> {
    if parser.is_balanced() {
        Ok(())
    } else {
        Err(RecognitionError::backend("remote stream ended inside a layout element"))
    }
}

fn endpoint_url(base_url: &str, endpoint: &str) -> Result<Url, RecognitionError> {
    let base = if base_url.ends_with('/') {
        base_url.to_string()
    } else {
        format!("{base_url}/")
    };
    let base = Url::parse(&base)
        .map_err(|e| RecognitionError::backend(format!("invalid remote base_url {base_url:?}: {e}")))?;
    base.join(endpoint.trim_start_matches('/'))
        .map_err(|e| RecognitionError::backend(format!("invalid endpoint {endpoint:?}: {e}")))
}

fn map_transport_error(err: reqwest::Error) -> RecognitionError {
    if err.is_timeout() {
        RecognitionError::Timeout
    } else {
        RecognitionError::backend(format!("remote transport: {err}"))
    }
}

#[async_trait]
impl Recognizer for RemoteRecognizer {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn reports_partial(&self) -> bool {
        self.options.stream
    }

    async fn recognize(
        &self,
        image: Arc<NormalizedImage>,
        request: RecognitionRequest,
        sink: TokenSink,
    ) -> Result<(), RecognitionError> {
        let started = Instant::now();
        let outcome = tokio::select! {
            outcome = self.send(image, &request, &sink) => outcome,
            _ = request.cancel.cancelled() => Err(RecognitionError::Cancelled),
        };
        debug!(
            target: "ocr.remote",
            event = "remote.call_finished",
            endpoint = %self.endpoint,
            tokens = sink.len(),
            ok = outcome.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_with_or_without_slashes() {
        let a = endpoint_url("http://dots:8000", "v1/chat/completions").unwrap();
        let b = endpoint_url("http://dots:8000/", "/v1/chat/completions").unwrap();
        assert_eq!(a.as_str(), "http://dots:8000/v1/chat/completions");
        assert_eq!(a, b);
        let nested = endpoint_url("https://gw.example/ocr", "v1/chat/completions").unwrap();
        assert_eq!(nested.as_str(), "https://gw.example/ocr/v1/chat/completions");
        assert!(endpoint_url("not a url", "v1").is_err());
    }

    #[test]
    fn request_body_shape() {
        let recognizer = RemoteRecognizer::new(RemoteOptions {
            base_url: "http://localhost:8000".into(),
            ..RemoteOptions::default()
        })
        .unwrap();
        let body = serde_json::to_value(recognizer.request_body("data:image/png;base64,AAAA".into()))
            .unwrap();
        assert_eq!(body["model"], DEFAULT_MODEL);
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["stream"], false);
        let content = &body["messages"][0]["content"];
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(content[0]["type"], "image_url");
        assert_eq!(content[0]["image_url"]["url"], "data:image/png;base64,AAAA");
        assert_eq!(content[1]["type"], "text");
        assert_eq!(content[1]["text"], DEFAULT_INSTRUCTION);
    }

    #[test]
    fn sse_decoder_handles_split_lines() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        let events = decoder.push(b":1}\r\n\r\n: keep-alive\ndata: [DONE]\n");
        assert_eq!(events, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn sse_decoder_keeps_split_utf8() {
        let mut decoder = SseDecoder::default();
        let line = "data: größe\n".as_bytes();
        let (head, tail) = line.split_at(9);
        assert!(decoder.push(head).is_empty());
        assert_eq!(decoder.push(tail), vec!["größe".to_string()]);
    }

    #[test]
    fn chat_reply_content_extraction() {
        let reply: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"index":0,"message":{"role":"assistant","content":"[]"}}]}"#,
        )
        .unwrap();
        assert_eq!(reply.message_content().as_deref(), Some("[]"));

        let chunk: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"index":0,"delta":{"content":"[{"}}]}"#).unwrap();
        assert_eq!(chunk.delta_content().as_deref(), Some("[{"));
    }

    #[test]
    fn only_streaming_mode_reports_partial() {
        let plain = RemoteRecognizer::new(RemoteOptions {
            base_url: "http://localhost:8000".into(),
            ..RemoteOptions::default()
        })
        .unwrap();
        assert!(!plain.reports_partial());
        let streaming = RemoteRecognizer::new(RemoteOptions {
            base_url: "http://localhost:8000".into(),
            stream: true,
            ..RemoteOptions::default()
        })
        .unwrap();
        assert!(streaming.reports_partial());
    }
}
