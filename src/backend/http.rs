//! HTTP backend adapters for OpenAI-compatible services.
//!
//! Every call goes through the shared [`ConnectionPool`], so slot reuse, the
//! global ceiling, per-request timeouts and transport retries apply to all
//! three services uniformly.  All connection details come from
//! [`BackendConfig`]; nothing is hardcoded beyond the standard endpoint paths:
//!
//! | Service     | Endpoint                         | Body            |
//! |-------------|----------------------------------|-----------------|
//! | Recognition | `POST /v1/audio/transcriptions`  | multipart       |
//! | Generation  | `POST /v1/chat/completions`      | JSON (+ SSE)    |
//! | Synthesis   | `POST /v1/audio/speech`          | JSON → binary   |
//! | Health      | `GET  /v1/models`                | —               |

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::extract::extract_text;
use super::message::{ChatMessage, Transcript};
use super::sse::{delta_content, SseDecoder, SseEvent};
use super::traits::{Generator, Recognizer, Synthesizer};
use crate::config::BackendConfig;
use crate::error::TaskError;
use crate::pool::{ConnectionPool, FormPart, RequestSpec, ResponseBody, ResponseKind};

fn endpoint(base: &str, path: &str) -> String {
    format!("{}{path}", base.trim_end_matches('/'))
}

async fn ping(pool: &ConnectionPool, base: &str, api_key: Option<&str>) -> Result<(), TaskError> {
    pool.request(
        RequestSpec::get(endpoint(base, "/v1/models"))
            .bearer(api_key)
            .expect(ResponseKind::Binary)
            .max_retries(0),
    )
    .await
    .map(|_| ())
}

// ---------------------------------------------------------------------------
// HttpRecognizer
// ---------------------------------------------------------------------------

/// Calls `/v1/audio/transcriptions` with the audio as a multipart upload.
pub struct HttpRecognizer {
    pool: ConnectionPool,
    config: BackendConfig,
}

impl HttpRecognizer {
    pub fn new(pool: ConnectionPool, config: &BackendConfig) -> Self {
        Self {
            pool,
            config: config.clone(),
        }
    }
}

#[async_trait]
impl Recognizer for HttpRecognizer {
    async fn transcribe(&self, audio: Bytes) -> Result<Transcript, TaskError> {
        let spec = RequestSpec::post(endpoint(
            &self.config.recognition_url,
            "/v1/audio/transcriptions",
        ))
        .bearer(self.config.api_key.as_deref())
        .multipart(vec![
            FormPart::File {
                name: "file".into(),
                file_name: "utterance.wav".into(),
                mime: "audio/wav".into(),
                data: audio,
            },
            FormPart::Text {
                name: "model".into(),
                value: self.config.recognition_model.clone(),
            },
            FormPart::Text {
                name: "response_format".into(),
                value: "verbose_json".into(),
            },
        ]);

        let json = match self.pool.request(spec).await {
            Ok(body) => body.into_json()?,
            Err(TaskError::Parse(raw)) => {
                let text = extract_text(&raw).ok_or(TaskError::Parse(raw))?;
                return Ok(Transcript::new(text));
            }
            Err(e) => return Err(e),
        };
        parse_transcript(&json)
    }

    async fn health(&self) -> Result<(), TaskError> {
        ping(&self.pool, &self.config.recognition_url, self.config.api_key.as_deref()).await
    }
}

fn parse_transcript(json: &serde_json::Value) -> Result<Transcript, TaskError> {
    let text = json["text"]
        .as_str()
        .map(str::trim)
        .ok_or_else(|| TaskError::Parse(format!("no text in transcription: {json}")))?
        .to_string();
    let duration = json["duration"]
        .as_f64()
        .filter(|d| d.is_finite() && *d >= 0.0)
        .map(Duration::from_secs_f64);

    // verbose_json reports per-segment avg_logprob; exp() of the mean
    // approximates a [0, 1] confidence.
    let confidence = json["segments"].as_array().and_then(|segments| {
        let logprobs: Vec<f64> = segments
            .iter()
            .filter_map(|s| s["avg_logprob"].as_f64())
            .collect();
        (!logprobs.is_empty())
            .then(|| (logprobs.iter().sum::<f64>() / logprobs.len() as f64).exp() as f32)
    });

    Ok(Transcript {
        text,
        confidence,
        duration,
    })
}

// ---------------------------------------------------------------------------
// HttpGenerator
// ---------------------------------------------------------------------------

/// Calls `/v1/chat/completions`, buffered or as an SSE stream.
///
/// The `Authorization: Bearer …` header is attached only when
/// `config.api_key` is a non-empty string, so local providers that need no
/// authentication work unchanged.
pub struct HttpGenerator {
    pool: ConnectionPool,
    config: BackendConfig,
}

impl HttpGenerator {
    pub fn new(pool: ConnectionPool, config: &BackendConfig) -> Self {
        Self {
            pool,
            config: config.clone(),
        }
    }

    fn spec(&self, messages: &[ChatMessage], stream: bool) -> RequestSpec {
        let body = serde_json::json!({
            "model":       self.config.generation_model,
            "messages":    messages,
            "stream":      stream,
            "temperature": self.config.temperature,
        });
        RequestSpec::post(endpoint(&self.config.generation_url, "/v1/chat/completions"))
            .bearer(self.config.api_key.as_deref())
            .json(body)
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, TaskError> {
        let text = match self.pool.request(self.spec(messages, false)).await {
            Ok(ResponseBody::Json(json)) => json["choices"][0]["message"]["content"]
                .as_str()
                .map(str::to_string)
                .ok_or(TaskError::EmptyResponse)?,
            Ok(other) => other.into_text()?,
            Err(TaskError::Parse(raw)) => extract_text(&raw).ok_or(TaskError::Parse(raw))?,
            Err(e) => return Err(e),
        };

        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(TaskError::EmptyResponse);
        }
        Ok(text)
    }

    async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        sink: mpsc::Sender<String>,
    ) -> Result<String, TaskError> {
        let mut lease = self.pool.stream(self.spec(messages, true)).await?;
        let mut decoder = SseDecoder::new();
        let mut full = String::new();

        let fail = |full: &str, e: TaskError| {
            if full.is_empty() || e.is_cancelled() {
                e
            } else {
                TaskError::Interrupted(e.to_string())
            }
        };

        let mut finished = false;
        while !finished {
            let events = match lease.next_chunk().await {
                Some(Ok(chunk)) => decoder.push(&chunk),
                Some(Err(e)) => return Err(fail(&full, e)),
                None => {
                    finished = true;
                    decoder.finish().into_iter().collect()
                }
            };

            for event in events {
                let data = match event {
                    SseEvent::Done => {
                        finished = true;
                        break;
                    }
                    SseEvent::Data(data) => data,
                };
                let Some(fragment) = delta_content(&data) else {
                    continue;
                };
                full.push_str(&fragment);
                if sink.send(fragment).await.is_err() {
                    return Err(TaskError::Cancelled);
                }
            }
        }

        let text = full.trim().to_string();
        if text.is_empty() {
            return Err(TaskError::EmptyResponse);
        }
        log::debug!("pipeline: generation streamed {} chars", text.len());
        Ok(text)
    }

    async fn health(&self) -> Result<(), TaskError> {
        ping(&self.pool, &self.config.generation_url, self.config.api_key.as_deref()).await
    }
}

// ---------------------------------------------------------------------------
// HttpSynthesizer
// ---------------------------------------------------------------------------

/// Calls `/v1/audio/speech` and returns the audio bytes untouched.
pub struct HttpSynthesizer {
    pool: ConnectionPool,
    config: BackendConfig,
}

impl HttpSynthesizer {
    pub fn new(pool: ConnectionPool, config: &BackendConfig) -> Self {
        Self {
            pool,
            config: config.clone(),
        }
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Bytes, TaskError> {
        let body = serde_json::json!({
            "model": self.config.synthesis_model,
            "input": text,
            "voice": voice,
        });
        let audio = self
            .pool
            .request(
                RequestSpec::post(endpoint(&self.config.synthesis_url, "/v1/audio/speech"))
                    .bearer(self.config.api_key.as_deref())
                    .json(body)
                    .expect(ResponseKind::Binary),
            )
            .await?
            .into_bytes()?;

        if audio.is_empty() {
            return Err(TaskError::EmptyResponse);
        }
        Ok(audio)
    }

    async fn health(&self) -> Result<(), TaskError> {
        ping(&self.pool, &self.config.synthesis_url, self.config.api_key.as_deref()).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pool() -> ConnectionPool {
        ConnectionPool::new(PoolConfig {
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 2,
            ..PoolConfig::default()
        })
    }

    fn config_for(server: &MockServer, api_key: Option<&str>) -> BackendConfig {
        BackendConfig {
            recognition_url: server.uri(),
            generation_url: format!("{}/", server.uri()),
            synthesis_url: server.uri(),
            api_key: api_key.map(str::to_string),
            ..BackendConfig::default()
        }
    }

    // ---- Recognition ---

    #[tokio::test]
    async fn transcription_reads_text_duration_and_confidence() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/audio/transcriptions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "text": " hello ",
                "duration": 1.5,
                "segments": [{"avg_logprob": 0.0}]
            })))
            .mount(&server)
            .await;

        let rec = HttpRecognizer::new(pool(), &config_for(&server, None));
        let t = rec.transcribe(Bytes::from_static(b"RIFF")).await.unwrap();
        assert_eq!(t.text, "hello");
        assert_eq!(t.duration, Some(Duration::from_millis(1500)));
        assert!((t.confidence.unwrap() - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn transcription_falls_back_to_plain_text_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello world"))
            .mount(&server)
            .await;

        let rec = HttpRecognizer::new(pool(), &config_for(&server, None));
        let t = rec.transcribe(Bytes::from_static(b"RIFF")).await.unwrap();
        assert_eq!(t.text, "hello world");
        assert_eq!(t.confidence, None);
    }

    // ---- Generation ---

    #[tokio::test]
    async fn buffered_generation_sends_messages_and_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "stream": false,
                "messages": [{"role": "user", "content": "hello"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": " Hi! "}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gen = HttpGenerator::new(pool(), &config_for(&server, Some("sk-test")));
        let reply = gen.generate(&[ChatMessage::user("hello")]).await.unwrap();
        assert_eq!(reply, "Hi!");
    }

    #[tokio::test]
    async fn empty_generation_is_reported_as_empty_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "   "}}]
            })))
            .mount(&server)
            .await;

        let gen = HttpGenerator::new(pool(), &config_for(&server, None));
        let err = gen.generate(&[ChatMessage::user("hi")]).await.unwrap_err();
        assert_eq!(err, TaskError::EmptyResponse);
    }

    #[tokio::test]
    async fn malformed_generation_uses_local_extraction() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"choices":[{"message":{"content":"Partial answer."#,
            ))
            .mount(&server)
            .await;

        let gen = HttpGenerator::new(pool(), &config_for(&server, None));
        let reply = gen.generate(&[ChatMessage::user("hi")]).await.unwrap();
        assert_eq!(reply, "Partial answer.");
    }

    #[tokio::test]
    async fn streaming_generation_forwards_fragments_in_order() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi! \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"How are you?\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let gen = HttpGenerator::new(pool(), &config_for(&server, None));
        let (tx, mut rx) = mpsc::channel(8);
        let full = gen
            .generate_stream(&[ChatMessage::user("hello")], tx)
            .await
            .unwrap();

        assert_eq!(full, "Hi! How are you?");
        let mut fragments = Vec::new();
        while let Some(f) = rx.recv().await {
            fragments.push(f);
        }
        assert_eq!(fragments, vec!["Hi! ", "How are you?"]);
    }

    #[tokio::test]
    async fn streaming_without_done_marker_still_completes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "data: {\"choices\":[{\"delta\":{\"content\":\"Bye.\"}}]}",
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        let gen = HttpGenerator::new(pool(), &config_for(&server, None));
        let (tx, _rx) = mpsc::channel(8);
        let full = gen.generate_stream(&[ChatMessage::user("x")], tx).await.unwrap();
        assert_eq!(full, "Bye.");
    }

    // ---- Synthesis ---

    #[tokio::test]
    async fn synthesis_returns_exact_audio_bytes() {
        let server = MockServer::start().await;
        let audio: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        Mock::given(method("POST"))
            .and(path("/v1/audio/speech"))
            .and(body_partial_json(serde_json::json!({"input": "Hi!", "voice": "nova"})))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(audio.clone()))
            .mount(&server)
            .await;

        let synth = HttpSynthesizer::new(pool(), &config_for(&server, None));
        let out = synth.synthesize("Hi!", "nova").await.unwrap();
        assert_eq!(out.as_ref(), audio.as_slice());
    }

    #[tokio::test]
    async fn health_check_reports_unreachable_backend() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let synth = HttpSynthesizer::new(pool(), &config_for(&server, None));
        assert!(matches!(synth.health().await, Err(TaskError::Backend(_))));
    }
}
