//! Request description and response decoding for the connection pool.

use std::time::Duration;

use bytes::Bytes;
use reqwest::{Method, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;

/// Longest slice of an error body kept in an error message.
const ERROR_BODY_LIMIT: usize = 200;

// ---------------------------------------------------------------------------
// ResponseKind / ResponseBody
// ---------------------------------------------------------------------------

/// How the pool should interpret a successful response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseKind {
    #[default]
    Json,
    Binary,
    Text,
}

/// A decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(serde_json::Value),
    /// Exact bytes as received.
    Binary(Bytes),
    Text(String),
}

impl ResponseBody {
    pub fn into_json(self) -> Result<serde_json::Value, TaskError> {
        match self {
            ResponseBody::Json(v) => Ok(v),
            other => Err(TaskError::Internal(format!("expected JSON body, got {other:?}"))),
        }
    }

    pub fn into_bytes(self) -> Result<Bytes, TaskError> {
        match self {
            ResponseBody::Binary(b) => Ok(b),
            ResponseBody::Text(t) => Ok(Bytes::from(t)),
            ResponseBody::Json(_) => Err(TaskError::Internal("expected binary body, got JSON".into())),
        }
    }

    pub fn into_text(self) -> Result<String, TaskError> {
        match self {
            ResponseBody::Text(t) => Ok(t),
            ResponseBody::Binary(b) => Ok(String::from_utf8_lossy(&b).into_owned()),
            ResponseBody::Json(v) => Ok(v.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// RequestBody
// ---------------------------------------------------------------------------

/// One field of a multipart form.
#[derive(Debug, Clone)]
pub enum FormPart {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        mime: String,
        data: Bytes,
    },
}

/// Request payload.  Kept in a rebuildable form so retries can resend it.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    Bytes {
        data: Bytes,
        content_type: String,
    },
    Multipart(Vec<FormPart>),
}

// ---------------------------------------------------------------------------
// RequestSpec
// ---------------------------------------------------------------------------

/// Everything the pool needs to execute (and re-execute) one HTTP call.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub body: RequestBody,
    pub headers: Vec<(String, String)>,
    pub bearer: Option<String>,
    pub expect: ResponseKind,
    /// Overrides the pool's default request timeout.
    pub timeout: Option<Duration>,
    /// Overrides the pool's default retry count.
    pub max_retries: Option<u32>,
    /// Cancelling this token aborts the request and any pending retry.
    pub cancel: Option<CancellationToken>,
}

impl RequestSpec {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: RequestBody::Empty,
            headers: Vec::new(),
            bearer: None,
            expect: ResponseKind::Json,
            timeout: None,
            max_retries: None,
            cancel: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn bytes(mut self, data: Bytes, content_type: impl Into<String>) -> Self {
        self.body = RequestBody::Bytes {
            data,
            content_type: content_type.into(),
        };
        self
    }

    pub fn multipart(mut self, parts: Vec<FormPart>) -> Self {
        self.body = RequestBody::Multipart(parts);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach `Authorization: Bearer …` only for a non-empty key.
    pub fn bearer(mut self, key: Option<&str>) -> Self {
        self.bearer = key.filter(|k| !k.is_empty()).map(str::to_string);
        self
    }

    pub fn expect(mut self, kind: ResponseKind) -> Self {
        self.expect = kind;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Pool key for the target: `scheme://host:port`.
    pub fn host_key(&self) -> Result<String, TaskError> {
        let url = reqwest::Url::parse(&self.url)
            .map_err(|e| TaskError::Rejected(format!("invalid URL {:?}: {e}", self.url)))?;
        let host = url
            .host_str()
            .ok_or_else(|| TaskError::Rejected(format!("URL has no host: {}", self.url)))?;
        let port = url.port_or_known_default().unwrap_or(0);
        Ok(format!("{}://{host}:{port}", url.scheme()))
    }

    /// Build a fresh `reqwest` request for one attempt.
    pub(crate) fn build(&self, client: &reqwest::Client) -> Result<reqwest::RequestBuilder, TaskError> {
        let mut req = client.request(self.method.clone(), &self.url);
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &self.bearer {
            req = req.bearer_auth(token);
        }

        req = match &self.body {
            RequestBody::Empty => req,
            RequestBody::Json(v) => req.json(v),
            RequestBody::Bytes { data, content_type } => req
                .header(reqwest::header::CONTENT_TYPE, content_type.as_str())
                .body(data.clone()),
            RequestBody::Multipart(parts) => req.multipart(build_form(parts)?),
        };
        Ok(req)
    }
}

fn build_form(parts: &[FormPart]) -> Result<reqwest::multipart::Form, TaskError> {
    let mut form = reqwest::multipart::Form::new();
    for part in parts {
        form = match part {
            FormPart::Text { name, value } => form.text(name.clone(), value.clone()),
            FormPart::File {
                name,
                file_name,
                mime,
                data,
            } => {
                let file = reqwest::multipart::Part::bytes(data.to_vec())
                    .file_name(file_name.clone())
                    .mime_str(mime)
                    .map_err(|e| TaskError::Rejected(format!("invalid MIME type {mime:?}: {e}")))?;
                form.part(name.clone(), file)
            }
        };
    }
    Ok(form)
}

// ---------------------------------------------------------------------------
// Response handling
// ---------------------------------------------------------------------------

/// Map a non-success status to the error taxonomy: 5xx and 429 are
/// retryable, every other status is permanent.
pub(crate) fn status_error(status: StatusCode, body: &str) -> TaskError {
    let snippet: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    let msg = format!("HTTP {status}: {}", snippet.trim());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        TaskError::Backend(msg)
    } else {
        TaskError::Rejected(msg)
    }
}

/// Fail on non-success status, draining the error body for the message.
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TaskError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

/// Read a successful body according to `kind`.
///
/// A `Json` body that does not decode becomes [`TaskError::Parse`] carrying
/// the raw text, so callers can still try to salvage text from it.
pub(crate) async fn read_body(
    response: reqwest::Response,
    kind: ResponseKind,
) -> Result<ResponseBody, TaskError> {
    let bytes = response.bytes().await?;
    match kind {
        ResponseKind::Binary => Ok(ResponseBody::Binary(bytes)),
        ResponseKind::Text => Ok(ResponseBody::Text(String::from_utf8_lossy(&bytes).into_owned())),
        ResponseKind::Json => match serde_json::from_slice(&bytes) {
            Ok(v) => Ok(ResponseBody::Json(v)),
            Err(_) => Err(TaskError::Parse(String::from_utf8_lossy(&bytes).into_owned())),
        },
    }
}
