use super::sanitizer::Sanitizer;
use super::types::{Direction, EventType, RecordedEvent, CORRELATION_ID_HEADER};
use super::RecordingLogger;
use axum::http;
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next, Result as MiddlewareResult};
use std::collections::HashMap;
use uuid::Uuid;

/// Records every GitHub request and the status of its response.
pub struct RecordingMiddleware {
    logger: RecordingLogger,
}

impl RecordingMiddleware {
    pub fn new(logger: RecordingLogger) -> Self {
        Self { logger }
    }

    fn emit(
        &self,
        correlation_id: &str,
        direction: Direction,
        operation: String,
        data: serde_json::Value,
    ) {
        self.logger.record(RecordedEvent {
            timestamp: chrono::Utc::now().to_rfc3339(),
            correlation_id: correlation_id.to_string(),
            event_type: EventType::GitHubApiCall,
            direction,
            operation,
            data,
            metadata: HashMap::new(),
        });
    }
}

#[async_trait::async_trait]
impl Middleware for RecordingMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> MiddlewareResult<Response> {
        let correlation_id = req
            .headers()
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if !req.headers().contains_key(CORRELATION_ID_HEADER) {
            if let Ok(value) = correlation_id.parse() {
                req.headers_mut().insert(CORRELATION_ID_HEADER, value);
            }
        }

        let body = match req.body().and_then(|b| b.as_bytes()) {
            Some(bytes) if bytes.len() > 10_000 => {
                serde_json::json!(format!("[LARGE_BODY_{}b]", bytes.len()))
            }
            Some(bytes) => serde_json::from_slice::<serde_json::Value>(bytes)
                .map(|v| Sanitizer::sanitize_json(&v))
                .unwrap_or_else(|_| serde_json::json!(String::from_utf8_lossy(bytes))),
            None => serde_json::Value::Null,
        };
        self.emit(
            &correlation_id,
            Direction::Request,
            format!("{} {}", req.method(), req.url().path()),
            serde_json::json!({
                "url": req.url().to_string(),
                "headers": Sanitizer::sanitize_headers(&header_map(req.headers())),
                "body": body,
            }),
        );

        let response = next.run(req, extensions).await;

        match &response {
            Ok(resp) => self.emit(
                &correlation_id,
                Direction::Response,
                format!("response_{}", resp.status().as_u16()),
                serde_json::json!({
                    "status_code": resp.status().as_u16(),
                    "headers": Sanitizer::sanitize_headers(&header_map(resp.headers())),
                    "body_size": resp.content_length().unwrap_or(0),
                }),
            ),
            Err(err) => self.emit(
                &correlation_id,
                Direction::Response,
                "error".to_string(),
                serde_json::json!({ "error": err.to_string() }),
            ),
        }

        response
    }
}

pub(crate) fn header_map(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect()
}
