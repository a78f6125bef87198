use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One line of a recording file.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecordedEvent {
    pub timestamp: String,
    /// Groups a request with its response.
    pub correlation_id: String,
    pub event_type: EventType,
    pub direction: Direction,
    /// e.g. `webhook`, `GET /repos/octo/hello/pulls/1`, `response_200`
    pub operation: String,
    pub data: serde_json::Value,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum EventType {
    WebhookReceived,
    GitHubApiCall,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Direction {
    Request,
    Response,
}

pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";
