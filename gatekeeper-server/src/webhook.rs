use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::post,
    Router,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::operations::{EventMeta, PullRequest, Repository, User};
use crate::recording::{Direction, EventType, RecordedEvent, Sanitizer};
use crate::AppState;

/// `pull_request` actions that start a review.
pub const REVIEW_ACTIONS: [&str; 4] = ["opened", "reopened", "synchronize", "review_requested"];

#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

#[derive(Debug, Deserialize)]
pub struct GitHubWebhookPayload {
    pub action: Option<String>,
    pub pull_request: Option<PullRequest>,
    pub repository: Option<Repository>,
    pub sender: Option<User>,
    pub installation: Option<Installation>,
    /// Present on `repository_dispatch` events.
    pub client_payload: Option<DispatchPayload>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Installation {
    pub id: u64,
}

/// Minimal pull request sent by `gatekeeper dispatch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchPayload {
    pub pull_request: PullRequest,
    pub owner: String,
    pub repository: String,
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub message: String,
}

/// A pull request event the bot should act on.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewRequest {
    pub pull_request: PullRequest,
    pub repository: Repository,
    pub meta: EventMeta,
}

type HmacSha256 = Hmac<Sha256>;

pub fn verify_github_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };

    mac.update(payload);

    // Use constant-time verification
    mac.verify_slice(&signature_bytes).is_ok()
}

async fn verify_webhook_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let correlation_id = CorrelationId(Uuid::new_v4().to_string());

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let signature = parts
        .headers
        .get("x-hub-signature-256")
        .and_then(|h| h.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !verify_github_signature(&state.webhook_secret, &bytes, signature) {
        error!("Invalid webhook signature");
        return Err(StatusCode::UNAUTHORIZED);
    }

    if let Some(ref logger) = state.recording_logger {
        let headers_map = headers_to_hashmap(&parts.headers);
        logger.record(RecordedEvent {
            timestamp: chrono::Utc::now().to_rfc3339(),
            correlation_id: correlation_id.0.clone(),
            event_type: EventType::WebhookReceived,
            direction: Direction::Request,
            operation: "webhook".to_string(),
            data: serde_json::json!({
                "headers": Sanitizer::sanitize_headers(&headers_map),
                "body": serde_json::from_slice::<serde_json::Value>(&bytes)
                    .unwrap_or(serde_json::Value::Null)
            }),
            metadata: HashMap::new(),
        });
    }

    let mut new_request = Request::from_parts(parts, axum::body::Body::from(bytes));
    new_request.extensions_mut().insert(correlation_id);

    Ok(next.run(new_request).await)
}

fn headers_to_hashmap(headers: &HeaderMap) -> HashMap<String, String> {
    crate::recording::middleware::header_map(headers)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Minimal repository for a dispatch payload; the review refetches it.
fn dispatch_repository(payload: &DispatchPayload, full: Option<Repository>) -> Repository {
    let key = format!("{}/{}", payload.owner, payload.repository);
    match full {
        Some(repo) if repo.key() == key => repo,
        _ => Repository {
            name: payload.repository.clone(),
            full_name: key,
            owner: User {
                login: payload.owner.clone(),
            },
            default_branch: "main".to_string(),
            allow_merge_commit: false,
            allow_rebase_merge: false,
            allow_squash_merge: false,
            archived: false,
        },
    }
}

/// Turn a webhook delivery into a review request, or `None` to ignore it.
pub fn review_request(
    event: &str,
    delivery_id: Option<String>,
    payload: GitHubWebhookPayload,
) -> Option<ReviewRequest> {
    let mut meta = EventMeta {
        event: event.to_string(),
        action: payload.action.clone().unwrap_or_default(),
        delivery_id,
        installation_id: payload.installation.as_ref().map(|i| i.id),
        sender: payload.sender.as_ref().map(|s| s.login.clone()),
    };

    match event {
        "pull_request" => {
            if !REVIEW_ACTIONS.contains(&meta.action.as_str()) {
                info!("Ignoring pull_request action {:?}", payload.action);
                return None;
            }
            let (Some(pull_request), Some(repository)) = (payload.pull_request, payload.repository)
            else {
                warn!("pull_request event without pull request or repository");
                return None;
            };
            Some(ReviewRequest {
                pull_request,
                repository,
                meta,
            })
        }
        "repository_dispatch" => {
            let Some(client_payload) = payload.client_payload else {
                warn!("repository_dispatch event without client payload");
                return None;
            };
            // Replays are handled exactly like a newly opened pull request.
            meta.action = "opened".to_string();
            let repository = dispatch_repository(&client_payload, payload.repository);
            Some(ReviewRequest {
                pull_request: client_payload.pull_request,
                repository,
                meta,
            })
        }
        other => {
            info!("Ignoring {} event", other);
            None
        }
    }
}

async fn process_review_request(state: Arc<AppState>, request: ReviewRequest) {
    let ReviewRequest {
        pull_request,
        repository,
        meta,
    } = request;
    let key = repository.key();
    let number = pull_request.number;

    let policy = match state.policy_source.load(&repository, &meta).await {
        Ok(Some(policy)) => policy,
        Ok(None) => {
            info!("No policy configured for {}, ignoring PR #{}", key, number);
            return;
        }
        Err(e) => {
            error!("Failed to load policy for {}: {:#}", key, e);
            return;
        }
    };

    match state
        .dispatcher
        .handle(pull_request, repository, policy, meta)
        .await
    {
        Ok(dispatched) => info!("PR #{} in {}: {:?}", number, key, dispatched),
        Err(e) => error!("Failed to process PR #{} in {}: {:#}", number, key, e),
    }
}

pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Json<WebhookResponse>, StatusCode> {
    let correlation_id = request
        .extensions()
        .get::<CorrelationId>()
        .map(|id| id.0.clone());

    let (parts, body) = request.into_parts();
    let event = header_value(&parts.headers, "x-github-event").unwrap_or_default();
    let delivery_id = header_value(&parts.headers, "x-github-delivery");
    info!(
        "Received {} webhook (delivery {:?}, correlation {:?})",
        event, delivery_id, correlation_id
    );

    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    let payload: GitHubWebhookPayload =
        serde_json::from_slice(&bytes).map_err(|_| StatusCode::BAD_REQUEST)?;

    let Some(request) = review_request(&event, delivery_id, payload) else {
        return Ok(Json(WebhookResponse {
            message: "Event ignored".to_string(),
        }));
    };

    info!(
        "Accepted PR #{} in {} ({})",
        request.pull_request.number,
        request.repository.key(),
        request.meta.action
    );
    tokio::spawn(process_review_request(state, request));

    Ok(Json(WebhookResponse {
        message: "Event accepted".to_string(),
    }))
}

pub fn webhook_router(middleware_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook", post(github_webhook_handler))
        .route_layer(middleware::from_fn_with_state(
            middleware_state,
            verify_webhook_signature,
        ))
}
