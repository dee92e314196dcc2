//! ActivityPub endpoints
//!
//! - Actor document
//! - Inbox and shared inbox (verify, queue, 202)
//! - Followers synchronization partial collection

use axum::body::Bytes;
use axum::{
    Router,
    extract::{OriginalUri, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};

use crate::AppState;
use crate::data::{Actor, SuspensionState};
use crate::error::{AppError, VerificationError};
use crate::metrics::HTTP_REQUESTS_TOTAL;
use crate::service::Job;

const ACTIVITY_JSON: &str = "application/activity+json";

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:username - Actor document
/// - POST /users/:username/inbox - Personal inbox
/// - POST /inbox - Shared inbox
/// - GET /users/:username/followers_synchronization - Followers on the signer's domain
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(actor))
        .route("/users/:username/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
        .route(
            "/users/:username/followers_synchronization",
            get(followers_synchronization),
        )
}

/// Count the request by the status it finally produced.
fn observe(method: &str, endpoint: &str, result: Result<Response, AppError>) -> Response {
    let response = result.into_response();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, endpoint, response.status().as_str()])
        .inc();
    response
}

fn activity_json(body: Value) -> Response {
    (
        [(header::CONTENT_TYPE, HeaderValue::from_static(ACTIVITY_JSON))],
        body.to_string(),
    )
        .into_response()
}

fn request_target(uri: &Uri) -> &str {
    uri.path_and_query()
        .map(|target| target.as_str())
        .unwrap_or_else(|| uri.path())
}

/// Look up a local account addressed by the URL, refusing suspended ones.
async fn addressed_account(state: &AppState, username: &str) -> Result<Actor, AppError> {
    let account = state
        .db
        .get_local_actor(username)
        .await?
        .ok_or(AppError::NotFound)?;
    match account.suspension() {
        SuspensionState::Active => Ok(account),
        SuspensionState::Permanent => Err(AppError::Gone),
        SuspensionState::Temporary => Err(AppError::Forbidden),
    }
}

/// GET /users/:username
///
/// Content-Type: application/activity+json
async fn actor(State(state): State<AppState>, Path(username): Path<String>) -> Response {
    observe("GET", "/users/:username", actor_document(&state, &username).await)
}

async fn actor_document(state: &AppState, username: &str) -> Result<Response, AppError> {
    let account = addressed_account(state, username).await?;

    let mut document = json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "type": account.actor_type,
        "id": account.uri,
        "preferredUsername": account.username,
        "inbox": account.inbox_url,
        "followers": account.followers_url,
        "manuallyApprovesFollowers": account.locked,
        "endpoints": {
            "sharedInbox": state.tags.shared_inbox_url()
        },
        "publicKey": {
            "id": account.key_id(),
            "owner": account.uri,
            "publicKeyPem": account.public_key_pem
        }
    });

    if let Some(featured) = &account.featured_url {
        document["featured"] = json!(featured);
    }
    let aliases = account.also_known_as_uris();
    if !aliases.is_empty() {
        document["alsoKnownAs"] = json!(aliases);
    }
    if let Some(moved_to) = &account.moved_to_uri {
        document["movedTo"] = json!(moved_to);
    }

    Ok(activity_json(document))
}

/// POST /users/:username/inbox
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result: Result<Response, AppError> = async {
        addressed_account(&state, &username).await?;
        receive(&state, &uri, &headers, &body).await
    }
    .await;
    observe("POST", "/users/:username/inbox", result)
}

/// POST /inbox
async fn shared_inbox(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    observe("POST", "/inbox", receive(&state, &uri, &headers, &body).await)
}

/// Verify an inbound POST and queue it for processing.
///
/// # Steps
/// 1. HTTP signature; the body's linked-data signature when there is none
/// 2. Collection-Synchronization header check
/// 3. Queue `ProcessInbound`
async fn receive(
    state: &AppState,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response, AppError> {
    let activity: Value = serde_json::from_slice(body)
        .map_err(|e| AppError::Validation(format!("invalid activity JSON: {}", e)))?;
    let activity_id = activity.get("id").and_then(Value::as_str).unwrap_or("");

    let verified = match state
        .verifier
        .verify_request("POST", request_target(uri), headers, Some(body))
        .await
    {
        Err(VerificationError::NoSignature) => state.verifier.verify_document(&activity).await,
        other => other,
    };

    let signer = match verified {
        Ok(signer) => signer,
        Err(VerificationError::NoSignature) if !state.config.federation.require_signature => {
            tracing::debug!(activity = activity_id, "Dropping unsigned activity");
            return Ok(StatusCode::ACCEPTED.into_response());
        }
        Err(VerificationError::NoSignature) => {
            tracing::debug!(activity = activity_id, "Unsigned activity rejected");
            return Err(AppError::Unauthorized);
        }
        Err(error) => {
            tracing::info!(activity = activity_id, %error, "Inbound signature rejected");
            return Err(AppError::InvalidSignature);
        }
    };

    if let Err(error) = state.delivery.mark_reachable(&signer).await {
        tracing::warn!(actor = %signer.uri, %error, "Failed to reset inbox failures");
    }

    if let Some(value) = headers
        .get("collection-synchronization")
        .and_then(|value| value.to_str().ok())
    {
        if let Err(error) = state.collection_sync.reconcile(&signer, value).await {
            tracing::warn!(actor = %signer.uri, %error, "Collection synchronization check failed");
        }
    }

    state
        .jobs
        .enqueue(Job::ProcessInbound {
            activity,
            signer_id: signer.id.clone(),
        })
        .await?;

    Ok(StatusCode::ACCEPTED.into_response())
}

/// GET /users/:username/followers_synchronization
///
/// Followers of the account whose URIs live on the signer's domain.
async fn followers_synchronization(
    State(state): State<AppState>,
    Path(username): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Response {
    observe(
        "GET",
        "/users/:username/followers_synchronization",
        partial_followers(&state, &username, &uri, &headers).await,
    )
}

async fn partial_followers(
    state: &AppState,
    username: &str,
    uri: &Uri,
    headers: &HeaderMap,
) -> Result<Response, AppError> {
    let account = addressed_account(state, username).await?;

    let signer = state
        .verifier
        .verify_request("GET", request_target(uri), headers, None)
        .await
        .map_err(|error| {
            tracing::debug!(account = %account.uri, %error, "Unsigned followers synchronization fetch");
            AppError::Unauthorized
        })?;

    let items = state
        .db
        .get_follower_uris_on_domain(&account.id, signer.domain.as_deref())
        .await?;

    let mut response = activity_json(json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": state.tags.followers_synchronization_url(&account.username),
        "type": "OrderedCollection",
        "orderedItems": items
    }));
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("max-age=0, private"),
    );
    Ok(response)
}
