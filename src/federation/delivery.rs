//! Activity delivery
//!
//! Drains the `delivery_tasks` queue: each task is one signed POST of an
//! activity to one remote inbox. Transient failures are retried with
//! exponential backoff; permanent failures drop the task and count towards
//! marking the inbox unreachable.

use rand::Rng;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use super::collection_sync::outbound_header;
use super::signature::{ensure_remote_destination, sign_request};
use super::tag_manager::{TagManager, authority_of};
use crate::config::{DeliveryConfig, FederationConfig};
use crate::data::{Actor, Database, DeliveryTask, now_ms};
use crate::error::{AppError, DeliveryError};
use crate::metrics::{DELIVERY_ATTEMPTS, DELIVERY_DURATION_SECONDS, UNREACHABLE_INBOXES};

/// How long a claimed task stays leased to one worker
const LEASE_MS: i64 = 5 * 60 * 1000;

/// What happened to a task after one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Transient failure, retried at the given unix millisecond
    Retrying { next_attempt_at_ms: i64 },
    /// Transient failures exhausted the attempt budget
    Exhausted,
    /// Permanent failure; `now_unreachable` when this failure crossed the threshold
    Dropped { now_unreachable: bool },
}

/// Map an HTTP response status to the delivery taxonomy. `None` is success.
pub fn classify_status(status: StatusCode) -> Option<DeliveryError> {
    if status.is_success() {
        return None;
    }
    let reason = format!("HTTP {}", status.as_u16());
    match status.as_u16() {
        // 401/403 mean the remote rejected our signature
        401 | 403 | 404 | 410 => Some(DeliveryError::Permanent(reason)),
        408 | 429 => Some(DeliveryError::Transient(reason)),
        code if code >= 500 => Some(DeliveryError::Transient(reason)),
        _ => Some(DeliveryError::Permanent(reason)),
    }
}

/// Delay before the retry that follows `attempts` failed attempts:
/// `base * 2^(attempts - 1)` capped at the configured maximum, plus up to
/// 10% jitter.
pub fn backoff_delay(config: &DeliveryConfig, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(30);
    let base = config.base_backoff_secs.saturating_mul(1u64 << exponent);
    let capped = base.min(config.max_backoff_secs);
    let jitter_ms = if capped == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=capped * 100)
    };
    Duration::from_secs(capped) + Duration::from_millis(jitter_ms)
}

/// Delivery worker
///
/// Several instances may share one database: claimed tasks are leased, so
/// each task is attempted by one worker at a time.
///
/// An inbox becomes unreachable after `unreachable_threshold` consecutive
/// failures. Permanent failures count, and so does a task that used up all
/// its transient retries. Any successful delivery, or a verified request
/// signed by an actor using the inbox, resets the count.
pub struct DeliveryWorker {
    db: Arc<Database>,
    tags: Arc<TagManager>,
    http_client: reqwest::Client,
    config: DeliveryConfig,
    request_timeout: Duration,
    allow_private_addresses: bool,
    wake: Arc<Notify>,
}

impl DeliveryWorker {
    pub fn new(
        db: Arc<Database>,
        tags: Arc<TagManager>,
        http_client: reqwest::Client,
        config: DeliveryConfig,
        federation: &FederationConfig,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            db,
            tags,
            http_client,
            config,
            request_timeout: federation.request_timeout(),
            allow_private_addresses: federation.allow_private_addresses,
            wake,
        }
    }

    /// Perform one signed POST for `task`.
    pub async fn deliver(&self, task: &DeliveryTask) -> Result<(), DeliveryError> {
        let sender = self
            .db
            .get_actor(&task.sender_actor_id)
            .await
            .map_err(|e| DeliveryError::Transient(e.to_string()))?
            .ok_or_else(|| DeliveryError::Permanent("sender no longer exists".to_string()))?;
        let private_key_pem = sender
            .private_key_pem
            .as_deref()
            .filter(|_| sender.can_sign())
            .ok_or_else(|| DeliveryError::Permanent("sender cannot sign".to_string()))?;

        ensure_remote_destination(&task.inbox_url, self.allow_private_addresses)
            .await
            .map_err(|e| DeliveryError::Permanent(e.to_string()))?;

        let body = task.payload.as_bytes();
        let signed = sign_request(
            "POST",
            &task.inbox_url,
            Some(body),
            private_key_pem,
            &sender.key_id(),
        )
        .map_err(|e| DeliveryError::Permanent(e.to_string()))?;

        let mut request = self
            .http_client
            .post(&task.inbox_url)
            .timeout(self.request_timeout)
            .header("Content-Type", "application/activity+json")
            .header("Date", signed.date)
            .header("Signature", signed.signature);

        if let Some(digest) = signed.digest {
            request = request.header("Digest", digest);
        }

        if task.synchronize_followers {
            match self.synchronization_header(&sender, &task.inbox_url).await {
                Ok(Some(value)) => request = request.header("Collection-Synchronization", value),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(inbox = %task.inbox_url, %error, "Skipping Collection-Synchronization header");
                }
            }
        }

        let response = request
            .body(task.payload.clone())
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(e.to_string()))?;

        match classify_status(response.status()) {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    async fn synchronization_header(
        &self,
        sender: &Actor,
        inbox_url: &str,
    ) -> Result<Option<String>, AppError> {
        let Some(domain) = authority_of(inbox_url) else {
            return Ok(None);
        };

        let digest = self
            .db
            .cached_followers_digest(&sender.id, &domain, Some(&domain), |uris| {
                super::collection_sync::followers_digest(uris)
            })
            .await?;

        Ok(Some(outbound_header(
            &sender.followers_url,
            &digest,
            &self.tags.followers_synchronization_url(&sender.username),
        )))
    }

    /// Attempt a claimed task and record the result.
    pub async fn process(&self, task: &DeliveryTask) -> Result<DeliveryOutcome, AppError> {
        let started = Instant::now();
        let result = self.deliver(task).await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(()) => {
                DELIVERY_ATTEMPTS.with_label_values(&["success"]).inc();
                DELIVERY_DURATION_SECONDS
                    .with_label_values(&["success"])
                    .observe(elapsed);
                self.db.delete_delivery_task(&task.id).await?;
                if self.db.record_inbox_success(&task.inbox_url).await? {
                    tracing::info!(inbox = %task.inbox_url, "Inbox is reachable again");
                    UNREACHABLE_INBOXES.dec();
                }
                tracing::debug!(
                    inbox = %task.inbox_url,
                    activity = %task.activity_id,
                    "Delivered activity"
                );
                Ok(DeliveryOutcome::Delivered)
            }
            Err(DeliveryError::Transient(reason)) => {
                DELIVERY_ATTEMPTS.with_label_values(&["transient"]).inc();
                DELIVERY_DURATION_SECONDS
                    .with_label_values(&["transient"])
                    .observe(elapsed);
                let attempts = task.attempts + 1;
                if attempts >= i64::from(self.config.max_attempts) {
                    tracing::warn!(
                        inbox = %task.inbox_url,
                        activity = %task.activity_id,
                        attempts,
                        %reason,
                        "Giving up on delivery"
                    );
                    self.db.delete_delivery_task(&task.id).await?;
                    self.count_failure(&task.inbox_url).await?;
                    return Ok(DeliveryOutcome::Exhausted);
                }

                let delay = backoff_delay(&self.config, attempts as u32);
                let next_attempt_at_ms = now_ms() + delay.as_millis() as i64;
                tracing::debug!(
                    inbox = %task.inbox_url,
                    attempts,
                    delay_secs = delay.as_secs(),
                    %reason,
                    "Delivery failed, retrying"
                );
                self.db
                    .reschedule_delivery_task(&task.id, attempts, next_attempt_at_ms, &reason)
                    .await?;
                Ok(DeliveryOutcome::Retrying { next_attempt_at_ms })
            }
            Err(DeliveryError::Permanent(reason)) => {
                DELIVERY_ATTEMPTS.with_label_values(&["permanent"]).inc();
                DELIVERY_DURATION_SECONDS
                    .with_label_values(&["permanent"])
                    .observe(elapsed);
                tracing::info!(
                    inbox = %task.inbox_url,
                    activity = %task.activity_id,
                    %reason,
                    "Delivery failed permanently"
                );
                self.db.delete_delivery_task(&task.id).await?;
                let now_unreachable = self.count_failure(&task.inbox_url).await?;
                Ok(DeliveryOutcome::Dropped { now_unreachable })
            }
        }
    }

    /// Clear the failure counts of the inboxes of an actor that just signed
    /// a request to us.
    pub async fn mark_reachable(&self, actor: &Actor) -> Result<(), AppError> {
        let inboxes = std::iter::once(actor.inbox_url.as_str())
            .chain(actor.shared_inbox_url.as_deref());
        for inbox_url in inboxes {
            if self.db.record_inbox_success(inbox_url).await? {
                tracing::info!(inbox = %inbox_url, actor = %actor.uri, "Inbox is reachable again");
                UNREACHABLE_INBOXES.dec();
            }
        }
        Ok(())
    }

    async fn count_failure(&self, inbox_url: &str) -> Result<bool, AppError> {
        let now_unreachable = self
            .db
            .record_inbox_failure(inbox_url, self.config.unreachable_threshold)
            .await?;
        if now_unreachable {
            tracing::warn!(inbox = %inbox_url, "Marking inbox unreachable");
            UNREACHABLE_INBOXES.inc();
        }
        Ok(now_unreachable)
    }

    /// Claim due tasks and attempt them concurrently. Returns how many were claimed.
    pub async fn run_once(&self) -> Result<usize, AppError> {
        let now = now_ms();
        let limit = (self.config.concurrency * 4) as u32;
        let tasks = self
            .db
            .claim_due_delivery_tasks(now, now + LEASE_MS, limit)
            .await?;
        let claimed = tasks.len();
        if claimed == 0 {
            return Ok(0);
        }

        use futures::stream::{self, StreamExt};

        stream::iter(tasks)
            .map(|task| async move {
                if let Err(error) = self.process(&task).await {
                    tracing::error!(inbox = %task.inbox_url, %error, "Delivery bookkeeping failed");
                }
            })
            .buffer_unordered(self.config.concurrency)
            .collect::<Vec<_>>()
            .await;

        Ok(claimed)
    }

    /// Poll the queue until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            match self.run_once().await {
                Ok(claimed) if claimed > 0 => continue,
                Ok(_) => {}
                Err(error) => tracing::error!(%error, "Delivery runner iteration failed"),
            }
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::data::EntityId;
    use crate::federation::signature::tests::generate_test_keypair;
    use axum::Router;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use chrono::Utc;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct Captured {
        requests: Arc<Mutex<Vec<HeaderMap>>>,
    }

    /// Local inbox answering every POST with `status`.
    async fn spawn_inbox(status: StatusCode) -> (String, Captured) {
        let captured = Captured::default();
        let app = Router::new()
            .route(
                "/inbox",
                post(
                    move |State(captured): State<Captured>, headers: HeaderMap| async move {
                        captured.requests.lock().unwrap().push(headers);
                        status
                    },
                ),
            )
            .with_state(captured.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/inbox", addr), captured)
    }

    struct Fixture {
        worker: Arc<DeliveryWorker>,
        db: Arc<Database>,
        sender: Actor,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::for_tests(dir.path().join("test.db"));
        let db = Arc::new(Database::connect(&config.database.path).await.unwrap());
        let tags = Arc::new(TagManager::new(&config.server));

        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let sender = Actor {
            id: EntityId::new().0,
            uri: tags.actor_uri("alice"),
            username: "alice".to_string(),
            domain: None,
            actor_type: "Person".to_string(),
            inbox_url: tags.inbox_url("alice"),
            shared_inbox_url: Some(tags.shared_inbox_url()),
            followers_url: tags.followers_url("alice"),
            featured_url: Some(tags.featured_url("alice")),
            public_key_pem: Some(public_key_pem),
            private_key_pem: Some(private_key_pem),
            locked: false,
            silenced: false,
            suspended_at: None,
            deletion_request_at: None,
            moved_to_uri: None,
            also_known_as: "[]".to_string(),
            last_refreshed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        db.insert_actor(&sender).await.unwrap();

        let worker = Arc::new(DeliveryWorker::new(
            db.clone(),
            tags,
            reqwest::Client::new(),
            config.delivery.clone(),
            &config.federation,
            Arc::new(Notify::new()),
        ));
        Fixture {
            worker,
            db,
            sender,
            _dir: dir,
        }
    }

    fn task(sender: &Actor, inbox_url: &str, synchronize_followers: bool) -> DeliveryTask {
        DeliveryTask {
            id: EntityId::new().0,
            activity_id: format!("https://local.test/{}", EntityId::new().0),
            activity_type: "Create".to_string(),
            sender_actor_id: sender.id.clone(),
            inbox_url: inbox_url.to_string(),
            payload: r#"{"type":"Create"}"#.to_string(),
            synchronize_followers,
            attempts: 0,
            next_attempt_at_ms: now_ms(),
            claimed_until_ms: None,
            last_attempt_at: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn classifies_response_statuses() {
        assert_eq!(classify_status(StatusCode::ACCEPTED), None);
        assert!(matches!(
            classify_status(StatusCode::GONE),
            Some(DeliveryError::Permanent(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND),
            Some(DeliveryError::Permanent(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED),
            Some(DeliveryError::Permanent(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            Some(DeliveryError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY),
            Some(DeliveryError::Transient(_))
        ));
    }

    #[test]
    fn backoff_grows_exponentially_and_is_capped() {
        let config = AppConfig::for_tests("/tmp/unused.db".into()).delivery;
        let first = backoff_delay(&config, 1);
        let third = backoff_delay(&config, 3);
        let huge = backoff_delay(&config, 40);

        assert!(first >= Duration::from_secs(1) && first <= Duration::from_millis(1100));
        assert!(third >= Duration::from_secs(4) && third <= Duration::from_millis(4400));
        assert!(huge >= Duration::from_secs(60) && huge <= Duration::from_secs(66));
    }

    #[tokio::test]
    async fn successful_delivery_is_signed_and_discarded() {
        let f = fixture().await;
        let (inbox, captured) = spawn_inbox(StatusCode::ACCEPTED).await;
        let task = task(&f.sender, &inbox, false);
        f.db.insert_delivery_task(&task).await.unwrap();

        assert_eq!(f.worker.run_once().await.unwrap(), 1);

        assert_eq!(f.db.count_delivery_tasks().await.unwrap(), 0);
        let requests = captured.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].contains_key("signature"));
        assert!(requests[0].contains_key("digest"));
        assert!(requests[0].contains_key("date"));
        assert!(!requests[0].contains_key("collection-synchronization"));
    }

    #[tokio::test]
    async fn server_error_is_retried_later() {
        let f = fixture().await;
        let (inbox, _) = spawn_inbox(StatusCode::SERVICE_UNAVAILABLE).await;
        let task = task(&f.sender, &inbox, false);
        f.db.insert_delivery_task(&task).await.unwrap();

        let outcome = f.worker.process(&task).await.unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Retrying { .. }));

        let stored = f.db.get_delivery_tasks(&task.activity_id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].attempts, 1);
        assert!(stored[0].next_attempt_at_ms > now_ms());
        assert_eq!(stored[0].last_error.as_deref(), Some("HTTP 503"));
    }

    #[tokio::test]
    async fn exhausted_task_is_dropped() {
        let f = fixture().await;
        let (inbox, _) = spawn_inbox(StatusCode::INTERNAL_SERVER_ERROR).await;
        let mut task = task(&f.sender, &inbox, false);
        task.attempts = 2;
        f.db.insert_delivery_task(&task).await.unwrap();

        assert_eq!(
            f.worker.process(&task).await.unwrap(),
            DeliveryOutcome::Exhausted
        );
        assert_eq!(f.db.count_delivery_tasks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn repeated_gone_marks_inbox_unreachable() {
        let f = fixture().await;
        let (inbox, _) = spawn_inbox(StatusCode::GONE).await;

        let first = task(&f.sender, &inbox, false);
        f.db.insert_delivery_task(&first).await.unwrap();
        assert_eq!(
            f.worker.process(&first).await.unwrap(),
            DeliveryOutcome::Dropped {
                now_unreachable: false
            }
        );

        let second = task(&f.sender, &inbox, false);
        f.db.insert_delivery_task(&second).await.unwrap();
        assert_eq!(
            f.worker.process(&second).await.unwrap(),
            DeliveryOutcome::Dropped {
                now_unreachable: true
            }
        );

        assert!(
            f.db.get_unreachable_inboxes(Utc::now() - chrono::Duration::hours(1))
                .await
                .unwrap()
                .contains(&inbox)
        );
        assert_eq!(f.db.count_delivery_tasks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let f = fixture().await;
        let (inbox, _) = spawn_inbox(StatusCode::OK).await;
        f.db.record_inbox_failure(&inbox, 5).await.unwrap();

        let task = task(&f.sender, &inbox, false);
        f.db.insert_delivery_task(&task).await.unwrap();
        f.worker.process(&task).await.unwrap();

        // a single new failure stays below the threshold of two again
        assert!(!f.db.record_inbox_failure(&inbox, 2).await.unwrap());
    }

    #[tokio::test]
    async fn signed_request_makes_actor_inboxes_reachable_again() {
        let f = fixture().await;
        let mut remote = f.sender.clone();
        remote.id = EntityId::new().0;
        remote.uri = "https://remote.example/users/bob".to_string();
        remote.domain = Some("remote.example".to_string());
        remote.inbox_url = "https://remote.example/users/bob/inbox".to_string();
        remote.shared_inbox_url = Some("https://remote.example/inbox".to_string());
        f.db.record_inbox_failure(&remote.inbox_url, 1).await.unwrap();
        f.db.record_inbox_failure("https://remote.example/inbox", 1).await.unwrap();

        f.worker.mark_reachable(&remote).await.unwrap();

        let window_start = Utc::now() - chrono::Duration::hours(1);
        assert!(f.db.get_unreachable_inboxes(window_start).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn followers_only_delivery_carries_synchronization_header() {
        let f = fixture().await;
        let (inbox, captured) = spawn_inbox(StatusCode::ACCEPTED).await;
        let task = task(&f.sender, &inbox, true);
        f.db.insert_delivery_task(&task).await.unwrap();

        f.worker.process(&task).await.unwrap();

        let requests = captured.requests.lock().unwrap();
        let header = requests[0]
            .get("collection-synchronization")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let parsed = crate::federation::collection_sync::parse_header(&header).unwrap();
        assert_eq!(parsed.collection_id, "https://local.test/users/alice/followers");
        assert_eq!(
            parsed.url,
            "https://local.test/users/alice/followers_synchronization"
        );
        assert_eq!(parsed.digest, "0".repeat(64));
    }
}
