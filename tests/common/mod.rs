//! Common test utilities for E2E tests

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fedcore::data::Actor;
use fedcore::error::AppError;
use fedcore::federation::{RemoteActorDocument, RemoteActorFetcher, sign_request};
use fedcore::{AppState, config};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// A remote account the test server can resolve, with its signing key.
#[derive(Clone)]
pub struct RemoteAccount {
    pub uri: String,
    pub private_key_pem: String,
    pub public_key_pem: String,
}

impl RemoteAccount {
    pub fn generate(uri: &str) -> Self {
        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
        use rsa::{RsaPrivateKey, RsaPublicKey};

        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public_key = RsaPublicKey::from(&private_key);

        Self {
            uri: uri.to_string(),
            private_key_pem: private_key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string(),
            public_key_pem: public_key.to_public_key_pem(LineEnding::LF).unwrap(),
        }
    }

    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.uri)
    }

    pub fn followers_url(&self) -> String {
        format!("{}/followers", self.uri)
    }

    fn document(&self) -> RemoteActorDocument {
        RemoteActorDocument {
            uri: self.uri.clone(),
            username: self.uri.rsplit('/').next().unwrap_or_default().to_string(),
            actor_type: "Person".to_string(),
            inbox_url: format!("{}/inbox", self.uri),
            shared_inbox_url: None,
            followers_url: self.followers_url(),
            featured_url: None,
            public_key_id: Some(self.key_id()),
            public_key_pem: Some(self.public_key_pem.clone()),
            locked: false,
            also_known_as: Vec::new(),
            moved_to: None,
        }
    }

    /// Build a request carrying this account's HTTP signature.
    pub fn signed(
        &self,
        client: &reqwest::Client,
        method: reqwest::Method,
        url: &str,
        body: Option<&[u8]>,
    ) -> reqwest::RequestBuilder {
        let signed = sign_request(
            method.as_str(),
            url,
            body,
            &self.private_key_pem,
            &self.key_id(),
        )
        .unwrap();

        let mut request = client
            .request(method, url)
            .header("Date", signed.date)
            .header("Signature", signed.signature);
        if let Some(digest) = signed.digest {
            request = request.header("Digest", digest);
        }
        if let Some(body) = body {
            request = request
                .header("Content-Type", "application/activity+json")
                .body(body.to_vec());
        }
        request
    }
}

/// Serves actor documents of the registered remote accounts.
struct StaticFetcher {
    documents: HashMap<String, RemoteActorDocument>,
}

#[async_trait]
impl RemoteActorFetcher for StaticFetcher {
    async fn fetch_actor(&self, uri: &str) -> Result<RemoteActorDocument, AppError> {
        self.documents
            .get(uri)
            .cloned()
            .ok_or_else(|| AppError::Federation(format!("unknown actor {}", uri)))
    }

    async fn fetch_collection_items(
        &self,
        _url: &str,
        _signer: &Actor,
    ) -> Result<Vec<String>, AppError> {
        Ok(Vec::new())
    }
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_remote_accounts(&[]).await
    }

    /// Create a test server that can resolve the given remote accounts.
    pub async fn with_remote_accounts(remote: &[RemoteAccount]) -> Self {
        fedcore::metrics::init_metrics();

        let temp_dir = TempDir::new().unwrap();
        let config = config::AppConfig::for_tests(temp_dir.path().join("test.db"));

        let fetcher = StaticFetcher {
            documents: remote
                .iter()
                .map(|account| (account.uri.clone(), account.document()))
                .collect(),
        };
        let state = AppState::with_fetcher(config, Arc::new(fetcher))
            .await
            .unwrap();

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = fedcore::build_router(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Create a local account
    pub async fn create_account(&self, username: &str) -> Actor {
        self.state.accounts.create(username, false).await.unwrap()
    }

    /// Resolve one of the registered remote accounts into the database.
    pub async fn remote_actor(&self, account: &RemoteAccount) -> Actor {
        self.state.resolver.resolve(&account.uri).await.unwrap()
    }

    pub async fn queued_inbound(&self) -> usize {
        self.state.jobs.pending("process_inbound").await.unwrap().len()
    }
}
