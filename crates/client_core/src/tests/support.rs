//! In-process chat server and in-memory collaborators shared by the unit tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header::AUTHORIZATION, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rand::rngs::OsRng;
use reqwest::Client;
use serde_json::{json, Value};
use shared::domain::{ChannelId, ConversationId, MessageId, ServerUrl};
use tokio::net::TcpListener;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{
    channel::PublicChannel,
    config::ClientConfig,
    identity::{seal_challenge, LocalIdentity},
    registry::ClientContext,
    token::TokenManager,
    transport::AuthenticatedClient,
    ClientEvent, ConversationDirectory, EventSink, MemoryTokenStore, PublicConversation,
    TokenStore,
};

#[derive(Clone)]
pub(crate) enum ScriptedBody {
    Json(Value),
    Text(String),
}

#[derive(Clone)]
pub(crate) struct Scripted {
    pub status: u16,
    pub body: ScriptedBody,
}

impl Scripted {
    pub fn ok(data: Value) -> Self {
        Self::json(200, json!({ "meta": { "code": 200 }, "data": data }))
    }

    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            body: ScriptedBody::Json(body),
        }
    }

    pub fn error(status: u16) -> Self {
        Self::json(
            status,
            json!({ "meta": { "code": status, "error_message": "scripted failure" } }),
        )
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            body: ScriptedBody::Text(body.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub authorization: Option<String>,
    pub body: Value,
}

struct MockInner {
    server_secret: StaticSecret,
    client_public: PublicKey,
    issued_tokens: AtomicU64,
    challenge_hits: AtomicUsize,
    submit_hits: AtomicUsize,
    fail_challenge: AtomicBool,
    enforce_auth: AtomicBool,
    challenge_delay: StdMutex<Duration>,
    response_delay: StdMutex<Duration>,
    valid_tokens: StdMutex<HashSet<String>>,
    scripted: StdMutex<HashMap<String, VecDeque<Scripted>>>,
    requests: StdMutex<Vec<RecordedRequest>>,
}

/// Handle onto a running mock server. Challenge and submit are served for
/// real; every other route answers from the script, keyed by `"METHOD /path"`.
#[derive(Clone)]
pub(crate) struct MockChatServer {
    pub url: String,
    inner: Arc<MockInner>,
}

impl MockChatServer {
    pub async fn spawn(identity: &LocalIdentity) -> Result<Self> {
        std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let inner = Arc::new(MockInner {
            server_secret: StaticSecret::random_from_rng(OsRng),
            client_public: identity.public_key(),
            issued_tokens: AtomicU64::new(0),
            challenge_hits: AtomicUsize::new(0),
            submit_hits: AtomicUsize::new(0),
            fail_challenge: AtomicBool::new(false),
            enforce_auth: AtomicBool::new(false),
            challenge_delay: StdMutex::new(Duration::ZERO),
            response_delay: StdMutex::new(Duration::ZERO),
            valid_tokens: StdMutex::new(HashSet::new()),
            scripted: StdMutex::new(HashMap::new()),
            requests: StdMutex::new(Vec::new()),
        });
        let server = Self {
            url: format!("http://{addr}"),
            inner,
        };

        let app = Router::new()
            .route("/loki/v1/get_challenge", get(get_challenge))
            .route("/loki/v1/submit_challenge", post(submit_challenge))
            .fallback(scripted_route)
            .with_state(server.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(server)
    }

    pub fn server_url(&self) -> ServerUrl {
        ServerUrl::new(&self.url)
    }

    /// Queues a response. The last queued response for a route keeps being
    /// served once the others are used up.
    pub fn script(&self, method: &str, path: &str, response: Scripted) {
        self.inner
            .scripted
            .lock()
            .unwrap()
            .entry(format!("{method} {path}"))
            .or_default()
            .push_back(response);
    }

    pub fn challenge_hits(&self) -> usize {
        self.inner.challenge_hits.load(Ordering::SeqCst)
    }

    pub fn submit_hits(&self) -> usize {
        self.inner.submit_hits.load(Ordering::SeqCst)
    }

    pub fn set_fail_challenge(&self, fail: bool) {
        self.inner.fail_challenge.store(fail, Ordering::SeqCst);
    }

    pub fn set_enforce_auth(&self, enforce: bool) {
        self.inner.enforce_auth.store(enforce, Ordering::SeqCst);
    }

    pub fn set_challenge_delay(&self, delay: Duration) {
        *self.inner.challenge_delay.lock().unwrap() = delay;
    }

    pub fn set_response_delay(&self, delay: Duration) {
        *self.inner.response_delay.lock().unwrap() = delay;
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, method: &str, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.method == method && request.path == path)
            .collect()
    }
}

async fn get_challenge(
    State(server): State<MockChatServer>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    server.inner.challenge_hits.fetch_add(1, Ordering::SeqCst);
    let delay = *server.inner.challenge_delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    if server.inner.fail_challenge.load(Ordering::SeqCst) || !query.contains_key("pubKey") {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "meta": { "code": 500 } })),
        )
            .into_response();
    }

    let serial = server.inner.issued_tokens.fetch_add(1, Ordering::SeqCst) + 1;
    let token = format!("token-{serial}");
    match seal_challenge(&server.inner.server_secret, &server.inner.client_public, &token) {
        Ok(challenge) => Json(challenge).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn submit_challenge(
    State(server): State<MockChatServer>,
    Json(body): Json<Value>,
) -> Response {
    server.inner.submit_hits.fetch_add(1, Ordering::SeqCst);
    let Some(token) = body.get("token").and_then(Value::as_str) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    server
        .inner
        .valid_tokens
        .lock()
        .unwrap()
        .insert(token.to_string());
    Json(json!({ "meta": { "code": 200 }, "data": {} })).into_response()
}

async fn scripted_route(
    State(server): State<MockChatServer>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let authorization = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let query = uri
        .query()
        .map(|raw| {
            url::form_urlencoded::parse(raw.as_bytes())
                .into_owned()
                .collect::<HashMap<_, _>>()
        })
        .unwrap_or_default();
    server.inner.requests.lock().unwrap().push(RecordedRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        query,
        authorization: authorization.clone(),
        body: serde_json::from_slice(&body).unwrap_or(Value::Null),
    });

    let delay = *server.inner.response_delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    if server.inner.enforce_auth.load(Ordering::SeqCst) {
        let token = authorization
            .as_deref()
            .and_then(|value| value.strip_prefix("Bearer "))
            .unwrap_or_default();
        if !server.inner.valid_tokens.lock().unwrap().contains(token) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "meta": { "code": 401, "error_message": "invalid token" } })),
            )
                .into_response();
        }
    }

    let key = format!("{method} {}", uri.path());
    let scripted = {
        let mut routes = server.inner.scripted.lock().unwrap();
        routes.get_mut(&key).and_then(|queue| {
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        })
    };
    let Some(scripted) = scripted else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "meta": { "code": 404, "error_message": "not scripted" } })),
        )
            .into_response();
    };
    let status = StatusCode::from_u16(scripted.status).unwrap();
    match scripted.body {
        ScriptedBody::Json(body) => (status, Json(body)).into_response(),
        ScriptedBody::Text(text) => (status, text).into_response(),
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct ConversationState {
    pub last_retrieved: Option<MessageId>,
    pub moderator: Option<bool>,
    pub display_name: Option<String>,
    pub avatar: Option<String>,
    pub cursor_writes: usize,
}

#[derive(Default)]
pub(crate) struct MemoryConversation {
    state: StdMutex<ConversationState>,
}

impl MemoryConversation {
    pub fn with_cursor(last_retrieved: Option<MessageId>) -> Arc<Self> {
        Arc::new(Self {
            state: StdMutex::new(ConversationState {
                last_retrieved,
                ..ConversationState::default()
            }),
        })
    }

    pub fn snapshot(&self) -> ConversationState {
        self.state.lock().unwrap().clone()
    }
}

#[async_trait]
impl PublicConversation for MemoryConversation {
    async fn last_retrieved_message(&self) -> Result<Option<MessageId>> {
        Ok(self.state.lock().unwrap().last_retrieved)
    }

    async fn set_last_retrieved_message(&self, id: Option<MessageId>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.last_retrieved = id;
        state.cursor_writes += 1;
        Ok(())
    }

    async fn set_moderator_status(&self, moderator: bool) -> Result<()> {
        self.state.lock().unwrap().moderator = Some(moderator);
        Ok(())
    }

    async fn set_display_name(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().display_name = Some(name.to_string());
        Ok(())
    }

    async fn set_avatar(&self, avatar: &str) -> Result<()> {
        self.state.lock().unwrap().avatar = Some(avatar.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MemoryDirectory {
    pub conversations: HashMap<ConversationId, Arc<MemoryConversation>>,
    pub profile_name: Option<String>,
}

#[async_trait]
impl ConversationDirectory for MemoryDirectory {
    async fn conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Arc<dyn PublicConversation>>> {
        Ok(self
            .conversations
            .get(conversation_id)
            .map(|conversation| Arc::clone(conversation) as Arc<dyn PublicConversation>))
    }

    async fn local_profile_name(&self) -> Result<Option<String>> {
        Ok(self.profile_name.clone())
    }
}

pub(crate) struct FailingTokenStore;

#[async_trait]
impl TokenStore for FailingTokenStore {
    async fn load_token(&self, _server_url: &ServerUrl) -> Result<Option<String>> {
        Err(anyhow!("token store offline"))
    }

    async fn save_token(&self, _server_url: &ServerUrl, _token: &str) -> Result<()> {
        Err(anyhow!("token store offline"))
    }
}

#[derive(Default)]
pub(crate) struct CollectingSink {
    events: StdMutex<Vec<ClientEvent>>,
}

impl CollectingSink {
    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn message_ids(&self) -> Vec<i64> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::PublicMessage(message) => Some(message.server_id.0),
                _ => None,
            })
            .collect()
    }

    pub fn deleted_ids(&self) -> Vec<i64> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::DeleteLocalPublicMessage {
                    message_server_id, ..
                } => Some(message_server_id.0),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: ClientEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub(crate) fn fast_config() -> ClientConfig {
    ClientConfig::default().with_poll_intervals(
        Duration::from_millis(20),
        Duration::from_millis(20),
        Duration::from_millis(20),
    )
}

pub(crate) fn token_manager(
    server: &MockChatServer,
    identity: Arc<LocalIdentity>,
    store: Arc<dyn TokenStore>,
) -> Arc<TokenManager> {
    Arc::new(TokenManager::new(
        server.server_url(),
        Client::new(),
        identity,
        store,
    ))
}

pub(crate) fn authenticated_client(
    server: &MockChatServer,
    identity: Arc<LocalIdentity>,
    store: Arc<dyn TokenStore>,
) -> AuthenticatedClient {
    AuthenticatedClient::new(
        server.server_url(),
        Client::new(),
        token_manager(server, identity, store),
    )
}

pub(crate) fn client_context(
    identity: Arc<LocalIdentity>,
    directory: Arc<dyn ConversationDirectory>,
    sink: Arc<dyn EventSink>,
    config: ClientConfig,
) -> Arc<ClientContext> {
    Arc::new(ClientContext {
        http: Client::new(),
        identity,
        token_store: Arc::new(MemoryTokenStore::default()),
        conversations: directory,
        events: sink,
        config,
    })
}

/// Channel wired to the mock server but not started, so each test drives
/// cycles by hand.
pub(crate) struct ChannelHarness {
    pub server: MockChatServer,
    pub channel: Arc<PublicChannel>,
    pub conversation: Arc<MemoryConversation>,
    pub sink: Arc<CollectingSink>,
}

impl ChannelHarness {
    pub async fn new(stored_cursor: Option<MessageId>, config: ClientConfig) -> Self {
        Self::with_profile(stored_cursor, config, None).await
    }

    pub async fn with_profile(
        stored_cursor: Option<MessageId>,
        config: ClientConfig,
        profile_name: Option<&str>,
    ) -> Self {
        let identity = Arc::new(LocalIdentity::generate());
        let server = MockChatServer::spawn(&identity).await.unwrap();
        let conversation = MemoryConversation::with_cursor(stored_cursor);
        let conversation_id = ConversationId::new("publicChat:7@chat");
        let mut directory = MemoryDirectory {
            profile_name: profile_name.map(str::to_string),
            ..MemoryDirectory::default()
        };
        directory
            .conversations
            .insert(conversation_id.clone(), Arc::clone(&conversation));
        let sink = Arc::new(CollectingSink::default());
        let context = client_context(
            Arc::clone(&identity),
            Arc::new(directory),
            sink.clone(),
            config,
        );
        let transport = authenticated_client(
            &server,
            identity,
            Arc::new(MemoryTokenStore::default()),
        );
        let channel = PublicChannel::new(
            context,
            transport,
            ChannelId(7),
            conversation_id,
            Some(conversation.clone() as Arc<dyn PublicConversation>),
        );
        Self {
            server,
            channel,
            conversation,
            sink,
        }
    }
}

pub(crate) fn chat_message(id: i64, text: Option<&str>, created_at: &str) -> Value {
    json!({
        "id": id,
        "text": text,
        "created_at": created_at,
        "is_deleted": false,
        "user": { "id": 3, "username": "05abc", "name": "alice" },
        "annotations": [{
            "type": "network.loki.messenger.publicChat",
            "value": { "timestamp": 1_600_000_000_000i64, "from": "alice", "source": "05abc" }
        }]
    })
}
