use super::*;
use crate::test_support::{token_manager, FailingTokenStore, MockChatServer};
use crate::{identity::LocalIdentity, MemoryTokenStore};
use async_trait::async_trait;
use std::time::Duration;

/// Reads the persisted token immediately but hands it back late.
struct SlowTokenStore {
    inner: MemoryTokenStore,
    delay: Duration,
}

#[async_trait]
impl TokenStore for SlowTokenStore {
    async fn load_token(&self, server_url: &ServerUrl) -> anyhow::Result<Option<String>> {
        let stored = self.inner.load_token(server_url).await?;
        tokio::time::sleep(self.delay).await;
        Ok(stored)
    }

    async fn save_token(&self, server_url: &ServerUrl, token: &str) -> anyhow::Result<()> {
        self.inner.save_token(server_url, token).await
    }
}

async fn setup() -> (MockChatServer, Arc<LocalIdentity>, Arc<MemoryTokenStore>) {
    let identity = Arc::new(LocalIdentity::generate());
    let server = MockChatServer::spawn(&identity).await.unwrap();
    (server, identity, Arc::new(MemoryTokenStore::default()))
}

#[tokio::test]
async fn concurrent_callers_share_one_refresh() {
    let (server, identity, store) = setup().await;
    server.set_challenge_delay(Duration::from_millis(150));
    let manager = token_manager(&server, identity, store.clone());

    let calls = (0..8).map(|_| {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.get_token(false).await })
    });
    let results = futures::future::join_all(calls).await;

    let tokens: Vec<_> = results.into_iter().map(|result| result.unwrap()).collect();
    assert!(tokens.iter().all(|token| token.as_deref() == Some("token-1")));
    assert_eq!(server.challenge_hits(), 1);
    assert_eq!(server.submit_hits(), 1);
    assert_eq!(
        store.load_token(&server.server_url()).await.unwrap().as_deref(),
        Some("token-1")
    );
}

#[tokio::test]
async fn cached_token_needs_no_round_trip() {
    let (server, identity, store) = setup().await;
    let manager = token_manager(&server, identity, store);

    let first = manager.get_token(false).await;
    let second = manager.get_token(false).await;

    assert_eq!(first, second);
    assert_eq!(manager.cached_token().await, first);
    assert_eq!(server.challenge_hits(), 1);
}

#[tokio::test]
async fn persisted_token_is_reused() {
    let (server, identity, store) = setup().await;
    store
        .save_token(&server.server_url(), "persisted")
        .await
        .unwrap();
    let manager = token_manager(&server, identity, store);

    assert_eq!(manager.get_token(false).await.as_deref(), Some("persisted"));
    assert_eq!(server.challenge_hits(), 0);
}

#[tokio::test]
async fn forced_refresh_skips_cache_and_store() {
    let (server, identity, store) = setup().await;
    store
        .save_token(&server.server_url(), "persisted")
        .await
        .unwrap();
    let manager = token_manager(&server, identity, store.clone());

    manager.get_token(false).await;
    let fresh = manager.get_token(true).await;

    assert_eq!(fresh.as_deref(), Some("token-1"));
    assert_eq!(manager.cached_token().await.as_deref(), Some("token-1"));
    assert_eq!(
        store.load_token(&server.server_url()).await.unwrap().as_deref(),
        Some("token-1")
    );
    assert_eq!(server.challenge_hits(), 1);
}

#[tokio::test]
async fn slow_store_load_does_not_clobber_forced_refresh() {
    let identity = Arc::new(LocalIdentity::generate());
    let server = MockChatServer::spawn(&identity).await.unwrap();
    let store = SlowTokenStore {
        inner: MemoryTokenStore::default(),
        delay: Duration::from_millis(300),
    };
    store
        .save_token(&server.server_url(), "persisted")
        .await
        .unwrap();
    let manager = token_manager(&server, identity, Arc::new(store));

    let stale_reader = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.get_token(false).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let fresh = manager.get_token(true).await;

    assert_eq!(fresh.as_deref(), Some("token-1"));
    assert_eq!(stale_reader.await.unwrap().as_deref(), Some("token-1"));
    assert_eq!(manager.cached_token().await.as_deref(), Some("token-1"));
}

#[tokio::test]
async fn failed_refresh_releases_the_guard() {
    let (server, identity, store) = setup().await;
    server.set_fail_challenge(true);
    let manager = token_manager(&server, identity, store.clone());

    assert_eq!(manager.get_token(false).await, None);
    assert_eq!(server.submit_hits(), 0);
    assert_eq!(store.load_token(&server.server_url()).await.unwrap(), None);

    server.set_fail_challenge(false);
    assert_eq!(manager.get_token(false).await.as_deref(), Some("token-1"));
    assert_eq!(server.challenge_hits(), 2);
}

#[tokio::test]
async fn broken_store_still_yields_a_token() {
    let identity = Arc::new(LocalIdentity::generate());
    let server = MockChatServer::spawn(&identity).await.unwrap();
    let manager = token_manager(&server, identity, Arc::new(FailingTokenStore));

    assert_eq!(manager.get_token(false).await.as_deref(), Some("token-1"));
}

#[tokio::test]
async fn challenge_for_another_key_yields_no_token() {
    let registered = LocalIdentity::generate();
    let server = MockChatServer::spawn(&registered).await.unwrap();
    let manager = token_manager(
        &server,
        Arc::new(LocalIdentity::generate()),
        Arc::new(MemoryTokenStore::default()),
    );

    assert_eq!(manager.get_token(false).await, None);
    assert_eq!(server.submit_hits(), 0);
}
