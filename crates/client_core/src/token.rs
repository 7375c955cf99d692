use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use reqwest::Client;
use shared::{
    domain::ServerUrl,
    protocol::{ChallengeResponse, SubmitChallengeRequest},
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{identity::ChallengeDecryptor, TokenStore};

const GET_CHALLENGE_ENDPOINT: &str = "loki/v1/get_challenge";
const SUBMIT_CHALLENGE_ENDPOINT: &str = "loki/v1/submit_challenge";

/// Outcome of the most recent completed refresh, shared with callers that
/// queued behind it.
#[derive(Default)]
struct RefreshSlot {
    generation: u64,
    outcome: Option<String>,
}

/// Acquires, caches and refreshes the bearer token for one server.
pub struct TokenManager {
    server_url: ServerUrl,
    http: Client,
    identity: Arc<dyn ChallengeDecryptor>,
    store: Arc<dyn TokenStore>,
    cached: RwLock<Option<String>>,
    refresh: Mutex<RefreshSlot>,
    completed_refreshes: AtomicU64,
}

impl TokenManager {
    pub fn new(
        server_url: ServerUrl,
        http: Client,
        identity: Arc<dyn ChallengeDecryptor>,
        store: Arc<dyn TokenStore>,
    ) -> Self {
        Self {
            server_url,
            http,
            identity,
            store,
            cached: RwLock::new(None),
            refresh: Mutex::new(RefreshSlot::default()),
            completed_refreshes: AtomicU64::new(0),
        }
    }

    pub fn server_url(&self) -> &ServerUrl {
        &self.server_url
    }

    pub async fn cached_token(&self) -> Option<String> {
        self.cached.read().await.clone()
    }

    /// Returns a usable token, or `None` when none could be obtained.
    ///
    /// Without `force_refresh` the in-memory token wins, then the persisted
    /// one. With it, both are skipped and a challenge round-trip is made.
    pub async fn get_token(&self, force_refresh: bool) -> Option<String> {
        if !force_refresh {
            if let Some(cached) = self.cached_token().await {
                return Some(cached);
            }
            let observed = self.completed_refreshes.load(Ordering::Acquire);
            let stored = match self.store.load_token(&self.server_url).await {
                Ok(stored) => stored,
                Err(err) => {
                    warn!(server_url = %self.server_url, "failed to load persisted token: {err:#}");
                    None
                }
            };
            if let Some(stored) = stored {
                let mut cached = self.cached.write().await;
                // a refresh that completed during the load holds a newer token
                if self.completed_refreshes.load(Ordering::Acquire) != observed {
                    if let Some(fresher) = cached.as_ref() {
                        return Some(fresher.clone());
                    }
                }
                *cached = Some(stored.clone());
                return Some(stored);
            }
        }

        self.refresh_token().await
    }

    /// Runs at most one challenge/submit round-trip at a time. Callers that
    /// queued while a refresh was running receive that refresh's outcome
    /// instead of starting their own.
    async fn refresh_token(&self) -> Option<String> {
        let observed = self.completed_refreshes.load(Ordering::Acquire);
        let mut slot = self.refresh.lock().await;
        if slot.generation != observed {
            debug!(server_url = %self.server_url, "joined in-flight token refresh");
            return slot.outcome.clone();
        }

        let outcome = self.request_and_activate_token().await;
        if let Some(token) = &outcome {
            if let Err(err) = self.store.save_token(&self.server_url, token).await {
                warn!(server_url = %self.server_url, "failed to persist token: {err:#}");
            }
            info!(server_url = %self.server_url, "public chat token refreshed");
        }

        slot.generation += 1;
        slot.outcome = outcome.clone();
        self.completed_refreshes
            .store(slot.generation, Ordering::Release);
        *self.cached.write().await = outcome.clone();
        outcome
    }

    async fn request_and_activate_token(&self) -> Option<String> {
        let token = self.request_token().await?;
        if self.submit_token(&token).await {
            Some(token)
        } else {
            None
        }
    }

    async fn request_token(&self) -> Option<String> {
        let url = self.server_url.join(GET_CHALLENGE_ENDPOINT);
        let response = match self
            .http
            .get(&url)
            .query(&[("pubKey", self.identity.public_key_hex())])
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(server_url = %self.server_url, "token challenge request failed: {err}");
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(
                server_url = %self.server_url,
                status = response.status().as_u16(),
                "token challenge rejected"
            );
            return None;
        }

        let challenge: ChallengeResponse = match response.json().await {
            Ok(challenge) => challenge,
            Err(err) => {
                warn!(server_url = %self.server_url, "token challenge body invalid: {err}");
                return None;
            }
        };
        match self.identity.decrypt_challenge(&challenge) {
            Ok(token) => Some(token),
            Err(err) => {
                warn!(server_url = %self.server_url, "failed to decrypt token challenge: {err}");
                None
            }
        }
    }

    async fn submit_token(&self, token: &str) -> bool {
        let url = self.server_url.join(SUBMIT_CHALLENGE_ENDPOINT);
        let result = self
            .http
            .post(&url)
            .json(&SubmitChallengeRequest {
                pub_key: self.identity.public_key_hex(),
                token: token.to_string(),
            })
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(
                    server_url = %self.server_url,
                    status = response.status().as_u16(),
                    "token activation rejected"
                );
                false
            }
            Err(err) => {
                warn!(server_url = %self.server_url, "token activation failed: {err}");
                false
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/token_tests.rs"]
mod tests;
