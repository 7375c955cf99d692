use std::sync::Arc;

use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{
    domain::ServerUrl,
    error::ApiError,
    protocol::{meta_code, Envelope, ResponseMeta},
};
use tracing::{error, info};
use url::Url;

use crate::{error::RequestError, token::TokenManager};

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: Method,
    pub query: Vec<(String, String)>,
    pub json_body: Option<Value>,
    pub force_fresh_token: bool,
}

impl RequestOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn with_method(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.json_body = Some(body);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn envelope<T: DeserializeOwned>(&self) -> serde_json::Result<Envelope<T>> {
        Envelope::from_value(self.body.clone())
    }
}

/// Issues bearer-authenticated JSON requests against one server.
#[derive(Clone)]
pub struct AuthenticatedClient {
    server_url: ServerUrl,
    http: Client,
    tokens: Arc<TokenManager>,
}

impl AuthenticatedClient {
    pub fn new(server_url: ServerUrl, http: Client, tokens: Arc<TokenManager>) -> Self {
        Self {
            server_url,
            http,
            tokens,
        }
    }

    pub fn server_url(&self) -> &ServerUrl {
        &self.server_url
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Sends the request; an expired-token rejection (`meta.code == 401`) is
    /// retried exactly once with a freshly issued token.
    pub async fn request(
        &self,
        endpoint: &str,
        mut options: RequestOptions,
    ) -> Result<ApiResponse, RequestError> {
        loop {
            let result = self.request_once(endpoint, &options).await;
            match result {
                Err(RequestError::Status { ref body, .. })
                    if !options.force_fresh_token && meta_code(body) == Some(401) =>
                {
                    info!(
                        server_url = %self.server_url,
                        endpoint,
                        "token rejected, retrying with a fresh token"
                    );
                    options.force_fresh_token = true;
                }
                other => return other,
            }
        }
    }

    /// [`Self::request`] followed by decoding the `{meta, data}` envelope.
    pub async fn request_data<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<Envelope<T>, RequestError> {
        let response = self.request(endpoint, options).await?;
        response.envelope().map_err(|source| RequestError::Decode {
            url: self.server_url.join(endpoint),
            source,
        })
    }

    async fn request_once(
        &self,
        endpoint: &str,
        options: &RequestOptions,
    ) -> Result<ApiResponse, RequestError> {
        let url = self.build_url(endpoint, &options.query)?;

        let Some(token) = self.tokens.get_token(options.force_fresh_token).await else {
            error!(server_url = %self.server_url, endpoint, "no token available");
            return Err(RequestError::NoToken {
                server_url: self.server_url.to_string(),
            });
        };

        let mut request = self
            .http
            .request(options.method.clone(), url.clone())
            .bearer_auth(token);
        if let Some(body) = &options.json_body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|source| RequestError::Transport {
                url: url.to_string(),
                source,
            })?;
        let status = response.status().as_u16();
        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(err) => {
                info!(%url, status, "response body is not JSON: {err}");
                return Err(RequestError::InvalidBody {
                    url: url.to_string(),
                    status,
                });
            }
        };

        if status != 200 {
            let meta = body
                .get("meta")
                .cloned()
                .and_then(|meta| serde_json::from_value::<ResponseMeta>(meta).ok())
                .unwrap_or_default();
            return Err(RequestError::Status {
                url: url.to_string(),
                status,
                error: ApiError::from_meta(status, &meta),
                body,
            });
        }

        Ok(ApiResponse { status, body })
    }

    fn build_url(&self, endpoint: &str, query: &[(String, String)]) -> Result<Url, RequestError> {
        let raw = self.server_url.join(endpoint);
        let mut url = Url::parse(&raw).map_err(|source| RequestError::InvalidUrl {
            url: raw.clone(),
            source,
        })?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
