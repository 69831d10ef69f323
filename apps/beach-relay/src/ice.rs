//! ICE server provisioning.
//!
//! Each client gets one `iceServers` envelope right after `hello`. Where that list comes from is
//! pluggable: a fixed STUN list, or short-lived TURN credentials minted per connection by Twilio's
//! Network Traversal Service.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::RelayError;
use crate::identity::Identity;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_TWILIO_BASE_URL: &str = "https://api.twilio.com";

/// `urls` may be a single string or a list, mirroring `RTCIceServer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IceUrls {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: IceUrls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: IceUrls::One(url.into()),
            username: None,
            credential: None,
        }
    }
}

#[async_trait]
pub trait IceServerProvider: Send + Sync {
    async fn fetch(&self, identity: &Identity) -> Result<Vec<IceServer>, RelayError>;
}

/// A fixed list handed to every client.
#[derive(Debug, Clone)]
pub struct StaticIceServers {
    servers: Vec<IceServer>,
}

impl StaticIceServers {
    pub fn new(servers: Vec<IceServer>) -> Self {
        Self { servers }
    }

    pub fn from_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(urls.into_iter().map(IceServer::stun).collect())
    }

    pub fn servers(&self) -> &[IceServer] {
        &self.servers
    }
}

impl Default for StaticIceServers {
    fn default() -> Self {
        Self::from_urls([DEFAULT_STUN_URL])
    }
}

#[async_trait]
impl IceServerProvider for StaticIceServers {
    async fn fetch(&self, _identity: &Identity) -> Result<Vec<IceServer>, RelayError> {
        Ok(self.servers.clone())
    }
}

#[derive(Clone)]
pub struct TwilioIceServers {
    client: Client,
    base_url: String,
    account_sid: String,
    auth_token: String,
    ttl: Duration,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    ice_servers: Vec<TokenIceServer>,
}

// Twilio still sends the legacy singular `url` next to `urls`.
#[derive(Debug, Deserialize)]
struct TokenIceServer {
    #[serde(default)]
    urls: Option<IceUrls>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    credential: Option<String>,
}

impl TwilioIceServers {
    pub fn new(
        base_url: impl Into<String>,
        account_sid: impl Into<String>,
        auth_token: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            ttl,
        }
    }

    fn tokens_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Tokens.json",
            self.base_url, self.account_sid
        )
    }
}

#[async_trait]
impl IceServerProvider for TwilioIceServers {
    async fn fetch(&self, identity: &Identity) -> Result<Vec<IceServer>, RelayError> {
        debug!(
            target: "beach_relay::ice",
            peer = %identity,
            ttl_secs = self.ttl.as_secs(),
            "requesting turn credentials"
        );
        let response = self
            .client
            .post(self.tokens_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("Ttl", self.ttl.as_secs().to_string())])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RelayError::ProviderFailure(format!(
                "status {}",
                response.status()
            )));
        }

        let body: TokenResponse = response.json().await?;
        let servers: Vec<IceServer> = body
            .ice_servers
            .into_iter()
            .filter_map(|entry| {
                let urls = entry.urls.or_else(|| entry.url.map(IceUrls::One))?;
                Some(IceServer {
                    urls,
                    username: entry.username,
                    credential: entry.credential,
                })
            })
            .collect();

        if servers.is_empty() {
            return Err(RelayError::ProviderFailure(
                "no usable ice servers in token response".to_string(),
            ));
        }
        Ok(servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::{HeaderMap, StatusCode},
        response::IntoResponse,
        routing::post,
        Json, Router,
    };
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn serve_stub(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub listener");
        let addr = listener.local_addr().expect("stub addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        format!("http://{addr}")
    }

    #[test_timeout::tokio_timeout_test]
    async fn static_list_defaults_to_public_stun() {
        let provider = StaticIceServers::default();
        let servers = provider.fetch(&Identity::from("a")).await.unwrap();
        assert_eq!(servers, vec![IceServer::stun(DEFAULT_STUN_URL)]);
    }

    #[test_timeout::timeout]
    fn ice_urls_accept_string_or_list() {
        let one: IceServer = serde_json::from_value(json!({"urls": "stun:a"})).unwrap();
        assert_eq!(one.urls, IceUrls::One("stun:a".into()));
        let many: IceServer = serde_json::from_value(
            json!({"urls": ["turn:a", "turns:a"], "username": "u", "credential": "c"}),
        )
        .unwrap();
        assert_eq!(many.urls, IceUrls::Many(vec!["turn:a".into(), "turns:a".into()]));
        assert_eq!(many.username.as_deref(), Some("u"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn twilio_tokens_are_mapped_to_ice_servers() {
        let router = Router::new().route(
            "/2010-04-01/Accounts/:sid/Tokens.json",
            post(|headers: HeaderMap| async move {
                let authorized = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.starts_with("Basic "))
                    .unwrap_or(false);
                if !authorized {
                    return StatusCode::UNAUTHORIZED.into_response();
                }
                Json(json!({
                    "ttl": "600",
                    "ice_servers": [
                        {"url": "stun:global.stun.twilio.com:3478", "urls": "stun:global.stun.twilio.com:3478"},
                        {"url": "turn:global.turn.twilio.com:3478?transport=udp", "username": "u1", "credential": "c1"},
                        {"username": "dangling"}
                    ]
                }))
                .into_response()
            }),
        );
        let base = serve_stub(router).await;

        let provider = TwilioIceServers::new(base, "AC123", "secret", Duration::from_secs(600));
        let servers = provider.fetch(&Identity::from("a")).await.unwrap();

        assert_eq!(servers.len(), 2);
        assert_eq!(
            servers[0].urls,
            IceUrls::One("stun:global.stun.twilio.com:3478".into())
        );
        assert_eq!(servers[1].username.as_deref(), Some("u1"));
        assert_eq!(servers[1].credential.as_deref(), Some("c1"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn twilio_error_status_is_provider_failure() {
        let router = Router::new().route(
            "/2010-04-01/Accounts/:sid/Tokens.json",
            post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let base = serve_stub(router).await;

        let provider = TwilioIceServers::new(base, "AC123", "secret", Duration::from_secs(60));
        let err = provider.fetch(&Identity::from("a")).await.unwrap_err();
        assert!(matches!(err, RelayError::ProviderFailure(_)));
    }
}
