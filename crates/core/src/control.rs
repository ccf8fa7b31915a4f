//! Control plane client
//!
//! [`ControlPlane`] is the seam between the managers and the Mud.band HTTP
//! API; [`HttpControlPlane`] is the reqwest implementation. Enroll and
//! unenroll return the raw body because the native core port applies it.

use crate::config::CoreConfig;
use async_trait::async_trait;
use mudband_common::{BandCreated, Error, Result};
use reqwest::{header, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// `fetch_type` the config endpoint expects from clients.
pub const CONFIG_FETCH_TYPE: &str = "when_it_gots_a_event";

/// Body of `POST /band/enroll`
#[derive(Debug, Clone, Serialize)]
pub struct EnrollRequest {
    pub token: String,
    pub name: String,
    pub wireguard_pubkey: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Body of `POST /band/conf`
#[derive(Debug, Clone, Serialize)]
pub struct ConfigRequest {
    pub fetch_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stun_mapped_addr: Option<String>,
    pub stun_nattype: i32,
    pub interface: ConfigRequestInterface,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigRequestInterface {
    pub listen_port: u16,
    pub addresses: Vec<String>,
}

/// Result of a conditional config fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigFetch {
    /// HTTP 304 against the presented validation token.
    NotModified,
    Fetched {
        validation_token: Option<String>,
        body: String,
    },
}

/// Mud.band control plane operations
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn create_anonymous_band(&self, name: &str, description: &str) -> Result<BandCreated>;

    /// Issue a single-use enrollment token using the band admin credential.
    async fn create_enrollment_token(&self, admin_token: &str) -> Result<String>;

    async fn enroll(&self, request: &EnrollRequest) -> Result<String>;

    async fn unenroll(&self, credential: &str) -> Result<String>;

    async fn fetch_config(
        &self,
        credential: &str,
        validation_token: Option<&str>,
        request: &ConfigRequest,
    ) -> Result<ConfigFetch>;
}

/// Strip the weak-validator prefix so tokens compare by value.
pub fn normalize_etag(raw: &str) -> String {
    let raw = raw.trim();
    raw.strip_prefix("W/").unwrap_or(raw).to_string()
}

#[derive(Deserialize)]
struct CreateBandReply {
    status: i64,
    #[serde(default)]
    band_uuid: String,
    #[serde(default)]
    jwt: String,
    #[serde(default, alias = "message")]
    msg: Option<String>,
}

#[derive(Deserialize)]
struct TokenReply {
    status: i64,
    #[serde(default)]
    token: String,
    #[serde(default, alias = "message")]
    msg: Option<String>,
}

/// reqwest-backed control plane
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
}

impl HttpControlPlane {
    pub fn new(config: &CoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.control_plane.user_agent.clone())
            .build()
            .map_err(transport)?;
        Ok(Self {
            client,
            base_url: config.control_plane.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn create_anonymous_band(&self, name: &str, description: &str) -> Result<BandCreated> {
        debug!("Creating anonymous band {}", name);
        let response = self
            .client
            .post(self.url("/band/anonymous/create"))
            .json(&serde_json::json!({ "name": name, "description": description }))
            .send()
            .await
            .map_err(transport)?;
        let body = success_body(response).await?;

        let reply: CreateBandReply = parse_reply(&body)?;
        if reply.status != 200 {
            return Err(protocol(reply.status, reply.msg));
        }
        if reply.band_uuid.is_empty() || reply.jwt.is_empty() {
            return Err(Error::Parse("band creation reply lacks band_uuid or jwt".into()));
        }
        Ok(BandCreated {
            band_uuid: reply.band_uuid,
            admin_token: reply.jwt,
        })
    }

    async fn create_enrollment_token(&self, admin_token: &str) -> Result<String> {
        let response = self
            .client
            .get(self.url("/band/anonymous/enrollment/token/create"))
            .header(header::AUTHORIZATION, admin_token)
            .send()
            .await
            .map_err(transport)?;
        let body = success_body(response).await?;

        let reply: TokenReply = parse_reply(&body)?;
        if reply.status != 200 {
            return Err(protocol(reply.status, reply.msg));
        }
        if reply.token.is_empty() {
            return Err(protocol(reply.status, Some("empty enrollment token".into())));
        }
        Ok(reply.token)
    }

    async fn enroll(&self, request: &EnrollRequest) -> Result<String> {
        debug!("Submitting enrollment for device {}", request.name);
        let response = self
            .client
            .post(self.url("/band/enroll"))
            .json(request)
            .send()
            .await
            .map_err(transport)?;
        success_body(response).await
    }

    async fn unenroll(&self, credential: &str) -> Result<String> {
        let response = self
            .client
            .get(self.url("/band/unenroll"))
            .header(header::AUTHORIZATION, credential)
            .send()
            .await
            .map_err(transport)?;
        success_body(response).await
    }

    async fn fetch_config(
        &self,
        credential: &str,
        validation_token: Option<&str>,
        request: &ConfigRequest,
    ) -> Result<ConfigFetch> {
        let mut builder = self
            .client
            .post(self.url("/band/conf"))
            .header(header::AUTHORIZATION, credential)
            .json(request);
        if let Some(token) = validation_token {
            builder = builder.header(header::IF_NONE_MATCH, token);
        }

        let response = builder.send().await.map_err(transport)?;
        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(ConfigFetch::NotModified);
        }

        let validation_token = response
            .headers()
            .get(header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(normalize_etag);
        let body = success_body(response).await?;
        Ok(ConfigFetch::Fetched {
            validation_token,
            body,
        })
    }
}

fn transport(e: reqwest::Error) -> Error {
    Error::Network(e.to_string())
}

fn protocol(status: i64, message: Option<String>) -> Error {
    Error::Protocol {
        status,
        message: message.unwrap_or_else(|| "no message".to_string()),
    }
}

fn parse_reply<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| Error::Parse(format!("control plane reply: {}", e)))
}

async fn success_body(response: reqwest::Response) -> Result<String> {
    let status = response.status();
    let body = response.text().await.map_err(transport)?;
    if !status.is_success() {
        let message = body.chars().take(200).collect::<String>();
        return Err(Error::Protocol {
            status: i64::from(status.as_u16()),
            message,
        });
    }
    Ok(body)
}
