use super::{AssetError, AssetSink, UploadResponse};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::Path;

const UPLOAD_PATH: &str = "/openapi/v1/assets/cmdb/upload";
const OPERATION_HEADER: &str = "x-tetration-oper";
const CHECKSUM_HEADER: &str = "x-tetration-cksum";
const SIGNED_CONTENT_TYPE: &str = "multipart/form-data";
const USER_AGENT: &str = concat!("vm-annotator/", env!("CARGO_PKG_VERSION"));

type HmacSha256 = Hmac<Sha256>;

/// API key pair used to sign requests.
#[derive(Clone, Deserialize)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// HTTP client for the asset system's bulk annotation endpoint.
pub struct AssetClient {
    http: Client,
    base_url: String,
    credentials: ApiCredentials,
}

impl AssetClient {
    pub fn new(
        base_url: &str,
        credentials: ApiCredentials,
        verify_tls: bool,
    ) -> Result<Self, AssetError> {
        let http = Client::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn signed_headers(
        &self,
        method: &str,
        path: &str,
        checksum: &str,
        timestamp: &str,
    ) -> Result<HeaderMap, AssetError> {
        let signature = sign(
            &self.credentials.api_secret,
            method,
            path,
            checksum,
            SIGNED_CONTENT_TYPE,
            timestamp,
        )?;

        let mut headers = HeaderMap::new();
        for (name, value) in [
            ("id", self.credentials.api_key.as_str()),
            ("timestamp", timestamp),
            ("authorization", signature.as_str()),
            (CHECKSUM_HEADER, checksum),
            (OPERATION_HEADER, "add"),
        ] {
            let value = HeaderValue::from_str(value)
                .map_err(|e| AssetError::InvalidRequest(format!("header {}: {}", name, e)))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl AssetSink for AssetClient {
    async fn upload(&self, tenant: &str, payload: &Path) -> Result<UploadResponse, AssetError> {
        let body = tokio::fs::read(payload).await?;
        let path = format!("{}/{}", UPLOAD_PATH, tenant);
        let checksum = hex::encode(Sha256::digest(&body));
        let timestamp = chrono::Utc::now()
            .format("%Y-%m-%dT%H:%M:%S+0000")
            .to_string();
        let headers = self.signed_headers("POST", &path, &checksum, &timestamp)?;

        let file_name = payload
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "annotations.csv".into());
        let part = Part::bytes(body).file_name(file_name).mime_str("text/csv")?;
        let form = Form::new().part("file", part);

        debug!("POST {}{}", self.base_url, path);
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .headers(headers)
            .multipart(form)
            .send()
            .await?;

        let ok = resp.status().is_success();
        let body = resp.text().await.unwrap_or_default();
        Ok(UploadResponse { ok, body })
    }
}

/// Base64 HMAC-SHA256 over the canonical request description.
fn sign(
    secret: &str,
    method: &str,
    path: &str,
    checksum: &str,
    content_type: &str,
    timestamp: &str,
) -> Result<String, AssetError> {
    let message = format!(
        "{}\n{}\n{}\n{}\n{}\n",
        method, path, checksum, content_type, timestamp
    );
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AssetError::InvalidRequest(e.to_string()))?;
    mac.update(message.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}
