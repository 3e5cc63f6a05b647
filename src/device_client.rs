use crate::{
    errors::TransportError,
    http_client::{device_http_client, handle_http_response, progress_body},
};
use anyhow::{Context, Result};
use log::info;
#[cfg(feature = "mock")]
use mockall::automock;
use reqwest::{
    Client,
    header::{CACHE_CONTROL, HeaderValue},
    multipart::{Form, Part},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use trait_variant::make;

/// Firmware metadata as reported by `GET /api/ota/info`
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct OtaInfo {
    pub version: Option<String>,
    pub build_date: Option<String>,
    pub idf_version: Option<String>,
    #[serde(default)]
    pub can_rollback: bool,
    #[serde(default)]
    pub partition_label: Option<String>,
    #[serde(default)]
    pub app_size: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct UploadResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct RollbackResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Status and body of the upload answer, interpreted by the upload tracker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug)]
pub struct FirmwareUpload {
    pub name: String,
    pub data: Vec<u8>,
}

#[make(Send)]
#[cfg_attr(feature = "mock", automock)]
pub trait DeviceClient {
    async fn ota_info(&self) -> Result<OtaInfo>;
    /// Sends the image, reporting the running byte count on `progress`
    async fn upload_firmware(
        &self,
        upload: FirmwareUpload,
        progress: mpsc::UnboundedSender<u64>,
    ) -> Result<RawResponse, TransportError>;
    async fn rollback(&self) -> Result<RollbackResponse>;
    /// Liveness probe, any 2xx answer counts as reachable
    async fn system_state(&self) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct OtaDeviceClient {
    client: Client,
    base_url: String,
    probe_timeout: Duration,
}

impl OtaDeviceClient {
    // API endpoint constants
    const OTA_INFO_ENDPOINT: &str = "/api/ota/info";
    const OTA_UPLOAD_ENDPOINT: &str = "/api/ota/upload";
    const OTA_ROLLBACK_ENDPOINT: &str = "/api/ota/rollback";
    const SYSTEM_STATE_ENDPOINT: &str = "/api/system/state";

    const FIRMWARE_FIELD: &str = "firmware";

    pub fn new(base_url: &str, connect_timeout: Duration, probe_timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: device_http_client(connect_timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            probe_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_url(&self, path: &str) -> String {
        // Normalize path to always start with a single "/"
        let normalized_path = path.trim_start_matches('/');
        format!("{}/{normalized_path}", self.base_url)
    }

    /// GET request to the device API
    async fn get(&self, path: &str) -> Result<String> {
        let url = self.build_url(path);
        info!("GET {url}");

        let res = self
            .client
            .get(&url)
            .send()
            .await
            .context(format!("failed to send GET request to {url}"))?;

        handle_http_response(res, &format!("GET {url}")).await
    }

    /// POST request to the device API (empty body)
    async fn post(&self, path: &str) -> Result<String> {
        let url = self.build_url(path);
        info!("POST {url}");

        let res = self
            .client
            .post(&url)
            .send()
            .await
            .context(format!("failed to send POST request to {url}"))?;

        handle_http_response(res, &format!("POST {url}")).await
    }
}

impl DeviceClient for OtaDeviceClient {
    async fn ota_info(&self) -> Result<OtaInfo> {
        let body = self.get(Self::OTA_INFO_ENDPOINT).await?;
        serde_json::from_str(&body).context("failed to parse ota info")
    }

    async fn upload_firmware(
        &self,
        upload: FirmwareUpload,
        progress: mpsc::UnboundedSender<u64>,
    ) -> Result<RawResponse, TransportError> {
        let url = self.build_url(Self::OTA_UPLOAD_ENDPOINT);
        let len = upload.data.len() as u64;
        info!("POST {url} with firmware {} ({len} bytes)", upload.name);

        let part = Part::stream_with_length(progress_body(upload.data, progress), len)
            .file_name(upload.name)
            .mime_str("application/octet-stream")
            .map_err(|e| TransportError::NetworkError(e.to_string()))?;
        let form = Form::new().part(Self::FIRMWARE_FIELD, part);

        let res = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| TransportError::NetworkError(e.to_string()))?;

        let status = res.status().as_u16();
        let body = res
            .text()
            .await
            .map_err(|e| TransportError::NetworkError(e.to_string()))?;

        Ok(RawResponse { status, body })
    }

    async fn rollback(&self) -> Result<RollbackResponse> {
        let body = self.post(Self::OTA_ROLLBACK_ENDPOINT).await?;
        serde_json::from_str(&body).context("failed to parse rollback response")
    }

    async fn system_state(&self) -> Result<()> {
        let url = self.build_url(Self::SYSTEM_STATE_ENDPOINT);

        self.client
            .get(&url)
            .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
            .timeout(self.probe_timeout)
            .send()
            .await
            .context(format!("failed to send GET request to {url}"))?
            .error_for_status()
            .context("device not ready: server returned error status")?;

        Ok(())
    }
}
