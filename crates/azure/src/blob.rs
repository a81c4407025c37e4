use async_trait::async_trait;
use capture_core::model::{CopyHandle, RemoteCopyState};
use capture_core::services::ObjectStoreService;
use capture_core::ServiceError;
use tracing::debug;

use crate::http::{self, SasToken, STORAGE_VERSION};

/// Archive container access through the Blob service REST API.
#[derive(Debug, Clone)]
pub struct BlobArchiveClient {
    http: reqwest::Client,
    endpoint: String,
    sas: SasToken,
}

impl BlobArchiveClient {
    pub fn new(storage_account: &str, sas: SasToken) -> Result<Self, ServiceError> {
        Ok(Self {
            http: http::client()?,
            endpoint: format!("https://{storage_account}.blob.core.windows.net"),
            sas,
        })
    }

    pub fn blob_url(&self, container: &str, blob: &str) -> String {
        format!("{}/{container}/{blob}", self.endpoint)
    }
}

#[async_trait]
impl ObjectStoreService for BlobArchiveClient {
    async fn copy_from_url(
        &self,
        source_url: &str,
        container: &str,
        dest_name: &str,
    ) -> Result<CopyHandle, ServiceError> {
        let url = self.sas.sign(&self.blob_url(container, dest_name));
        let resp = self
            .http
            .put(url)
            .header("x-ms-version", STORAGE_VERSION)
            .header("x-ms-copy-source", source_url)
            .header("content-length", "0")
            .send()
            .await
            .map_err(http::transport)?;
        let resp = http::check(resp).await?;
        let copy_id = http::header(resp.headers(), "x-ms-copy-id")
            .ok_or_else(|| ServiceError::Protocol("copy blob response carried no x-ms-copy-id".into()))?;
        debug!(container = %container, blob = %dest_name, copy_id = %copy_id, "blob copy accepted");
        Ok(CopyHandle {
            location: container.to_string(),
            path: dest_name.to_string(),
            copy_id,
        })
    }

    async fn copy_state(&self, handle: &CopyHandle) -> Result<RemoteCopyState, ServiceError> {
        let url = self.sas.sign(&self.blob_url(&handle.location, &handle.path));
        let resp = self
            .http
            .head(url)
            .header("x-ms-version", STORAGE_VERSION)
            .send()
            .await
            .map_err(http::transport)?;
        let resp = http::check(resp).await?;
        Ok(http::copy_state_from_headers(resp.headers()))
    }

    async fn abort_copy(&self, handle: &CopyHandle) -> Result<(), ServiceError> {
        let url = format!(
            "{}?comp=copy&copyid={}",
            self.blob_url(&handle.location, &handle.path),
            handle.copy_id
        );
        let resp = self
            .http
            .put(self.sas.sign(&url))
            .header("x-ms-version", STORAGE_VERSION)
            .header("x-ms-copy-action", "abort")
            .header("content-length", "0")
            .send()
            .await
            .map_err(http::transport)?;
        http::check(resp).await?;
        Ok(())
    }
}
