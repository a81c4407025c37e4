use async_trait::async_trait;
use capture_core::model::{CopyHandle, RemoteCopyState};
use capture_core::services::FileShareService;
use capture_core::ServiceError;
use tracing::debug;

use crate::http::{self, SasToken, STORAGE_VERSION};

/// Staging share access through the File service REST API.
#[derive(Debug, Clone)]
pub struct FileShareClient {
    http: reqwest::Client,
    endpoint: String,
    sas: SasToken,
}

impl FileShareClient {
    pub fn new(storage_account: &str, sas: SasToken) -> Result<Self, ServiceError> {
        Ok(Self {
            http: http::client()?,
            endpoint: format!("https://{storage_account}.file.core.windows.net"),
            sas,
        })
    }

    pub fn file_url(&self, share: &str, path: &str) -> String {
        format!("{}/{share}/{}", self.endpoint, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl FileShareService for FileShareClient {
    async fn copy_from_url(&self, source_url: &str, share: &str, path: &str) -> Result<CopyHandle, ServiceError> {
        let resp = self
            .http
            .put(self.sas.sign(&self.file_url(share, path)))
            .header("x-ms-version", STORAGE_VERSION)
            .header("x-ms-copy-source", source_url)
            .header("content-length", "0")
            .send()
            .await
            .map_err(http::transport)?;
        let resp = http::check(resp).await?;
        let copy_id = http::header(resp.headers(), "x-ms-copy-id")
            .ok_or_else(|| ServiceError::Protocol("copy file response carried no x-ms-copy-id".into()))?;
        debug!(share = %share, path = %path, copy_id = %copy_id, "file copy accepted");
        Ok(CopyHandle {
            location: share.to_string(),
            path: path.to_string(),
            copy_id,
        })
    }

    async fn copy_state(&self, handle: &CopyHandle) -> Result<RemoteCopyState, ServiceError> {
        let resp = self
            .http
            .head(self.sas.sign(&self.file_url(&handle.location, &handle.path)))
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
            self.file_url(&handle.location, &handle.path),
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

    async fn delete(&self, share: &str, path: &str) -> Result<(), ServiceError> {
        let resp = self
            .http
            .delete(self.sas.sign(&self.file_url(share, path)))
            .header("x-ms-version", STORAGE_VERSION)
            .send()
            .await
            .map_err(http::transport)?;
        http::check(resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_file_urls() {
        let client = FileShareClient::new("evidencestaging", SasToken::new("")).unwrap();
        assert_eq!(
            client.file_url("hash", "/20240101000000-os"),
            "https://evidencestaging.file.core.windows.net/hash/20240101000000-os"
        );
    }
}
