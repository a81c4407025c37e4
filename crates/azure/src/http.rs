use std::fmt;
use std::time::Duration;

use capture_core::model::RemoteCopyState;
use capture_core::ServiceError;
use reqwest::header::HeaderMap;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;

/// Storage REST version sent with every data-plane request.
pub(crate) const STORAGE_VERSION: &str = "2023-11-03";

/// Bearer token for a management or vault endpoint.
#[derive(Clone)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(<redacted>)")
    }
}

/// SAS query string granting access to a storage account.
#[derive(Clone)]
pub struct SasToken(String);

impl SasToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into().trim_start_matches('?').to_string())
    }

    /// Appends the token to `url`, which may already carry a query.
    pub(crate) fn sign(&self, url: &str) -> String {
        if self.0.is_empty() {
            return url.to_string();
        }
        let sep = if url.contains('?') { '&' } else { '?' };
        format!("{url}{sep}{}", self.0)
    }
}

impl fmt::Debug for SasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SasToken(<redacted>)")
    }
}

/// Shared client settings.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub poll_interval: Duration,
    pub operation_timeout: Duration,
}

pub(crate) fn client() -> Result<reqwest::Client, ServiceError> {
    reqwest::Client::builder()
        .user_agent(concat!("disk-capture/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(120))
        .build()
        .map_err(transport)
}

pub(crate) fn transport(e: reqwest::Error) -> ServiceError {
    ServiceError::Transport(e.to_string())
}

/// Maps a failed response to the service error taxonomy.
pub fn status_error(status: StatusCode, body: &str) -> ServiceError {
    let detail = format!("{status}: {}", body.chars().take(512).collect::<String>());
    match status.as_u16() {
        401 | 403 => ServiceError::Unauthorized(detail),
        404 => ServiceError::NotFound(detail),
        409 if body.contains("OperationNotAllowed") => ServiceError::QuotaExceeded(detail),
        409 => ServiceError::Conflict(detail),
        429 if body.contains("OperationNotAllowed") || body.to_ascii_lowercase().contains("quota") => {
            ServiceError::QuotaExceeded(detail)
        }
        _ if body.contains("OperationNotAllowed") => ServiceError::QuotaExceeded(detail),
        _ => ServiceError::Protocol(detail),
    }
}

/// Passes successful responses through, maps the rest.
pub(crate) async fn check(resp: Response) -> Result<Response, ServiceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

pub(crate) async fn json<T: DeserializeOwned>(resp: Response) -> Result<T, ServiceError> {
    let resp = check(resp).await?;
    resp.json::<T>()
        .await
        .map_err(|e| ServiceError::Protocol(format!("decode response: {e}")))
}

pub(crate) fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

/// Reads `x-ms-copy-status` and `x-ms-copy-status-description`.
pub fn copy_state_from_headers(headers: &HeaderMap) -> RemoteCopyState {
    let status = header(headers, "x-ms-copy-status");
    let description = header(headers, "x-ms-copy-status-description").unwrap_or_default();
    parse_copy_status(status.as_deref(), &description)
}

pub fn parse_copy_status(status: Option<&str>, description: &str) -> RemoteCopyState {
    match status.map(str::to_ascii_lowercase).as_deref() {
        None => RemoteCopyState::Pending,
        Some("pending") => RemoteCopyState::Copying,
        Some("success") => RemoteCopyState::Success,
        Some("aborted") => RemoteCopyState::Aborted,
        Some("failed") => RemoteCopyState::Failed(description.to_string()),
        Some(other) => RemoteCopyState::Failed(format!("unknown copy status {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn maps_statuses() {
        assert!(matches!(status_error(StatusCode::FORBIDDEN, ""), ServiceError::Unauthorized(_)));
        assert!(matches!(status_error(StatusCode::UNAUTHORIZED, ""), ServiceError::Unauthorized(_)));
        assert!(matches!(status_error(StatusCode::NOT_FOUND, ""), ServiceError::NotFound(_)));
        assert!(matches!(status_error(StatusCode::CONFLICT, "{}"), ServiceError::Conflict(_)));
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, r#"{"error":{"message":"Quota exceeded for snapshots"}}"#),
            ServiceError::QuotaExceeded(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, r#"{"error":{"code":"OperationNotAllowed"}}"#),
            ServiceError::QuotaExceeded(_)
        ));
        assert!(matches!(status_error(StatusCode::TOO_MANY_REQUESTS, "slow down"), ServiceError::Protocol(_)));
        assert!(matches!(status_error(StatusCode::BAD_GATEWAY, ""), ServiceError::Protocol(_)));
    }

    #[test]
    fn parses_copy_status() {
        assert_eq!(parse_copy_status(None, ""), RemoteCopyState::Pending);
        assert_eq!(parse_copy_status(Some("pending"), ""), RemoteCopyState::Copying);
        assert_eq!(parse_copy_status(Some("Success"), ""), RemoteCopyState::Success);
        assert_eq!(parse_copy_status(Some("aborted"), ""), RemoteCopyState::Aborted);
        assert_eq!(
            parse_copy_status(Some("failed"), "500 InternalError"),
            RemoteCopyState::Failed("500 InternalError".into())
        );
    }

    #[test]
    fn reads_copy_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ms-copy-status", HeaderValue::from_static("failed"));
        headers.insert("x-ms-copy-status-description", HeaderValue::from_static("source gone"));
        assert_eq!(copy_state_from_headers(&headers), RemoteCopyState::Failed("source gone".into()));
    }

    #[test]
    fn sas_is_appended_once() {
        let sas = SasToken::new("?sv=2023&sig=abc");
        assert_eq!(sas.sign("https://a/b"), "https://a/b?sv=2023&sig=abc");
        assert_eq!(sas.sign("https://a/b?comp=copy"), "https://a/b?comp=copy&sv=2023&sig=abc");
        assert_eq!(SasToken::new("").sign("https://a/b"), "https://a/b");
        assert_eq!(format!("{sas:?}"), "SasToken(<redacted>)");
    }
}
