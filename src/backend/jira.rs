//! Jira REST calls with basic authentication.

use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::JiraConfig;
use crate::error::{require, Result, TetherError};

/// Minimal Jira REST client.
#[derive(Clone)]
pub struct JiraClient {
    client: reqwest::Client,
    user: String,
    token: String,
}

impl std::fmt::Debug for JiraClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JiraClient").field("user", &self.user).finish_non_exhaustive()
    }
}

impl JiraClient {
    /// Create a client for the given credentials.
    pub fn new(config: &JiraConfig) -> Result<Self> {
        require("jira user", &config.user)?;
        require("jira token", &config.token)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TetherError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            user: config.user.clone(),
            token: config.token.clone(),
        })
    }

    /// Create an issue by POSTing `payload` to the issue endpoint.
    pub async fn create_issue(&self, url: &str, payload: &Value) -> Result<Value> {
        require("url", url)?;
        let response = self
            .client
            .post(url)
            .basic_auth(&self.user, Some(&self.token))
            .header(reqwest::header::ACCEPT, "application/json")
            .json(payload)
            .send()
            .await?;
        let body = read_json(response).await?;
        tracing::info!(url, key = ?body.get("key"), "Jira issue created");
        Ok(body)
    }

    /// Fetch an issue, or `None` if Jira answers 404.
    pub async fn get_issue(&self, url: &str) -> Result<Option<Value>> {
        require("url", url)?;
        let response = self
            .client
            .get(url)
            .basic_auth(&self.user, Some(&self.token))
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        read_json(response).await.map(Some)
    }

    /// Add a comment. `url` must be an issue's comment endpoint, e.g.
    /// `https://example.atlassian.net/rest/api/2/issue/ABC-1/comment`.
    pub async fn add_comment(&self, url: &str, comment: &str) -> Result<Value> {
        check_comment_url(url)?;
        self.create_issue(url, &json!({ "body": comment })).await
    }
}

fn check_comment_url(url: &str) -> Result<()> {
    require("url", url)?;
    if !url.trim_end_matches('/').ends_with("comment") {
        return Err(TetherError::InvalidInput(format!(
            "comment url must end with 'comment', got {url}"
        )));
    }
    Ok(())
}

async fn read_json(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(TetherError::Http {
            status: Some(status.as_u16()),
            message,
        });
    }
    let text = response.text().await?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> JiraConfig {
        JiraConfig {
            user: "bot@example.com".to_string(),
            token: "s3cr3t".to_string(),
        }
    }

    #[test]
    fn test_requires_credentials() {
        assert!(JiraClient::new(&JiraConfig::default()).is_err());
        assert!(JiraClient::new(&config()).is_ok());
    }

    #[test]
    fn test_debug_hides_token() {
        let client = JiraClient::new(&config()).unwrap();
        let debug = format!("{:?}", client);
        assert!(debug.contains("bot@example.com"));
        assert!(!debug.contains("s3cr3t"));
    }

    #[test]
    fn test_check_comment_url() {
        assert!(check_comment_url("https://x.atlassian.net/rest/api/2/issue/AB-1/comment").is_ok());
        assert!(matches!(
            check_comment_url("https://x.atlassian.net/rest/api/2/issue/AB-1"),
            Err(TetherError::InvalidInput(_))
        ));
        assert!(matches!(check_comment_url(""), Err(TetherError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_get_issue_not_found_is_none() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/rest/api/2/issue/AB-404", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            socket
                .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
            request
        });

        let client = JiraClient::new(&config()).unwrap();
        assert_eq!(client.get_issue(&url).await.unwrap(), None);

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /rest/api/2/issue/AB-404"));
        assert!(request.to_ascii_lowercase().contains("authorization: basic "));
    }

    #[tokio::test]
    async fn test_add_comment_rejects_bad_url_without_request() {
        let client = JiraClient::new(&config()).unwrap();
        let err = client
            .add_comment("http://127.0.0.1:9/rest/api/2/issue/AB-1", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::InvalidInput(_)));
    }
}
