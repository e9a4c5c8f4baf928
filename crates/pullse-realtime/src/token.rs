//! Short-lived auth tokens for the realtime backend.
//!
//! Every (re)connect attempt fetches a fresh token; tokens are never cached
//! across attempts.

use std::time::Duration;

use serde::Deserialize;

use crate::error::RealtimeError;

const TOKEN_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

enum TokenSource {
    /// `GET <url>` returning `{ "token": "..." }`.
    Endpoint { http: reqwest::Client, url: String },
    /// A fixed token, for tests and local development.
    Fixed(String),
}

pub struct TokenClient {
    source: TokenSource,
}

impl TokenClient {
    /// Token client backed by the workspace's token endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(TOKEN_FETCH_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            source: TokenSource::Endpoint {
                http,
                url: url.into(),
            },
        }
    }

    /// Token client that always hands out the same token.
    pub fn fixed(token: impl Into<String>) -> Self {
        Self {
            source: TokenSource::Fixed(token.into()),
        }
    }

    /// Fetch a fresh token.
    ///
    /// Any non-2xx status or malformed body is an [`RealtimeError::AuthToken`]
    /// failure; the connection manager treats it as a failed connect attempt.
    pub async fn fetch(&self) -> Result<String, RealtimeError> {
        match &self.source {
            TokenSource::Fixed(token) => Ok(token.clone()),
            TokenSource::Endpoint { http, url } => {
                let response = http
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| RealtimeError::AuthToken(e.to_string()))?;

                let status = response.status();
                if !status.is_success() {
                    return Err(RealtimeError::AuthToken(format!(
                        "token endpoint returned {status}"
                    )));
                }

                let body: TokenResponse = response
                    .json()
                    .await
                    .map_err(|e| RealtimeError::AuthToken(e.to_string()))?;

                if body.token.is_empty() {
                    return Err(RealtimeError::AuthToken("empty token".to_string()));
                }

                Ok(body.token)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response, then close.
    async fn one_shot_server(body: &'static str, status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let response = format!(
                    "{status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });

        format!("http://{addr}/ably-token")
    }

    #[tokio::test]
    async fn test_fetch_token() {
        let url = one_shot_server(r#"{"token":"tok-123"}"#, "HTTP/1.1 200 OK").await;
        let client = TokenClient::new(url);

        assert_eq!(client.fetch().await.unwrap(), "tok-123");
    }

    #[tokio::test]
    async fn test_non_2xx_is_auth_error() {
        let url = one_shot_server("denied", "HTTP/1.1 403 Forbidden").await;
        let client = TokenClient::new(url);

        assert!(matches!(
            client.fetch().await,
            Err(RealtimeError::AuthToken(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_body_is_auth_error() {
        let url = one_shot_server(r#"{"nope":true}"#, "HTTP/1.1 200 OK").await;
        let client = TokenClient::new(url);

        assert!(matches!(
            client.fetch().await,
            Err(RealtimeError::AuthToken(_))
        ));
    }

    #[tokio::test]
    async fn test_fixed_token() {
        let client = TokenClient::fixed("local");
        assert_eq!(client.fetch().await.unwrap(), "local");
    }
}
