// REST client for the auction server: snapshot fetch, bid pre-flight and
// the non-real-time bid placement path.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use super::{usable_token, AuctionApi};
use crate::protocol::{AuctionId, AuctionView, BidAcceptance, BidValidation};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no auth token available")]
    MissingToken,

    #[error("auction id is empty")]
    MissingAuctionId,

    #[error("invalid API base URL {url}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("no answer within {0:?}")]
    TimedOut(Duration),

    #[error("server returned {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl ApiError {
    /// True when the server answered and refused, as opposed to the request
    /// never completing.
    pub fn is_refusal(&self) -> bool {
        matches!(self, ApiError::Status { status, .. } if status.is_client_error())
    }
}

pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, token)
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        RestClient {
            http,
            base_url,
            token,
        }
    }

    /// `{base}/auctions/{id}/{action}`, with the id percent-encoded as a
    /// single path segment.
    fn endpoint(&self, auction_id: &AuctionId, action: &str) -> Result<Url, ApiError> {
        if auction_id.is_empty() {
            return Err(ApiError::MissingAuctionId);
        }
        let invalid = |reason: String| ApiError::InvalidBaseUrl {
            url: self.base_url.clone(),
            reason,
        };
        let mut url = Url::parse(&self.base_url).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| invalid("cannot hold a path".to_string()))?
            .pop_if_empty()
            .extend(["auctions", auction_id.as_str(), action]);
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, ApiError> {
        let token = usable_token(self.token.as_deref()).ok_or(ApiError::MissingToken)?;
        Ok(request.bearer_auth(token))
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let response = self.authorized(request)?.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl AuctionApi for RestClient {
    async fn auction_state(&self, auction_id: &AuctionId) -> Result<AuctionView, ApiError> {
        let url = self.endpoint(auction_id, "state")?;
        debug!("GET {url}");
        self.fetch(self.http.get(url)).await
    }

    async fn validate_bid(&self, auction_id: &AuctionId, amount: u64) -> Result<BidValidation, ApiError> {
        let url = self.endpoint(auction_id, "validate-bid")?;
        debug!("POST {url} amount={amount}");
        self.fetch(self.http.post(url).json(&json!({ "amount": amount })))
            .await
    }

    async fn place_bid(&self, auction_id: &AuctionId, amount: u64) -> Result<BidAcceptance, ApiError> {
        let url = self.endpoint(auction_id, "place-bid")?;
        debug!("POST {url} amount={amount}");
        self.fetch(self.http.post(url).json(&json!({ "amount": amount })))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve exactly one HTTP response and hand back the raw request text.
    async fn one_shot_server(status_line: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            while !request_complete(&buf) {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let request = String::from_utf8_lossy(&buf).to_string();

            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
            request
        });
        (format!("http://{addr}/api/"), task)
    }

    /// Headers received and the body is as long as Content-Length says.
    fn request_complete(buf: &[u8]) -> bool {
        let text = String::from_utf8_lossy(buf);
        let Some(head_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..head_end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.trim().eq_ignore_ascii_case("content-length") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);
        buf.len() >= head_end + 4 + length
    }

    #[tokio::test]
    async fn fetches_snapshot_with_bearer_token() {
        let body = r#"{"auctionId":"a-7","productName":"Cotton","startingPrice":10,"currentHighestBid":20,
            "bidStartDate":"2026-03-01T00:00:00Z","bidEndDate":"2026-03-05T00:00:00Z","isActive":true}"#;
        let (base, server) = one_shot_server("200 OK", body).await;

        let client = RestClient::new(base, Some("tok-9".into()));
        let view = client.auction_state(&"a-7".into()).await.unwrap();
        assert_eq!(view.auction_id.as_str(), "a-7");
        assert_eq!(view.current_highest_bid, 20);

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/auctions/a-7/state "));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer tok-9"));
    }

    #[tokio::test]
    async fn validate_bid_posts_amount() {
        let (base, server) = one_shot_server("200 OK", r#"{"valid":false,"message":"Bid too low"}"#).await;

        let client = RestClient::new(base, Some("tok".into()));
        let validation = client.validate_bid(&"a-7".into(), 1_500).await.unwrap();
        assert!(!validation.valid);
        assert_eq!(validation.message.as_deref(), Some("Bid too low"));

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/auctions/a-7/validate-bid "));
        assert!(request.contains(r#"{"amount":1500}"#));
    }

    #[tokio::test]
    async fn auction_id_is_encoded_as_one_path_segment() {
        let body = r#"{"valid":true}"#;
        let (base, server) = one_shot_server("200 OK", body).await;

        let client = RestClient::new(base, Some("tok".into()));
        client.validate_bid(&"lot/7?x#y".into(), 10).await.unwrap();

        let request = server.await.unwrap();
        assert!(
            request.starts_with("POST /api/auctions/lot%2F7%3Fx%23y/validate-bid "),
            "unexpected request line: {}",
            request.lines().next().unwrap_or_default()
        );
    }

    #[tokio::test]
    async fn unusable_base_url_is_typed() {
        let client = RestClient::new("not a url", Some("tok".into()));
        assert!(matches!(
            client.auction_state(&"a-1".into()).await,
            Err(ApiError::InvalidBaseUrl { .. })
        ));
    }

    #[tokio::test]
    async fn error_status_is_typed() {
        let (base, server) = one_shot_server("409 Conflict", r#"{"message":"outbid"}"#).await;

        let client = RestClient::new(base, Some("tok".into()));
        let err = client.place_bid(&"a-7".into(), 1_500).await.unwrap_err();
        match &err {
            ApiError::Status { status, body } => {
                assert_eq!(*status, StatusCode::CONFLICT);
                assert!(body.contains("outbid"));
            }
            other => panic!("expected status error, got {other:?}"),
        }
        assert!(err.is_refusal());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn missing_token_fails_without_network() {
        // Nothing listens on this port; reaching the network would be a
        // transport error rather than MissingToken.
        let client = RestClient::new("http://127.0.0.1:9/api", None);
        assert!(matches!(
            client.auction_state(&"a-1".into()).await,
            Err(ApiError::MissingToken)
        ));
    }

    #[tokio::test]
    async fn empty_auction_id_fails_without_network() {
        let client = RestClient::new("http://127.0.0.1:9/api", Some("tok".into()));
        assert!(matches!(
            client.validate_bid(&"".into(), 5).await,
            Err(ApiError::MissingAuctionId)
        ));
    }
}
