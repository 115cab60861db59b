//! Messaging Gateway reply client.

use std::time::Duration;

use async_trait::async_trait;
use relay_contracts::ReplyMessageRequest;
use reqwest::Client;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("network error: {0}")]
    Network(String),
    #[error("reply rejected: status={status} body={body}")]
    Api { status: u16, body: String },
}

/// A reply token is single-use and only valid while the inbound webhook
/// request is being handled.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    async fn reply(
        &self,
        reply_token: &str,
        text: &str,
        quote_token: Option<&str>,
    ) -> Result<(), GatewayError>;
}

pub struct LineGateway {
    client: Client,
    channel_token: String,
    base_url: String,
}

impl LineGateway {
    pub fn new(cfg: &relay_config::Line) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        Ok(Self {
            client,
            channel_token: cfg.channel_token.clone(),
            base_url: cfg.api_base.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MessagingGateway for LineGateway {
    async fn reply(
        &self,
        reply_token: &str,
        text: &str,
        quote_token: Option<&str>,
    ) -> Result<(), GatewayError> {
        let request = ReplyMessageRequest::text(reply_token, text, quote_token);
        let response = self
            .client
            .post(format!("{}/v2/bot/message/reply", self.base_url))
            .bearer_auth(&self.channel_token)
            .json(&request)
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn line_config(base: &str) -> relay_config::Line {
        relay_config::Line {
            channel_secret: "secret".to_string(),
            channel_token: "token-123".to_string(),
            api_base: base.to_string(),
            timeout_ms: 2_000,
        }
    }

    #[tokio::test]
    async fn posts_text_reply_with_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v2/bot/message/reply")
            .match_header("authorization", "Bearer token-123")
            .match_body(Matcher::Json(json!({
                "replyToken": "r1",
                "messages": [{"type": "text", "text": "hi there", "quoteToken": "q1"}]
            })))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let gateway = LineGateway::new(&line_config(&server.url())).unwrap();
        gateway.reply("r1", "hi there", Some("q1")).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn surfaces_rejections() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v2/bot/message/reply")
            .with_status(400)
            .with_body(r#"{"message":"Invalid reply token"}"#)
            .create_async()
            .await;

        let gateway = LineGateway::new(&line_config(&server.url())).unwrap();
        let err = gateway.reply("stale", "hi", None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Api { status: 400, .. }));
    }
}
