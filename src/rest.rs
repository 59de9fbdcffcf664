use reqwest::Client;
use serde::Deserialize;

use crate::error::Result;

/// Minimal REST client for the calls the gateway session needs before a
/// websocket exists.
pub struct RestClient {
    client: Client,
    base_url: String,
    token: String,
}

/// Response of `GET /gateway/bot`: where to connect and how many shards the
/// server recommends.
#[derive(Debug, Deserialize)]
pub struct GatewayBot {
    pub url: String,
    #[serde(default)]
    pub shards: u32,
}

impl RestClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    /// Gateway bootstrap: resolve the websocket URL (and recommended shard
    /// count) for this token.
    pub async fn gateway_bot(&self) -> Result<GatewayBot> {
        let url = format!("{}/gateway/bot", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("Authorization", format!("Bot {}", self.token))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_stripped() {
        let rest = RestClient::new("http://localhost:39099/api/v1/", "t");
        assert_eq!(rest.base_url, "http://localhost:39099/api/v1");
    }

    #[test]
    fn gateway_bot_response_shape() {
        let bot: GatewayBot =
            serde_json::from_str(r#"{"url":"ws://localhost:39099/gateway","shards":2}"#).unwrap();
        assert_eq!(bot.url, "ws://localhost:39099/gateway");
        assert_eq!(bot.shards, 2);

        let bot: GatewayBot = serde_json::from_str(r#"{"url":"ws://gw"}"#).unwrap();
        assert_eq!(bot.shards, 0);
    }
}
