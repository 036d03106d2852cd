use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue};
use reqwest::Client;

use super::{BaseChannel, Channel};

pub struct AnthropicChannel;

#[async_trait]
impl Channel for AnthropicChannel {
    fn channel_type(&self) -> &'static str {
        "anthropic"
    }

    fn modify_request(&self, url: &str, headers: &mut HeaderMap, api_key: &str) -> String {
        if let Ok(value) = HeaderValue::from_str(api_key) {
            headers.insert("x-api-key", value);
        }
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        url.to_string()
    }

    async fn validate_key(&self, client: &Client, base: &BaseChannel, api_key: &str) -> (bool, Option<String>) {
        let endpoint = base.validation_endpoint.clone().unwrap_or_else(|| "https://api.anthropic.com/v1/messages".to_string());
        let body = serde_json::json!({
            "model": base.test_model,
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 100,
        });

        match client
            .post(endpoint)
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
        {
            Ok(resp) if resp.status().as_u16() == 200 => (true, None),
            Ok(resp) => {
                let status = resp.status();
                let message = resp.text().await.unwrap_or_default();
                (false, Some(format!("{status}: {message}")))
            }
            Err(err) => (false, Some(err.to_string())),
        }
    }
}
