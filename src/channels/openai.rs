use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue};
use reqwest::Client;

use super::{BaseChannel, Channel};

pub struct OpenAiChannel;

#[async_trait]
impl Channel for OpenAiChannel {
    fn channel_type(&self) -> &'static str {
        "openai"
    }

    fn modify_request(&self, url: &str, headers: &mut HeaderMap, api_key: &str) -> String {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
            headers.insert("authorization", value);
        }
        url.to_string()
    }

    async fn validate_key(&self, client: &Client, base: &BaseChannel, api_key: &str) -> (bool, Option<String>) {
        let endpoint = base
            .validation_endpoint
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string());
        let body = serde_json::json!({
            "model": base.test_model,
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 1,
        });

        match client.post(endpoint).bearer_auth(api_key).json(&body).send().await {
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
