use async_trait::async_trait;
use axum::http::HeaderMap;
use reqwest::Client;

use super::{BaseChannel, Channel};

pub struct GeminiChannel;

#[async_trait]
impl Channel for GeminiChannel {
    fn channel_type(&self) -> &'static str {
        "gemini"
    }

    fn modify_request(&self, url: &str, _headers: &mut HeaderMap, api_key: &str) -> String {
        let separator = if url.contains('?') { "&" } else { "?" };
        format!("{url}{separator}key={api_key}")
    }

    async fn validate_key(&self, client: &Client, base: &BaseChannel, api_key: &str) -> (bool, Option<String>) {
        let endpoint = base.validation_endpoint.clone().unwrap_or_else(|| {
            format!("https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent", base.test_model)
        });
        let url = format!("{endpoint}?key={api_key}");
        let body = serde_json::json!({ "contents": [{"parts": [{"text": "hi"}]}] });

        match client.post(url).json(&body).send().await {
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
