//! JSON-over-HTTPS plumbing shared by the provider clients

use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{api} API unreachable: {source}")]
    Transport {
        api: &'static str,
        #[source]
        source: reqwest::Error,
    },
    /// Keeps the numeric status in the text so failover can classify it
    #[error("{api} API error (status {status}): {body}")]
    Status {
        api: &'static str,
        status: u16,
        body: String,
    },
    #[error("{api} API returned an unreadable body: {source}")]
    Decode {
        api: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

/// One upstream API: base URL, auth headers and a label for errors
pub struct ApiClient {
    client: Client,
    api: &'static str,
    base_url: String,
    headers: Vec<(&'static str, String)>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let header_names: Vec<&str> = self.headers.iter().map(|(name, _)| *name).collect();
        f.debug_struct("ApiClient")
            .field("api", &self.api)
            .field("base_url", &self.base_url)
            .field("headers", &header_names)
            .finish()
    }
}

impl ApiClient {
    pub fn new(api: &'static str, base_url: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            client,
            api,
            base_url: base_url.trim_end_matches('/').to_string(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = self.client.post(format!("{}{}", self.base_url, path)).json(body);
        for (name, value) in &self.headers {
            request = request.header(*name, value);
        }

        let response = request.send().await.map_err(|source| ApiError::Transport {
            api: self.api,
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                api: self.api,
                status: status.as_u16(),
                body,
            });
        }

        response.json().await.map_err(|source| ApiError::Decode {
            api: self.api,
            source,
        })
    }
}
