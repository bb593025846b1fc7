use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Proxy, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::config::Config;
use crate::error::{NetworkError, Result};

pub struct HttpClient {
    client: Client,
    config: Config,
}

impl HttpClient {
    pub fn new(config: Config) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| NetworkError::Config(format!("Invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| NetworkError::Config(format!("Invalid header value: {}", e)))?;
            headers.insert(name, value);
        }

        let mut builder = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs));

        if let Some(socks_addr) = &config.socks_addr {
            // socks5h resolves hostnames on the proxy side
            let proxy_url = format!("socks5h://{}", socks_addr);
            let proxy = Proxy::all(&proxy_url)
                .map_err(|e| NetworkError::Config(format!("Invalid proxy URL: {}", e)))?;
            builder = builder.proxy(proxy);
        }

        if !config.verify_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| NetworkError::Config(format!("Failed to build client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        debug!("GET {}", url);
        self.client
            .get(url)
            .send()
            .await
            .map_err(|e| NetworkError::Http(format!("GET request failed: {}", e)))
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.get(url).await?;
        Self::decode(response).await
    }

    pub async fn post<T: Serialize>(&self, url: &str, body: &T) -> Result<Response> {
        debug!("POST {}", url);
        self.client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| NetworkError::Http(format!("POST request failed: {}", e)))
    }

    pub async fn post_json<T: Serialize, R: DeserializeOwned>(&self, url: &str, body: &T) -> Result<R> {
        let response = self.post(url, body).await?;
        Self::decode(response).await
    }

    /// Decodes a JSON body, turning non-2xx answers into [`NetworkError::Api`]
    /// with the server's `error` field as the message.
    async fn decode<R: DeserializeOwned>(response: Response) -> Result<R> {
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or(text);
            return Err(NetworkError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| NetworkError::Http(format!("JSON parse failed: {}", e)))
    }

    pub async fn verify_tor_connection(&self) -> Result<bool> {
        if !self.config.is_proxied() {
            return Err(NetworkError::TorNotAvailable);
        }

        let json: serde_json::Value = self
            .get_json("https://check.torproject.org/api/ip")
            .await?;

        Ok(json.get("IsTor").and_then(|v| v.as_bool()).unwrap_or(false))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
