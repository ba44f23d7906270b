pub mod error;

pub use error::{BrowserlessError, Result};

use std::time::Duration;

use serde::Deserialize;

pub struct BrowserlessClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

/// Load snapshot reported by `GET /pressure`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pressure {
    pub is_available: bool,
    #[serde(default)]
    pub queued: u32,
    #[serde(default)]
    pub running: u32,
    pub max_concurrent: u32,
    #[serde(default)]
    pub max_queued: u32,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl Pressure {
    /// Sessions that can still be opened without queueing.
    pub fn free_slots(&self) -> u32 {
        self.max_concurrent.saturating_sub(self.running)
    }
}

#[derive(Deserialize)]
struct PressureEnvelope {
    pressure: Pressure,
}

impl BrowserlessClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BrowserlessError::Network {
                endpoint: base_url.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
        })
    }

    /// DevTools websocket endpoint a CDP client connects to.
    /// `http` becomes `ws`, `https` becomes `wss`, the token rides in the query.
    pub fn devtools_endpoint(&self) -> Result<String> {
        let mut url = url::Url::parse(&self.base_url).map_err(|e| BrowserlessError::InvalidUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(BrowserlessError::InvalidUrl {
                    url: self.base_url.clone(),
                    reason: format!("unsupported scheme {other}"),
                })
            }
        };
        url.set_scheme(scheme).map_err(|_| BrowserlessError::InvalidUrl {
            url: self.base_url.clone(),
            reason: "cannot rewrite scheme".to_string(),
        })?;

        if let Some(ref token) = self.token {
            url.query_pairs_mut().append_pair("token", token);
        }

        Ok(url.to_string())
    }

    /// Fetch the current load snapshot from the `/pressure` endpoint.
    pub async fn pressure(&self) -> Result<Pressure> {
        let mut endpoint = format!("{}/pressure", self.base_url);
        if let Some(ref token) = self.token {
            endpoint.push_str(&format!("?token={token}"));
        }

        let resp = self
            .client
            .get(&endpoint)
            .send()
            .await
            .map_err(|e| BrowserlessError::Network {
                endpoint: format!("{}/pressure", self.base_url),
                message: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BrowserlessError::Api {
                endpoint: "/pressure".to_string(),
                status: status.as_u16(),
                message,
            });
        }

        let envelope: PressureEnvelope = resp
            .json()
            .await
            .map_err(|e| BrowserlessError::Decode(e.to_string()))?;
        tracing::debug!(
            running = envelope.pressure.running,
            max_concurrent = envelope.pressure.max_concurrent,
            queued = envelope.pressure.queued,
            "Browserless pressure"
        );
        Ok(envelope.pressure)
    }
}
