//! Reachability probing of subscriber and upstream endpoints.

use crate::core::ReachabilityProber;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Sends an `OPTIONS` request and reports the status code it got back.
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ReachabilityProber for HttpProber {
    async fn probe(&self, url: &str) -> u16 {
        match self.client.request(Method::OPTIONS, url).send().await {
            Ok(response) => response.status().as_u16(),
            Err(e) => {
                debug!(url, error = %e, "Probe request could not be sent");
                StatusCode::BAD_REQUEST.as_u16()
            }
        }
    }
}
