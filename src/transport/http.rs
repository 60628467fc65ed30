//! One-shot HTTP transport
//!
//! Every delivery builds its own client, POSTs the envelope and drops the
//! client before returning. Readiness is the link state only.

use async_trait::async_trait;
use std::time::Duration;
use telemetry_shared::LinkState;
use tokio::sync::watch;
use tracing::{debug, info};

use super::traits::{DeliveryError, Transport};
use crate::config::HttpConfig;

pub struct HttpTransport {
    url: String,
    timeout: Duration,
    link: watch::Receiver<LinkState>,
}

impl HttpTransport {
    pub fn new(config: &HttpConfig, link: watch::Receiver<LinkState>) -> Self {
        Self {
            url: config.url.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            link,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, body: &[u8]) -> Result<(), DeliveryError> {
        let link = *self.link.borrow();
        if link != LinkState::Connected {
            return Err(DeliveryError::InvalidState(format!("link {link}")));
        }

        let client = reqwest::Client::builder().timeout(self.timeout).build()?;

        info!("Sending HTTP POST to {}", self.url);
        let response = client
            .post(&self.url)
            .body(body.to_vec())
            .send()
            .await?;

        let status = response.status();
        debug!("HTTP status = {}", status.as_u16());
        if !status.is_success() {
            return Err(DeliveryError::Status(status.as_u16()));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "HTTP"
    }
}
