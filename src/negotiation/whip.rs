use crate::error::NegotiationError;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use std::time::Duration;
use tracing::{info, warn};

pub const SESSION_ID_HEADER: &str = "X-Session-ID";

/// Result of a successful WHIP exchange
#[derive(Debug, Clone)]
pub struct WhipAnswer {
    pub sdp: String,
    /// Session id assigned by the media server, when it echoes one
    pub session_id: Option<String>,
    /// WHIP resource URL
    pub location: Option<String>,
}

/// Single-shot WHIP client: one POST carrying the complete offer
pub struct WhipClient {
    http: reqwest::Client,
    url: String,
}

impl WhipClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NegotiationError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NegotiationError::WhipUnreachable(e.to_string()))?;

        Ok(Self {
            http,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn post_offer(
        &self,
        session_id: &str,
        offer_sdp: &str,
    ) -> Result<WhipAnswer, NegotiationError> {
        info!("Posting offer to {} ({} bytes)", self.url, offer_sdp.len());

        let response = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, "application/sdp")
            .header(SESSION_ID_HEADER, session_id)
            .body(offer_sdp.to_string())
            .send()
            .await
            .map_err(|e| NegotiationError::WhipUnreachable(e.to_string()))?;

        let status = response.status();
        let assigned = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response
            .text()
            .await
            .map_err(|e| NegotiationError::WhipUnreachable(e.to_string()))?;

        if !status.is_success() {
            warn!("WHIP endpoint returned {}: {}", status, body);
            return Err(NegotiationError::SignalingRejected {
                status: status.as_u16(),
                body,
            });
        }

        info!("WHIP answer received ({} bytes)", body.len());

        Ok(WhipAnswer {
            sdp: body,
            session_id: assigned,
            location,
        })
    }
}
