//! HTTP binding to cafes that publish a URL.
//!
//! Envelopes are posted as bincode to `{url}/cafe/v1/service`; the sender's
//! peer id travels in the `x-loom-peer` header so the cafe can verify the
//! signature before decoding further. An empty `204` answers a
//! fire-and-forget message.

use std::time::Duration;

use reqwest::StatusCode;
use tracing::debug;

use loom_shared::constants::{CAFE_API_VERSION, REQUEST_TIMEOUT_SECS};
use loom_shared::protocol::Envelope;
use loom_shared::types::PeerId;

use crate::network::NetError;

pub const PEER_HEADER: &str = "x-loom-peer";

#[derive(Clone)]
pub struct HttpLink {
    client: reqwest::Client,
}

impl HttpLink {
    pub fn new() -> Result<Self, NetError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client })
    }

    pub fn service_url(base_url: &str) -> String {
        format!(
            "{}/cafe/{}/service",
            base_url.trim_end_matches('/'),
            CAFE_API_VERSION
        )
    }

    /// Post an envelope and decode the optional response envelope.
    pub async fn post(
        &self,
        base_url: &str,
        from: &PeerId,
        envelope: &Envelope,
    ) -> Result<Option<Envelope>, NetError> {
        let url = Self::service_url(base_url);
        let body = envelope.to_bytes()?;

        let resp = self
            .client
            .post(&url)
            .header(PEER_HEADER, from.to_hex())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        debug!(url = %url, status = %status, kind = envelope.payload().kind(), "cafe service call");

        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(NetError::Http(format!("cafe answered {status}")));
        }

        let bytes = resp.bytes().await?;
        Ok(Some(Envelope::from_bytes(&bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_url_ignores_trailing_slash() {
        assert_eq!(
            HttpLink::service_url("https://cafe.example.org/"),
            "https://cafe.example.org/cafe/v1/service"
        );
        assert_eq!(
            HttpLink::service_url("http://127.0.0.1:8080"),
            "http://127.0.0.1:8080/cafe/v1/service"
        );
    }
}
