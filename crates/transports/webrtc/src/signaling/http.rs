//! Client for the signaling relay server

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::{Mailbox, SignalingMessage};
use crate::session::ParticipantId;
use crate::{Error, Result};

/// Body of a `202 Accepted` reply to `POST /v1/messages`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub id: Uuid,
}

/// Body of a reply to `POST /v1/participants/{id}/poll`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PollResponse {
    pub messages: Vec<SignalingMessage>,
}

/// Error body returned by the relay for rejected requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Mailbox living on a remote relay server
#[derive(Debug, Clone)]
pub struct HttpMailbox {
    client: reqwest::Client,
    base: Url,
}

impl HttpMailbox {
    /// Client for the relay at `relay_url` (e.g. `http://localhost:8080`)
    pub fn new(relay_url: &str) -> Result<Self> {
        Self::with_timeout(relay_url, Duration::from_secs(10))
    }

    pub fn with_timeout(relay_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(relay_url)
            .map_err(|e| Error::InvalidConfig(format!("invalid relay url {}: {}", relay_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(Error::InvalidConfig(format!(
                "relay url {} cannot be used as a base",
                relay_url
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::SignalingError(format!("failed to build http client: {}", e)))?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidConfig(format!("relay url {} cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

async fn relay_error(response: reqwest::Response) -> Error {
    let status = response.status();
    let detail = match response.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => status.canonical_reason().unwrap_or("unknown").to_string(),
    };
    match status {
        StatusCode::BAD_REQUEST => Error::ProtocolError(format!("relay rejected message: {}", detail)),
        _ => Error::SignalingError(format!("relay returned {}: {}", status, detail)),
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    Error::SignalingError(format!("relay unreachable: {}", e))
}

#[async_trait]
impl Mailbox for HttpMailbox {
    async fn push(&self, message: SignalingMessage) -> Result<()> {
        let url = self.endpoint(&["v1", "messages"])?;
        let response = self
            .client
            .post(url)
            .json(&message)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(relay_error(response).await);
        }
        debug!("Relay accepted {} {}", message.kind(), message.id);
        Ok(())
    }

    async fn drain(&self, recipient: &ParticipantId, limit: usize) -> Result<Vec<SignalingMessage>> {
        let mut url = self.endpoint(&["v1", "participants", recipient.as_str(), "poll"])?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string());

        let response = self
            .client
            .post(url)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(relay_error(response).await);
        }
        let body: PollResponse = response
            .json()
            .await
            .map_err(|e| Error::SignalingError(format!("unreadable poll response: {}", e)))?;
        Ok(body.messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_encodes_participant() {
        let mailbox = HttpMailbox::new("http://relay.local:8080/").unwrap();
        let url = mailbox
            .endpoint(&["v1", "participants", "psych 1/a", "poll"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://relay.local:8080/v1/participants/psych%201%2Fa/poll"
        );
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let mailbox = HttpMailbox::new("https://campus.example/signaling").unwrap();
        let url = mailbox.endpoint(&["v1", "messages"]).unwrap();
        assert_eq!(url.as_str(), "https://campus.example/signaling/v1/messages");
    }

    #[test]
    fn test_invalid_relay_url() {
        assert!(matches!(
            HttpMailbox::new("not a url"),
            Err(Error::InvalidConfig(_))
        ));
        assert!(HttpMailbox::new("mailto:ops@campus.example").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_signaling_error() {
        // Port 9 (discard) is closed on loopback in test environments
        let mailbox =
            HttpMailbox::with_timeout("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = mailbox.drain(&"bob".into(), 10).await.unwrap_err();
        assert!(matches!(err, Error::SignalingError(_)));
    }
}
