//! Request/response polling relay
//!
//! A plain HTTP endpoint holding presence entries and per-peer inboxes:
//!
//! ```text
//! PUT    {base}/sessions/{code}/peers/{peer}         presence
//! DELETE {base}/sessions/{code}/peers/{peer}
//! GET    {base}/sessions/{code}/peers                [presence]
//! POST   {base}/sessions/{code}/inbox/{peer}         envelope
//! GET    {base}/sessions/{code}/inbox/{peer}         [{key, ...envelope}]
//! DELETE {base}/sessions/{code}/inbox/{peer}/{key}
//! ```

use super::mailbox::{Envelope, Mailbox, Presence, StoredEnvelope};
use super::TransportError;
use crate::session::SessionCode;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize)]
struct InboxItem {
    key: String,
    #[serde(flatten)]
    envelope: Envelope,
}

/// Mailbox served by a polling HTTP endpoint
pub struct HttpPollMailbox {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPollMailbox {
    pub fn new(base_url: String) -> Result<Self, TransportError> {
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(TransportError::Relay(format!(
                "relay URL must be http(s): {}",
                base_url
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(relay_error)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, code: &SessionCode, segments: &[&str]) -> String {
        let mut url = format!("{}/sessions/{}", self.base_url, code);
        for segment in segments {
            url.push('/');
            url.push_str(&urlencoding::encode(segment));
        }
        url
    }
}

pub(crate) fn relay_error(e: reqwest::Error) -> TransportError {
    TransportError::Relay(e.to_string())
}

/// Turn a non-success status into a relay error
pub(crate) async fn ensure_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        return Err(TransportError::Relay(format!("{}: {}", status.as_u16(), body)));
    }
    Ok(response)
}

#[async_trait]
impl Mailbox for HttpPollMailbox {
    async fn announce(
        &self,
        code: &SessionCode,
        presence: &Presence,
    ) -> Result<(), TransportError> {
        let response = self
            .client
            .put(self.url(code, &["peers", &presence.peer_id]))
            .json(presence)
            .send()
            .await
            .map_err(relay_error)?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn withdraw(&self, code: &SessionCode, peer_id: &str) -> Result<(), TransportError> {
        let response = self
            .client
            .delete(self.url(code, &["peers", peer_id]))
            .send()
            .await
            .map_err(relay_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        ensure_success(response).await?;
        Ok(())
    }

    async fn peers(&self, code: &SessionCode) -> Result<Vec<Presence>, TransportError> {
        let response = self
            .client
            .get(self.url(code, &["peers"]))
            .send()
            .await
            .map_err(relay_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = ensure_success(response).await?;
        response.json().await.map_err(relay_error)
    }

    async fn post(
        &self,
        code: &SessionCode,
        to: &str,
        envelope: &Envelope,
    ) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.url(code, &["inbox", to]))
            .json(envelope)
            .send()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn fetch(
        &self,
        code: &SessionCode,
        peer_id: &str,
    ) -> Result<Vec<StoredEnvelope>, TransportError> {
        let response = self
            .client
            .get(self.url(code, &["inbox", peer_id]))
            .send()
            .await
            .map_err(relay_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = ensure_success(response).await?;
        let items: Vec<InboxItem> = response.json().await.map_err(relay_error)?;
        Ok(items
            .into_iter()
            .map(|item| StoredEnvelope {
                key: item.key,
                envelope: item.envelope,
            })
            .collect())
    }

    async fn remove(
        &self,
        code: &SessionCode,
        peer_id: &str,
        key: &str,
    ) -> Result<(), TransportError> {
        let response = self
            .client
            .delete(self.url(code, &["inbox", peer_id, key]))
            .send()
            .await
            .map_err(relay_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        ensure_success(response).await?;
        Ok(())
    }
}
