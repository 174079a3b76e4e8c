//! Realtime cloud store relay
//!
//! Uses a hosted realtime database through its REST interface as the
//! mailbox. Paths end in `.json`, the credential rides in `?auth=`, a POST
//! creates a child under a server-generated key (`{"name": key}`), and an
//! absent node reads back as `null`.

use super::http_poll::{ensure_success, relay_error};
use super::mailbox::{Envelope, Mailbox, Presence, StoredEnvelope};
use super::TransportError;
use crate::session::SessionCode;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct PushResponse {
    name: String,
}

/// Mailbox kept in a realtime cloud database
pub struct CloudStoreMailbox {
    client: reqwest::Client,
    base_url: String,
    auth: Option<String>,
}

impl CloudStoreMailbox {
    pub fn new(base_url: String, auth: Option<String>) -> Result<Self, TransportError> {
        if !base_url.starts_with("https://") && !base_url.starts_with("http://") {
            return Err(TransportError::Relay(format!(
                "cloud store URL must be http(s): {}",
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
            auth,
        })
    }

    fn url(&self, code: &SessionCode, segments: &[&str]) -> String {
        let mut url = format!("{}/sessions/{}", self.base_url, code);
        for segment in segments {
            url.push('/');
            url.push_str(&urlencoding::encode(segment));
        }
        url.push_str(".json");
        if let Some(auth) = &self.auth {
            url.push_str("?auth=");
            url.push_str(&urlencoding::encode(auth));
        }
        url
    }

    async fn delete(&self, url: String) -> Result<(), TransportError> {
        let response = self.client.delete(url).send().await.map_err(relay_error)?;
        ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl Mailbox for CloudStoreMailbox {
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
        self.delete(self.url(code, &["peers", peer_id])).await?;
        self.delete(self.url(code, &["inbox", peer_id])).await
    }

    async fn peers(&self, code: &SessionCode) -> Result<Vec<Presence>, TransportError> {
        let response = self
            .client
            .get(self.url(code, &["peers"]))
            .send()
            .await
            .map_err(relay_error)?;
        let response = ensure_success(response).await?;
        let peers: Option<HashMap<String, Presence>> =
            response.json().await.map_err(relay_error)?;
        Ok(peers.map(|p| p.into_values().collect()).unwrap_or_default())
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
        let response = ensure_success(response).await?;
        let pushed: PushResponse = response.json().await.map_err(relay_error)?;
        tracing::trace!("Posted envelope {} to {}", pushed.name, to);
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
        let response = ensure_success(response).await?;
        let inbox: Option<HashMap<String, Envelope>> =
            response.json().await.map_err(relay_error)?;
        Ok(inbox
            .unwrap_or_default()
            .into_iter()
            .map(|(key, envelope)| StoredEnvelope { key, envelope })
            .collect())
    }

    async fn remove(
        &self,
        code: &SessionCode,
        peer_id: &str,
        key: &str,
    ) -> Result<(), TransportError> {
        self.delete(self.url(code, &["inbox", peer_id, key])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_end_in_json_with_auth() {
        let store = CloudStoreMailbox::new(
            "https://replay-demo.example.com/".to_string(),
            Some("tok en".to_string()),
        )
        .unwrap();
        let code: SessionCode = "ABCDEF".parse().unwrap();

        assert_eq!(
            store.url(&code, &["inbox", "camera"]),
            "https://replay-demo.example.com/sessions/ABCDEF/inbox/camera.json?auth=tok%20en"
        );
    }

    #[test]
    fn test_paths_without_auth() {
        let store =
            CloudStoreMailbox::new("https://replay-demo.example.com".to_string(), None).unwrap();
        let code: SessionCode = "ABCDEF".parse().unwrap();
        assert_eq!(
            store.url(&code, &["peers"]),
            "https://replay-demo.example.com/sessions/ABCDEF/peers.json"
        );
    }

    #[test]
    fn test_null_node_reads_as_empty() {
        let inbox: Option<HashMap<String, Envelope>> = serde_json::from_str("null").unwrap();
        assert!(inbox.is_none());

        let pushed: PushResponse = serde_json::from_str(r#"{"name":"-Nabc"}"#).unwrap();
        assert_eq!(pushed.name, "-Nabc");
    }
}
