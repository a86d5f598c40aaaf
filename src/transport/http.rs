use async_trait::async_trait;
use std::time::Duration;

use super::protocol::{
    ClusterMessage, ClusterReply, ENDPOINT_INTERNAL_FORWARD, ENDPOINT_INTERNAL_LOAD,
    ENDPOINT_INTERNAL_PROFILE, ENDPOINT_INTERNAL_SYNC, ENDPOINT_INTERNAL_UNLOAD,
};
use super::Transport;
use crate::error::Result;
use crate::http::RetryingClient;
use crate::membership::types::Node;
use crate::sync::types::SyncRequest;

/// Transport over the internal HTTP endpoints of each node.
pub struct HttpTransport {
    client: RetryingClient,
    forward_attempts: usize,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration, forward_attempts: usize) -> Self {
        Self {
            client: RetryingClient::new(request_timeout),
            forward_attempts,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, target: &Node, message: ClusterMessage) -> Result<ClusterReply> {
        let base = format!("http://{}", target.http_addr);
        tracing::debug!("Sending {} to {} at {}", message.name(), target.id, base);

        match message {
            ClusterMessage::LoadModel(input) => {
                let url = format!("{}{}", base, ENDPOINT_INTERNAL_LOAD);
                Ok(ClusterReply::Ack(self.client.post_json(&url, &input, 1).await?))
            }
            ClusterMessage::UnloadModel(input) => {
                let url = format!("{}{}", base, ENDPOINT_INTERNAL_UNLOAD);
                Ok(ClusterReply::Ack(self.client.post_json(&url, &input, 1).await?))
            }
            ClusterMessage::Forward(input) => {
                // idempotent at the coordinator
                let url = format!("{}{}", base, ENDPOINT_INTERNAL_FORWARD);
                let ack = self
                    .client
                    .post_json(&url, &input, self.forward_attempts)
                    .await?;
                Ok(ClusterReply::Ack(ack))
            }
            ClusterMessage::SyncUp => {
                let url = format!("{}{}", base, ENDPOINT_INTERNAL_SYNC);
                let state = self
                    .client
                    .post_json(&url, &SyncRequest::default(), 1)
                    .await?;
                Ok(ClusterReply::SyncState(state))
            }
            ClusterMessage::Profile(filter) => {
                let url = format!("{}{}", base, ENDPOINT_INTERNAL_PROFILE);
                Ok(ClusterReply::Profile(self.client.post_json(&url, &filter, 1).await?))
            }
        }
    }
}
