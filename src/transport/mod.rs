//! Messaging Transport Module
//!
//! Point-to-point delivery of [`ClusterMessage`]s plus a scatter-gather helper
//! used by dispatch, sync and profile fan-outs.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::membership::types::{Node, NodeId};

pub mod http;
pub mod protocol;

pub use protocol::{ClusterMessage, ClusterReply};

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, target: &Node, message: ClusterMessage) -> Result<ClusterReply>;
}

pub type SharedTransport = Arc<dyn Transport>;

/// Per-node results of a fan-out.
#[derive(Debug, Clone)]
pub struct FanOutResult<T> {
    pub successes: BTreeMap<NodeId, T>,
    pub failures: BTreeMap<NodeId, String>,
}

impl<T> Default for FanOutResult<T> {
    fn default() -> Self {
        Self {
            successes: BTreeMap::new(),
            failures: BTreeMap::new(),
        }
    }
}

/// Sends `message` to every target in parallel, each bounded by `timeout`.
///
/// A timeout, transport error, or unexpected reply lands in `failures`.
pub async fn fan_out<T, F>(
    transport: &dyn Transport,
    targets: &[Node],
    message: ClusterMessage,
    timeout: Duration,
    extract: F,
) -> FanOutResult<T>
where
    F: Fn(ClusterReply) -> Result<T>,
{
    let name = message.name();
    let calls = targets.iter().map(|node| {
        let message = message.clone();
        async move {
            let outcome = match tokio::time::timeout(timeout, transport.send(node, message)).await {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("no reply within {:?}", timeout)),
            };
            (node.id.clone(), outcome)
        }
    });

    let mut result = FanOutResult::default();
    for (node_id, outcome) in join_all(calls).await {
        match outcome.and_then(|reply| extract(reply).map_err(|e| e.to_string())) {
            Ok(value) => {
                result.successes.insert(node_id, value);
            }
            Err(error) => {
                tracing::warn!("{} to {} failed: {}", name, node_id, error);
                result.failures.insert(node_id, error);
            }
        }
    }
    result
}
