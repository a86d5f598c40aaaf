//! Node-to-node message envelope and the internal endpoints that carry it.

use serde::{Deserialize, Serialize};

use crate::dispatch::protocol::{ForwardInput, LoadModelInput, NodeAck, UnloadModelInput};
use crate::error::{ClusterError, Result};
use crate::profile::types::{NodeProfile, ProfileFilter};
use crate::sync::types::SyncState;

pub const ENDPOINT_INTERNAL_LOAD: &str = "/internal/load";
pub const ENDPOINT_INTERNAL_UNLOAD: &str = "/internal/unload";
pub const ENDPOINT_INTERNAL_FORWARD: &str = "/internal/forward";
pub const ENDPOINT_INTERNAL_SYNC: &str = "/internal/sync";
pub const ENDPOINT_INTERNAL_PROFILE: &str = "/internal/profile";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterMessage {
    LoadModel(LoadModelInput),
    UnloadModel(UnloadModelInput),
    Forward(ForwardInput),
    SyncUp,
    Profile(ProfileFilter),
}

impl ClusterMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ClusterMessage::LoadModel(_) => "load_model",
            ClusterMessage::UnloadModel(_) => "unload_model",
            ClusterMessage::Forward(_) => "forward",
            ClusterMessage::SyncUp => "sync_up",
            ClusterMessage::Profile(_) => "profile",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterReply {
    Ack(NodeAck),
    SyncState(SyncState),
    Profile(NodeProfile),
}

impl ClusterReply {
    pub fn into_ack(self) -> Result<NodeAck> {
        match self {
            ClusterReply::Ack(ack) => Ok(ack),
            other => Err(unexpected("ack", &other)),
        }
    }

    pub fn into_sync_state(self) -> Result<SyncState> {
        match self {
            ClusterReply::SyncState(state) => Ok(state),
            other => Err(unexpected("sync state", &other)),
        }
    }

    pub fn into_profile(self) -> Result<NodeProfile> {
        match self {
            ClusterReply::Profile(profile) => Ok(profile),
            other => Err(unexpected("profile", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &ClusterReply) -> ClusterError {
    ClusterError::Messaging(format!("expected {} reply, got {:?}", expected, got))
}
