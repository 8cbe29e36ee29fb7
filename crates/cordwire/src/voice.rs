use std::collections::HashMap;

use cordwire_media::{VoiceConnection, VoiceConnectionState};
use cordwire_util::GuildId;
use tokio::sync::RwLock;

/// Voice connections of one session, at most one per guild.
#[derive(Debug, Default)]
pub struct VoiceRegistry {
    connections: RwLock<HashMap<GuildId, VoiceConnection>>,
}

impl VoiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The guild's connection, unless it has already closed.
    pub async fn get(&self, guild_id: GuildId) -> Option<VoiceConnection> {
        let connections = self.connections.read().await;
        connections
            .get(&guild_id)
            .filter(|c| c.state() != VoiceConnectionState::Closed)
            .cloned()
    }

    /// Track `connection`, shutting down whatever it replaces.
    pub async fn insert(&self, connection: VoiceConnection) {
        let guild_id = connection.guild_id();
        let previous = {
            let mut connections = self.connections.write().await;
            connections.retain(|_, c| c.state() != VoiceConnectionState::Closed);
            connections.insert(guild_id, connection)
        };
        if let Some(previous) = previous {
            tracing::debug!(%guild_id, "replacing voice connection");
            previous.shutdown();
        }
    }

    pub async fn remove(&self, guild_id: GuildId) -> Option<VoiceConnection> {
        self.connections.write().await.remove(&guild_id)
    }

    pub async fn drain(&self) -> Vec<VoiceConnection> {
        self.connections
            .write()
            .await
            .drain()
            .map(|(_, connection)| connection)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}
