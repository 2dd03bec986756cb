use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use std::time::Duration;

use crate::error::AppResult;

/// Pub/sub channel carrying room fan-out between server instances.
pub const FANOUT_CHANNEL: &str = "chat:fanout";

#[derive(Clone)]
pub struct RedisClient {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisClient {
    pub async fn new(url: &str) -> AppResult<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, conn })
    }

    // User presence
    pub async fn set_user_presence(
        &self,
        user_id: &str,
        status: &str,
        ttl: Duration,
    ) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let key = format!("presence:{}", user_id);
        let _: () = conn.set_ex(&key, status, ttl.as_secs()).await?;
        Ok(())
    }

    // Pub/Sub for room fan-out
    pub async fn publish_fanout(&self, payload: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(FANOUT_CHANNEL, payload).await?;
        Ok(())
    }

    pub async fn subscribe_fanout(&self) -> AppResult<redis::aio::PubSub> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(FANOUT_CHANNEL).await?;
        Ok(pubsub)
    }
}
