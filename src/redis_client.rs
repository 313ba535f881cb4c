use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult};

/// Shared Redis handle.
///
/// Publishing goes through the multiplexed `ConnectionManager`, which reconnects on
/// its own. Pub/sub needs a dedicated connection per subscription, opened from `client`.
#[derive(Clone)]
pub struct RedisClient {
    client: Client,
    manager: ConnectionManager,
}

impl RedisClient {
    pub async fn from_url(url: &str) -> RedisResult<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, manager })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> RedisResult<()> {
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(channel, payload).await
    }
}
