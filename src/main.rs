use anyhow::Context;
use messaging_core::{
    config::Config,
    db, logging,
    realtime::pubsub::RedisChangeFeed,
    redis_client::RedisClient,
    services::{Backends, ChatSession, SessionView},
    store::{
        memory::{MemoryBlobStore, MemoryRemoteStore},
        postgres::PgRemoteStore,
        s3::S3BlobStore,
        BlobStore,
    },
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();
    let cfg = Config::from_env()?;
    let me = cfg.participant()?;

    let backends = match &cfg.database_url {
        Some(database_url) => connect(&cfg, database_url).await?,
        None => {
            tracing::warn!("DATABASE_URL not set, running against the in-memory store");
            let store = Arc::new(MemoryRemoteStore::new());
            Backends {
                feed: Arc::new(store.feed()),
                remote: store,
                blobs: Arc::new(MemoryBlobStore::new()),
            }
        }
    };

    let mut session = ChatSession::start(me, cfg.business_id, backends, cfg.session())
        .await
        .context("start session")?;
    for preview in session.view().conversations {
        tracing::info!(
            conversation_id = %preview.id,
            title = %preview.title,
            unread = preview.unread_count,
            "conversation"
        );
    }
    if let Some(conversation_id) = cfg.active_conversation {
        session
            .select_conversation(conversation_id)
            .await
            .with_context(|| format!("select conversation {conversation_id}"))?;
    }

    let mut last = session.view();
    report(&last);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = session.run_once() => {
                let view = session.view();
                if view != last {
                    report(&view);
                    last = view;
                }
            }
        }
    }

    session.close().await;
    Ok(())
}

async fn connect(cfg: &Config, database_url: &str) -> anyhow::Result<Backends> {
    let pool = db::init_pool(database_url, cfg.db_max_connections)
        .await
        .context("db")?;
    let redis = RedisClient::from_url(&cfg.redis_url).await.context("redis")?;

    let blobs: Arc<dyn BlobStore> = match &cfg.s3 {
        Some(s3) => Arc::new(S3BlobStore::from_config(s3.clone()).await),
        None => {
            tracing::warn!("S3_BUCKET not set, attachments are kept in memory");
            Arc::new(MemoryBlobStore::new())
        }
    };

    Ok(Backends {
        remote: Arc::new(PgRemoteStore::new(pool, Some(redis.clone()))),
        feed: Arc::new(RedisChangeFeed::new(redis, cfg.feed_reconnect)),
        blobs,
    })
}

fn report(view: &SessionView) {
    tracing::info!(
        conversations = view.conversations.len(),
        active = ?view.active_conversation,
        messages = view.messages.len(),
        typing = view.typing_users.len(),
        unread = view.total_unread,
        error = ?view.error,
        "view updated"
    );
    if let Ok(json) = serde_json::to_string(view) {
        tracing::debug!(%json, "view");
    }
}
