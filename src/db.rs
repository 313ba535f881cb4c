use crate::error::AppError;
use deadpool_postgres::{Manager, Pool};
use tokio_postgres::NoTls;

const SCHEMA: &str = include_str!("../migrations/0001_messaging_core.sql");

/// Build the pool and make sure the schema exists
pub async fn init_pool(database_url: &str, max_connections: usize) -> Result<Pool, AppError> {
    let config = database_url
        .parse::<tokio_postgres::Config>()
        .map_err(|e| AppError::Config(format!("DATABASE_URL: {e}")))?;

    let manager = Manager::new(config, NoTls);
    let pool = Pool::builder(manager)
        .max_size(max_connections)
        .build()
        .map_err(|e| AppError::Config(format!("db pool: {e}")))?;

    let client = pool.get().await?;
    client.batch_execute(SCHEMA).await?;
    tracing::info!(max_connections, "database pool ready");
    Ok(pool)
}
