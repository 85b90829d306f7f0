use crate::config::AppConfig;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Schema,
};
use std::time::Duration;
use tracing::{info, warn};

/// Type alias for a database connection pool
pub type DbPool = DatabaseConnection;

/// Establishes a connection pool to the database.
pub async fn connect(config: &AppConfig) -> Result<DbPool, DbErr> {
    let mut opts = ConnectOptions::new(config.database_url.clone());
    opts.max_connections(config.db_max_connections)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .acquire_timeout(Duration::from_secs(8))
        .sqlx_logging(false);

    let db = Database::connect(opts).await?;
    info!("Database connection established");
    Ok(db)
}

/// Creates all tables from the entity definitions if they do not exist.
///
/// Used for sqlite/development and by the integration tests; production
/// deployments manage schema through external migrations.
pub async fn ensure_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    macro_rules! create_table {
        ($entity:expr) => {{
            let mut stmt = schema.create_table_from_entity($entity);
            stmt.if_not_exists();
            if let Err(e) = db.execute(backend.build(&stmt)).await {
                warn!("Schema bootstrap statement failed: {}", e);
                return Err(e);
            }
        }};
    }

    create_table!(crate::entities::Order);
    create_table!(crate::entities::OrderItem);
    create_table!(crate::entities::OrderActivity);
    create_table!(crate::entities::OrderNote);
    create_table!(crate::entities::Coupon);
    create_table!(crate::entities::ProductVariant);
    create_table!(crate::entities::WebhookEvent);

    info!("Database schema ensured");
    Ok(())
}
