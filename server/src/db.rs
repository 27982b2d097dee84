use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

#[derive(Clone)]
pub struct Postgre {
    pub pool: PgPool,
}

impl Postgre {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Database migrations complete");

        Ok(Self { pool })
    }
}
