use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_user_id INTEGER NOT NULL,
        to_user_id INTEGER NOT NULL,
        entity_id INTEGER NOT NULL,
        text TEXT NOT NULL CHECK (length(text) > 0),
        created_at DATETIME NOT NULL,
        is_read BOOLEAN NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS messages_pair ON messages (from_user_id, to_user_id)",
    "CREATE INDEX IF NOT EXISTS messages_unread ON messages (to_user_id, is_read)",
];

pub async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

pub async fn init_schema(db_pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(db_pool).await?;
    }
    Ok(())
}

/// In-memory database with the schema applied. One connection, since every
/// `:memory:` connection is its own database.
pub async fn memory_pool() -> Result<SqlitePool, sqlx::Error> {
    let db_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    init_schema(&db_pool).await?;
    Ok(db_pool)
}
