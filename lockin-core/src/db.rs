use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::config::StorageConfig;
use crate::models::ScreenshotRecord;

pub async fn create_pool(config: &StorageConfig) -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
}

pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS screenshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            image_path TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn health_check(pool: &SqlitePool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT sqlite_version()")
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

pub async fn insert_screenshot(
    pool: &SqlitePool,
    timestamp: DateTime<Utc>,
    image_path: &str,
) -> Result<i64, sqlx::Error> {
    let result = sqlx::query("INSERT INTO screenshots (timestamp, image_path) VALUES (?, ?)")
        .bind(timestamp)
        .bind(image_path)
        .execute(pool)
        .await?;
    Ok(result.last_insert_rowid())
}

pub async fn list_screenshots(pool: &SqlitePool) -> Result<Vec<ScreenshotRecord>, sqlx::Error> {
    sqlx::query_as::<_, ScreenshotRecord>(
        "SELECT id, timestamp, image_path FROM screenshots ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await
}
