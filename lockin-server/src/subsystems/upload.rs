//! Upload subsystem: stores raw screenshots sent by the desktop client
//!
//! Decodes the base64 payload, re-encodes it as PNG under the configured
//! screenshot directory, and records the file in the `screenshots` table.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Local, TimeZone, Utc};
use image::ImageFormat;
use lockin_core::models::ScreenshotUpload;
use sqlx::SqlitePool;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(i64),

    #[error("Invalid base64 image data: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Unreadable image: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Image encoding task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl UploadError {
    /// Faults caused by the uploaded payload rather than by the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            UploadError::InvalidTimestamp(_) | UploadError::Decode(_) | UploadError::Image(_)
        )
    }
}

/// Strip an optional `data:...;base64,` prefix and decode.
pub fn decode_image_data(image_data: &str) -> Result<Vec<u8>, UploadError> {
    let encoded = match image_data.split_once(',') {
        Some((_, rest)) => rest,
        None => image_data,
    };
    Ok(STANDARD.decode(encoded.trim())?)
}

/// `screenshot_YYYYMMDD_HHMMSS.png`, local time of capture.
pub fn screenshot_file_name(captured_at: DateTime<Utc>) -> String {
    format!(
        "screenshot_{}.png",
        captured_at.with_timezone(&Local).format("%Y%m%d_%H%M%S")
    )
}

/// Decode, save and record one upload. Returns the stored file path.
pub async fn store_upload(
    upload: ScreenshotUpload,
    pool: &SqlitePool,
    screenshot_dir: &Path,
) -> Result<String, UploadError> {
    let captured_at = Utc
        .timestamp_millis_opt(upload.timestamp)
        .single()
        .ok_or(UploadError::InvalidTimestamp(upload.timestamp))?;

    let bytes = decode_image_data(&upload.image_data)?;
    let png = tokio::task::spawn_blocking(move || reencode_png(&bytes)).await??;

    tokio::fs::create_dir_all(screenshot_dir).await?;
    let path: PathBuf = screenshot_dir.join(screenshot_file_name(captured_at));
    tokio::fs::write(&path, png).await?;

    let image_path = path.to_string_lossy().into_owned();
    let id = lockin_core::db::insert_screenshot(pool, captured_at, &image_path).await?;

    tracing::info!(id, path = %image_path, "Stored screenshot");
    Ok(image_path)
}

fn reencode_png(bytes: &[u8]) -> Result<Vec<u8>, image::ImageError> {
    let image = image::load_from_memory(bytes)?;
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

// ============================================================================
// TESTS
// ============================================================================
