use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inbound body of `POST /upload-screenshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenshotUpload {
    /// Epoch milliseconds of capture.
    pub timestamp: i64,
    pub image_data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScreenshotRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub image_path: String,
}
