use serde::{Deserialize, Serialize};

/// One earlier screen description supplied by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentActivity {
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub description: String,
}

/// Inbound body of `POST /analyze-screenshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    /// Base64 image, bare or wrapped in a `data:image/...;base64,` envelope.
    pub screenshot: String,
    #[serde(default)]
    pub current_goal: Option<String>,
    /// Chronological, as supplied by the caller.
    #[serde(alias = "recentActivities")]
    pub recent_descriptions: Vec<RecentActivity>,
}

impl AnalysisRequest {
    /// The goal, if one was given and is not blank.
    pub fn goal(&self) -> Option<&str> {
        self.current_goal
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResponse {
    pub image_description: String,
    pub nudge: Option<String>,
    /// Epoch milliseconds at response assembly.
    pub timestamp: i64,
}
