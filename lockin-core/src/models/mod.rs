pub mod analysis;
pub mod screenshot;

pub use analysis::{AnalysisRequest, AnalysisResponse, RecentActivity};
pub use screenshot::{ScreenshotRecord, ScreenshotUpload};
