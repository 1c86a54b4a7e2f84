//! Analysis pipeline — screenshot description, then an optional nudge decision
//!
//! Stage 1 asks the vision model what is on screen. Stage 2 runs only when the
//! request carries a goal and asks the reasoning model whether the user needs a
//! nudge. Both stages go through the [`ResilientExecutor`]; a stage that still
//! fails is degraded (fallback text / no nudge) and never fails the request.

use std::sync::Arc;

use chrono::{Local, TimeZone, Utc};
use thiserror::Error;

use crate::llm::LanguageModel;
use crate::models::{AnalysisRequest, AnalysisResponse, RecentActivity};
use crate::retry::{ResilientExecutor, RetryPolicy};

/// Substituted for the description when stage 1 fails.
pub const DESCRIPTION_FALLBACK: &str =
    "Screen analysis is temporarily unavailable. Unable to describe the current screen.";

/// Rendered in place of the activity block when there is no history.
pub const NO_RECENT_ACTIVITY: &str = "No recent activities.";

/// Reasoning-model answer meaning "no nudge".
pub const NO_NUDGE_SENTINEL: &str = "null";

pub const DEFAULT_MEDIA_TYPE: &str = "image/png";

const NUDGE_SYSTEM_PROMPT: &str = "You are a helpful AI assistant that helps users stay focused on their goals. \
Analyze the user's recent activities and current screen to determine if they need a gentle nudge \
to stay on track with their current goal. If they are on track, return null. \
If they need a nudge, provide a brief, friendly message.";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Two-stage screenshot analysis over an injected [`LanguageModel`].
pub struct AnalysisPipeline {
    model: Arc<dyn LanguageModel>,
    executor: ResilientExecutor,
    ignored_window: String,
}

impl AnalysisPipeline {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        policy: RetryPolicy,
        ignored_window: impl Into<String>,
    ) -> Self {
        Self {
            model,
            executor: ResilientExecutor::new(policy),
            ignored_window: ignored_window.into(),
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Only structural problems with `request` are errors; remote faults degrade.
    pub async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisResponse, PipelineError> {
        if request.screenshot.trim().is_empty() {
            return Err(PipelineError::InvalidRequest(
                "screenshot field must not be empty".to_string(),
            ));
        }

        let image_description = self.describe_screen(&request.screenshot).await;

        let nudge = match request.goal() {
            Some(goal) => {
                self.decide_nudge(goal, &request.recent_descriptions, &image_description)
                    .await
            }
            None => None,
        };

        Ok(AnalysisResponse {
            image_description,
            nudge,
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    async fn describe_screen(&self, screenshot: &str) -> String {
        let image_url = normalize_image(screenshot);
        let instruction = vision_instruction(&self.ignored_window);

        let result = self
            .executor
            .execute("describe_image", || {
                self.model.describe_image(&instruction, &image_url)
            })
            .await;

        match result {
            Ok(description) => description,
            Err(e) => {
                tracing::warn!(
                    stage = "describe",
                    backend = self.model.name(),
                    error = %e,
                    "Image description failed, using fallback description"
                );
                DESCRIPTION_FALLBACK.to_string()
            }
        }
    }

    async fn decide_nudge(
        &self,
        goal: &str,
        activities: &[RecentActivity],
        description: &str,
    ) -> Option<String> {
        let prompt = nudge_prompt(goal, &format_recent_activities(activities), description);

        let result = self
            .executor
            .execute("decide_nudge", || {
                self.model.complete(NUDGE_SYSTEM_PROMPT, &prompt)
            })
            .await;

        match result {
            Ok(answer) => parse_nudge(&answer),
            Err(e) => {
                tracing::warn!(
                    stage = "nudge",
                    backend = self.model.name(),
                    error = %e,
                    "Nudge decision failed, responding without a nudge"
                );
                None
            }
        }
    }
}

// ============================================================================
// Prompt helpers
// ============================================================================

/// Wrap a bare base64 payload in a PNG data-URI; recognised envelopes pass through.
pub fn normalize_image(payload: &str) -> String {
    if has_data_uri_envelope(payload) {
        payload.to_string()
    } else {
        format!("data:{};base64,{}", DEFAULT_MEDIA_TYPE, payload)
    }
}

fn has_data_uri_envelope(payload: &str) -> bool {
    payload
        .strip_prefix("data:image/")
        .and_then(|rest| rest.split_once(";base64,"))
        .map(|(subtype, _)| !subtype.is_empty() && !subtype.contains(','))
        .unwrap_or(false)
}

pub fn vision_instruction(ignored_window: &str) -> String {
    format!(
        "Describe what the user is doing in this screenshot in two or three sentences. \
         Focus on the active applications and tasks visible. \
         Ignore the {} application window if it appears in the screenshot.",
        ignored_window
    )
}

/// One "At HH:MM:SS: <description>" line per activity, in the order given.
pub fn format_recent_activities(activities: &[RecentActivity]) -> String {
    if activities.is_empty() {
        return NO_RECENT_ACTIVITY.to_string();
    }

    activities
        .iter()
        .map(|a| format!("At {}: {}", local_clock_time(a.timestamp), a.description))
        .collect::<Vec<_>>()
        .join("\n")
}

fn local_clock_time(timestamp_ms: i64) -> String {
    let seconds = timestamp_ms.div_euclid(1000);
    match Local.timestamp_opt(seconds, 0).earliest() {
        Some(time) => time.format("%H:%M:%S").to_string(),
        None => "??:??:??".to_string(),
    }
}

pub fn nudge_prompt(goal: &str, activity_block: &str, description: &str) -> String {
    format!(
        "Current Goal: {goal}\n\n\
         Recent Activities:\n{activity_block}\n\n\
         Current Screen:\n{description}\n\n\
         Should I nudge the user? If yes, provide a brief message. If no, respond with 'null'."
    )
}

/// `None` for the "null" sentinel (any case, any surrounding whitespace), else the trimmed text.
pub fn parse_nudge(answer: &str) -> Option<String> {
    let trimmed = answer.trim();
    if trimmed.eq_ignore_ascii_case(NO_NUDGE_SENTINEL) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Mock model that pops scripted responses and records what it was asked.
    struct MockModel {
        vision: Mutex<Vec<Result<String, LlmError>>>,
        reasoning: Mutex<Vec<Result<String, LlmError>>>,
        image_urls: Mutex<Vec<String>>,
        prompts: Mutex<Vec<String>>,
    }

    impl MockModel {
        fn new(
            vision: Vec<Result<String, LlmError>>,
            reasoning: Vec<Result<String, LlmError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                vision: Mutex::new(vision),
                reasoning: Mutex::new(reasoning),
                image_urls: Mutex::new(Vec::new()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn reasoning_calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LanguageModel for MockModel {
        async fn describe_image(&self, _instruction: &str, image_url: &str) -> Result<String, LlmError> {
            self.image_urls.lock().unwrap().push(image_url.to_string());
            let mut queue = self.vision.lock().unwrap();
            if queue.is_empty() {
                return Err(LlmError::MissingCompletion);
            }
            queue.remove(0)
        }

        async fn complete(&self, _system: &str, user: &str) -> Result<String, LlmError> {
            self.prompts.lock().unwrap().push(user.to_string());
            let mut queue = self.reasoning.lock().unwrap();
            if queue.is_empty() {
                return Err(LlmError::MissingCompletion);
            }
            queue.remove(0)
        }

        fn name(&self) -> &str {
            "mock"
        }
    }

    fn rate_limited() -> LlmError {
        LlmError::RateLimited {
            message: "slow down".to_string(),
        }
    }

    fn api_error() -> LlmError {
        LlmError::Api {
            code: 500,
            message: "boom".to_string(),
        }
    }

    fn pipeline(model: Arc<MockModel>) -> AnalysisPipeline {
        AnalysisPipeline::new(model, RetryPolicy::new(2, Duration::from_millis(10)), "LockIn")
    }

    fn request(goal: Option<&str>, activities: Vec<RecentActivity>) -> AnalysisRequest {
        AnalysisRequest {
            screenshot: "AAAA".to_string(),
            current_goal: goal.map(str::to_string),
            recent_descriptions: activities,
        }
    }

    #[test]
    fn test_normalize_wraps_bare_payload() {
        assert_eq!(normalize_image("iVBORw0KGgo="), "data:image/png;base64,iVBORw0KGgo=");
    }

    #[test]
    fn test_normalize_passes_envelope_through() {
        let jpeg = "data:image/jpeg;base64,/9j/4AAQ";
        assert_eq!(normalize_image(jpeg), jpeg);
        let png = "data:image/png;base64,iVBORw0KGgo=";
        assert_eq!(normalize_image(png), png);
    }

    #[test]
    fn test_normalize_wraps_malformed_envelopes() {
        assert_eq!(
            normalize_image("data:text/plain;base64,AAAA"),
            "data:image/png;base64,data:text/plain;base64,AAAA"
        );
        assert!(normalize_image("data:image/;base64,AAAA").starts_with("data:image/png;base64,"));
    }

    #[test]
    fn test_parse_nudge_sentinel_any_case() {
        assert_eq!(parse_nudge("null"), None);
        assert_eq!(parse_nudge("  NULL \n"), None);
        assert_eq!(parse_nudge("Null"), None);
        assert_eq!(
            parse_nudge("  Time to get back to the report!  "),
            Some("Time to get back to the report!".to_string())
        );
        assert_eq!(parse_nudge("null and void"), Some("null and void".to_string()));
    }

    #[test]
    fn test_empty_history_renders_sentinel() {
        assert_eq!(format_recent_activities(&[]), NO_RECENT_ACTIVITY);
    }

    #[test]
    fn test_history_renders_local_times_in_order() {
        let activities = vec![
            RecentActivity {
                timestamp: 90_000_000,
                description: "wrote code".to_string(),
            },
            RecentActivity {
                timestamp: 90_005_000,
                description: "opened mail".to_string(),
            },
        ];
        let expected_time = |ms: i64| {
            Local
                .timestamp_opt(ms / 1000, 0)
                .unwrap()
                .format("%H:%M:%S")
                .to_string()
        };

        let block = format_recent_activities(&activities);

        assert_eq!(
            block,
            format!(
                "At {}: wrote code\nAt {}: opened mail",
                expected_time(90_000_000),
                expected_time(90_005_000)
            )
        );
    }

    #[test]
    fn test_vision_instruction_names_ignored_window() {
        assert!(vision_instruction("LockIn").contains("Ignore the LockIn application window"));
    }

    #[tokio::test]
    async fn test_no_goal_skips_nudge_stage() {
        let model = MockModel::new(vec![Ok("user is coding".to_string())], vec![]);
        let p = pipeline(model.clone());

        let resp = p.analyze(request(None, vec![])).await.unwrap();

        assert_eq!(resp.image_description, "user is coding");
        assert_eq!(resp.nudge, None);
        assert_eq!(model.reasoning_calls(), 0);

        let resp = p.analyze(request(Some(""), vec![])).await;
        assert_eq!(resp.unwrap().nudge, None);
        assert_eq!(model.reasoning_calls(), 0);
    }

    #[tokio::test]
    async fn test_bare_payload_is_wrapped_before_dispatch() {
        let model = MockModel::new(vec![Ok("desc".to_string())], vec![]);
        let p = pipeline(model.clone());

        p.analyze(request(None, vec![])).await.unwrap();

        assert_eq!(
            model.image_urls.lock().unwrap().as_slice(),
            &["data:image/png;base64,AAAA".to_string()]
        );
    }

    #[tokio::test]
    async fn test_stage_one_failure_uses_fallback() {
        let model = MockModel::new(vec![Err(LlmError::MissingApiKey)], vec![]);
        let p = pipeline(model.clone());

        let resp = p.analyze(request(None, vec![])).await.unwrap();

        assert_eq!(resp.image_description, DESCRIPTION_FALLBACK);
        assert_eq!(resp.nudge, None);
        assert_eq!(model.image_urls.lock().unwrap().len(), 1, "non-retryable: one attempt");
    }

    #[tokio::test]
    async fn test_stage_one_retries_then_succeeds() {
        let model = MockModel::new(
            vec![Err(rate_limited()), Err(rate_limited()), Ok("recovered".to_string())],
            vec![],
        );
        let p = pipeline(model.clone());

        let resp = p.analyze(request(None, vec![])).await.unwrap();

        assert_eq!(resp.image_description, "recovered");
        assert_eq!(model.image_urls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_stage_one_exhaustion_still_runs_nudge_with_fallback() {
        let model = MockModel::new(
            vec![Err(rate_limited()), Err(rate_limited()), Err(rate_limited())],
            vec![Ok("Back to the report!".to_string())],
        );
        let p = pipeline(model.clone());

        let resp = p.analyze(request(Some("Finish report"), vec![])).await.unwrap();

        assert_eq!(resp.image_description, DESCRIPTION_FALLBACK);
        assert_eq!(resp.nudge.as_deref(), Some("Back to the report!"));
        assert!(model.prompts.lock().unwrap()[0].contains(DESCRIPTION_FALLBACK));
    }

    #[tokio::test]
    async fn test_stage_two_failure_drops_nudge_only() {
        let model = MockModel::new(
            vec![Ok("user is reading news".to_string())],
            vec![Err(api_error()), Err(api_error()), Err(api_error())],
        );
        let p = pipeline(model.clone());

        let resp = p.analyze(request(Some("Finish report"), vec![])).await.unwrap();

        assert_eq!(resp.image_description, "user is reading news");
        assert_eq!(resp.nudge, None);
        assert_eq!(model.reasoning_calls(), 3);
    }

    #[tokio::test]
    async fn test_null_sentinel_means_no_nudge() {
        let model = MockModel::new(
            vec![Ok("user is writing the report".to_string())],
            vec![Ok("  NULL  ".to_string())],
        );
        let p = pipeline(model);

        let resp = p.analyze(request(Some("Finish report"), vec![])).await.unwrap();
        assert_eq!(resp.nudge, None);
    }

    #[tokio::test]
    async fn test_end_to_end_prompt_composition() {
        let model = MockModel::new(
            vec![Ok("user is browsing social media".to_string())],
            vec![Ok(" You said you'd finish the report. Close the feed? ".to_string())],
        );
        let p = pipeline(model.clone());
        let activity = RecentActivity {
            timestamp: 90_000_000,
            description: "wrote code".to_string(),
        };
        let before = Utc::now().timestamp_millis();

        let resp = p
            .analyze(request(Some("Finish report"), vec![activity.clone()]))
            .await
            .unwrap();

        let prompts = model.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        let expected = nudge_prompt(
            "Finish report",
            &format_recent_activities(&[activity]),
            "user is browsing social media",
        );
        assert_eq!(prompts[0], expected);
        assert!(prompts[0].contains("Finish report"));
        assert!(prompts[0].contains(": wrote code"));
        assert!(prompts[0].contains("user is browsing social media"));

        assert_eq!(
            resp.nudge.as_deref(),
            Some("You said you'd finish the report. Close the feed?")
        );
        assert!(resp.timestamp >= before);
    }

    #[tokio::test]
    async fn test_empty_screenshot_is_structural_error() {
        let model = MockModel::new(vec![], vec![]);
        let p = pipeline(model.clone());
        let mut req = request(Some("Finish report"), vec![]);
        req.screenshot = "  ".to_string();

        let err = p.analyze(req).await.unwrap_err();

        assert!(matches!(err, PipelineError::InvalidRequest(_)));
        assert!(model.image_urls.lock().unwrap().is_empty());
    }
}
