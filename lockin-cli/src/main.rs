//! lockin-cli — command-line client for a LockIn server
//!
//! # Subcommands
//! - `analyze <image> [--goal G] [--activity <ms>=<text>]... [--json]` — describe a screenshot, maybe nudge
//! - `upload <image> [--timestamp <ms>]`                                — store a screenshot on the server
//! - `screenshots`                                                      — list stored screenshots
//! - `status`                                                           — show server health

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

const DEFAULT_SERVER: &str = "http://127.0.0.1:8000";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "lockin-cli",
    version,
    about = "LockIn focus assistant — command-line client"
)]
struct Cli {
    /// LockIn HTTP server URL (overrides LOCKIN_HTTP_URL env var)
    #[arg(long, env = "LOCKIN_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Analyze a screenshot file and ask whether a nudge is needed
    Analyze {
        /// Screenshot image file
        image: String,

        /// What the user is supposed to be working on
        #[arg(short, long)]
        goal: Option<String>,

        /// Earlier activity as `<epoch_ms>=<description>`, oldest first (repeatable)
        #[arg(short, long = "activity", value_parser = parse_activity)]
        activities: Vec<Activity>,

        /// Print the raw JSON response
        #[arg(long)]
        json: bool,
    },

    /// Upload a screenshot file to the server's store
    Upload {
        /// Screenshot image file
        image: String,

        /// Capture time in epoch milliseconds (defaults to now)
        #[arg(long)]
        timestamp: Option<i64>,
    },

    /// List screenshots stored on the server
    Screenshots,

    /// Show LockIn server status
    Status,
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Activity {
    pub timestamp: i64,
    pub description: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeBody {
    pub screenshot: String,
    pub current_goal: Option<String>,
    pub recent_descriptions: Vec<Activity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResult {
    pub image_description: String,
    pub nudge: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Deserialize)]
pub struct StoredScreenshot {
    pub id: i64,
    pub timestamp: String,
    pub image_path: String,
}

// ============================================================================
// Helpers
// ============================================================================

/// Parse `<epoch_ms>=<description>`.
pub fn parse_activity(raw: &str) -> Result<Activity, String> {
    let (ts, description) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected <epoch_ms>=<description>, got '{}'", raw))?;
    let timestamp = ts
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("invalid timestamp '{}': {}", ts, e))?;
    let description = description.trim();
    if description.is_empty() {
        return Err("activity description must not be empty".to_string());
    }
    Ok(Activity {
        timestamp,
        description: description.to_string(),
    })
}

/// Media type from the file extension; `None` lets the server apply its PNG default.
pub fn media_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

/// Base64 payload for `bytes`, wrapped in a data-URI when the media type is known.
pub fn encode_image(bytes: &[u8], media_type: Option<&str>) -> String {
    let encoded = STANDARD.encode(bytes);
    match media_type {
        Some(mt) => format!("data:{};base64,{}", mt, encoded),
        None => encoded,
    }
}

fn read_image(image: &str) -> anyhow::Result<String> {
    let path = Path::new(image);
    let bytes = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {}", path.display(), e))?;
    Ok(encode_image(&bytes, media_type_for(path)))
}

fn client(timeout_secs: u64) -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()?)
}

fn expect_success(resp: reqwest::blocking::Response) -> anyhow::Result<reqwest::blocking::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().unwrap_or_default();
    anyhow::bail!("server returned {}: {}", status, body)
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn do_analyze(
    server: &str,
    image: &str,
    goal: Option<String>,
    activities: Vec<Activity>,
    json_output: bool,
) -> anyhow::Result<()> {
    let body = AnalyzeBody {
        screenshot: read_image(image)?,
        current_goal: goal,
        recent_descriptions: activities,
    };

    // Two model calls plus retries can take a while.
    let resp = client(180)?
        .post(format!("{}/analyze-screenshot", server))
        .json(&body)
        .send()?;
    let resp = expect_success(resp)?;

    if json_output {
        let raw: serde_json::Value = resp.json()?;
        println!("{}", serde_json::to_string_pretty(&raw)?);
        return Ok(());
    }

    let result: AnalyzeResult = resp.json()?;
    println!("Screen: {}", result.image_description);
    match result.nudge {
        Some(nudge) => println!("Nudge:  {}", nudge),
        None => println!("Nudge:  none"),
    }
    if let Some(at) = chrono::DateTime::from_timestamp_millis(result.timestamp) {
        println!("At:     {}", at.with_timezone(&chrono::Local).format("%H:%M:%S"));
    }
    Ok(())
}

fn do_upload(server: &str, image: &str, timestamp: Option<i64>) -> anyhow::Result<()> {
    let body = serde_json::json!({
        "timestamp": timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        "image_data": read_image(image)?,
    });

    let resp = client(30)?
        .post(format!("{}/upload-screenshot", server))
        .json(&body)
        .send()?;
    let result: serde_json::Value = expect_success(resp)?.json()?;
    println!("Stored: {}", result["filename"].as_str().unwrap_or("?"));
    Ok(())
}

fn do_screenshots(server: &str) -> anyhow::Result<()> {
    let resp = client(10)?.get(format!("{}/screenshots", server)).send()?;
    let rows: Vec<StoredScreenshot> = expect_success(resp)?.json()?;

    if rows.is_empty() {
        eprintln!("No screenshots stored");
        return Ok(());
    }
    for row in rows {
        println!("{:>5}  {}  {}", row.id, row.timestamp, row.image_path);
    }
    Ok(())
}

/// Show the server status by calling GET /health.
fn do_status(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/health", server);
    let resp = client(10)?.get(&url).send();

    match resp {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            println!("LockIn server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:       {}", body["version"].as_str().unwrap_or("?"));
            println!("SQLite:        {}", body["sqlite"].as_str().unwrap_or("?"));
            println!("Model backend: {}", body["model"].as_str().unwrap_or("?"));
        }
        Ok(r) => {
            let status = r.status();
            eprintln!("lockin-cli: server unhealthy (HTTP {})", status);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("lockin-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    }

    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();

    let result = match cli.command {
        Commands::Analyze {
            image,
            goal,
            activities,
            json,
        } => do_analyze(&server, &image, goal, activities, json),
        Commands::Upload { image, timestamp } => do_upload(&server, &image, timestamp),
        Commands::Screenshots => do_screenshots(&server),
        Commands::Status => do_status(&server),
    };

    if let Err(e) = result {
        eprintln!("lockin-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
