use std::cmp::Reverse;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::commands::{CliError, CliResult};
use crate::config::load_config;

/// Summary of one recorded capture session directory.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub dir: PathBuf,
    pub slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<String>,
    pub rest_entries: usize,
    pub ws_events: usize,
    pub saved_bodies: usize,
    pub redacted: bool,
}

fn slug_of(dir_name: &str) -> Option<&str> {
    dir_name.strip_prefix("capture-")
}

/// Scan `output_folder` for `capture-*` directories, newest first. The
/// timestamp slug sorts lexicographically, so no mtime probing is needed.
pub async fn list_sessions(output_folder: &Path, limit: usize) -> Result<Vec<SessionSummary>> {
    if !output_folder.exists() {
        return Ok(Vec::new());
    }
    let mut dir = fs::read_dir(output_folder)
        .await
        .with_context(|| format!("failed to read output folder {:?}", output_folder))?;

    let mut found: Vec<(String, PathBuf)> = Vec::new();
    while let Some(entry) = dir.next_entry().await? {
        if entry
            .file_type()
            .await
            .map(|ft| ft.is_dir())
            .unwrap_or(false)
            && let Some(name) = entry.file_name().to_str()
            && let Some(slug) = slug_of(name)
        {
            found.push((slug.to_string(), entry.path()));
        }
    }
    found.sort_by_key(|(slug, _)| Reverse(slug.clone()));
    found.truncate(limit);

    let mut out = Vec::with_capacity(found.len());
    for (slug, path) in found {
        if let Some(summary) = summarize_session(&path, &slug).await? {
            out.push(summary);
        }
    }
    Ok(out)
}

/// Read one session directory's artifacts into a summary. A directory with
/// no HAR yet (still recording, or stopped before any response) is still
/// listed with zero entries.
pub async fn summarize_session(dir: &Path, slug: &str) -> Result<Option<SessionSummary>> {
    let har_path = dir.join(format!("rest-{slug}.har"));
    let (started, rest_entries, redacted) = match fs::read(&har_path).await {
        Ok(bytes) => match serde_json::from_slice::<JsonValue>(&bytes) {
            Ok(har) => {
                let started = har["log"]["pages"][0]["startedDateTime"]
                    .as_str()
                    .map(|s| s.to_string());
                let entries = har["log"]["entries"].as_array().map(Vec::len).unwrap_or(0);
                let redacted = har["log"]["entries"]
                    .as_array()
                    .is_some_and(|es| es.iter().any(|e| e["response"]["_redacted"] == true));
                (started, entries, redacted)
            }
            Err(_) => (None, 0, false),
        },
        Err(_) => (None, 0, false),
    };

    let ws_events = count_lines(&dir.join(format!("ws-{slug}.wslog.ndjson"))).await;
    let saved_bodies = count_dir_entries(&dir.join(format!("bodies-{slug}"))).await;

    Ok(Some(SessionSummary {
        dir: dir.to_path_buf(),
        slug: slug.to_string(),
        started,
        rest_entries,
        ws_events,
        saved_bodies,
        redacted,
    }))
}

async fn count_lines(path: &Path) -> usize {
    let Ok(file) = fs::File::open(path).await else {
        return 0;
    };
    let reader = BufReader::new(file);
    let mut lines = reader.lines();
    let mut count = 0usize;
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            count += 1;
        }
    }
    count
}

async fn count_dir_entries(path: &Path) -> usize {
    let Ok(mut dir) = fs::read_dir(path).await else {
        return 0;
    };
    let mut count = 0usize;
    while let Ok(Some(_)) = dir.next_entry().await {
        count += 1;
    }
    count
}

/// `netscope sessions list [--limit N] [--json]`
pub async fn run_list(limit: usize, json: bool) -> CliResult<()> {
    let config = load_config().map_err(|e| CliError::Config(format!("{e:#}")))?;
    let sessions = list_sessions(&config.output_folder, limit)
        .await
        .map_err(|e| CliError::Archive(format!("{e:#}")))?;

    if json {
        let text = serde_json::to_string_pretty(&sessions)
            .map_err(|e| CliError::Archive(e.to_string()))?;
        println!("{text}");
        return Ok(());
    }

    if sessions.is_empty() {
        println!(
            "No recorded sessions under {}",
            config.output_folder.display()
        );
        return Ok(());
    }

    println!(
        "{:<18} {:>8} {:>8} {:>8}  {}",
        "SESSION".bold(),
        "REST".bold(),
        "WS".bold(),
        "BODIES".bold(),
        "STARTED".bold()
    );
    for s in &sessions {
        println!(
            "{:<18} {:>8} {:>8} {:>8}  {}{}",
            s.slug,
            s.rest_entries,
            s.ws_events,
            s.saved_bodies,
            s.started.as_deref().unwrap_or("-"),
            if s.redacted {
                " [redacted]".dimmed().to_string()
            } else {
                String::new()
            }
        );
    }
    Ok(())
}

/// `netscope sessions show <dir> [--limit N]`
pub async fn run_show(dir: &Path, limit: usize) -> CliResult<()> {
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CliError::Archive(format!("not a session directory: {}", dir.display())))?;
    let slug = slug_of(name)
        .ok_or_else(|| CliError::Archive(format!("not a capture directory: {}", dir.display())))?;

    let har_path = dir.join(format!("rest-{slug}.har"));
    let bytes = fs::read(&har_path)
        .await
        .map_err(|e| CliError::Archive(format!("failed to read {}: {e}", har_path.display())))?;
    let har: JsonValue = serde_json::from_slice(&bytes)
        .map_err(|e| CliError::Archive(format!("malformed HAR {}: {e}", har_path.display())))?;

    let entries = har["log"]["entries"].as_array().cloned().unwrap_or_default();
    println!(
        "{} {} entries ({})",
        "Session".bold(),
        entries.len(),
        har_path.display()
    );
    for entry in entries.iter().take(limit) {
        let method = entry["request"]["method"].as_str().unwrap_or("-");
        let url = entry["request"]["url"].as_str().unwrap_or("-");
        let status = entry["response"]["status"].as_u64().unwrap_or(0);
        let time = entry["time"].as_u64().unwrap_or(0);
        let status_str = if (200..400).contains(&status) {
            status.to_string().green().to_string()
        } else {
            status.to_string().red().to_string()
        };
        println!("{:>7} {:<7} {:>6}ms  {}", status_str, method, time, url);
    }
    if entries.len() > limit {
        println!("... and {} more", entries.len() - limit);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::events::{RequestEvent, ResponseEvent};
    use crate::recorder::CaptureRecorder;

    async fn record_fixture(root: &Path) -> (PathBuf, String) {
        let recorder = CaptureRecorder::create(root, "fixture", false).expect("create");
        recorder.on_rest_request(&RequestEvent {
            ts: 1_000,
            url: "https://a.test/x".into(),
            method: "GET".into(),
            ..Default::default()
        });
        recorder.on_rest_response(&ResponseEvent {
            ts: 1_100,
            url: "https://a.test/x".into(),
            method: "GET".into(),
            status: 200,
            status_text: "OK".into(),
            body_size: 5,
            timing_ms: 100,
            ..Default::default()
        });
        recorder.on_ws("open", &serde_json::json!({"ts": 1, "id": "ws1"}));
        recorder.on_ws("close", &serde_json::json!({"ts": 2, "id": "ws1"}));
        let dir = recorder.base_dir().to_path_buf();
        recorder.stop();

        let name = dir.file_name().expect("name").to_string_lossy().into_owned();
        let slug = slug_of(&name).expect("slug").to_string();
        (dir, slug)
    }

    #[tokio::test]
    async fn lists_recorded_sessions_with_counts() {
        let root = tempfile::tempdir().expect("tempdir");
        let (_dir, _slug) = record_fixture(root.path()).await;

        let sessions = list_sessions(root.path(), 10).await.expect("list");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].rest_entries, 1);
        assert_eq!(sessions[0].ws_events, 2);
        assert_eq!(sessions[0].saved_bodies, 0);
        assert!(!sessions[0].redacted);
        assert!(sessions[0].started.is_some());
    }

    #[tokio::test]
    async fn missing_output_folder_lists_nothing() {
        let root = tempfile::tempdir().expect("tempdir");
        let sessions = list_sessions(&root.path().join("nope"), 10).await.expect("list");
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn summarize_tolerates_missing_har() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = root.path().join("capture-20250101-000000");
        fs::create_dir_all(&dir).await.expect("mkdir");

        let summary = summarize_session(&dir, "20250101-000000")
            .await
            .expect("summarize")
            .expect("some");
        assert_eq!(summary.rest_entries, 0);
        assert_eq!(summary.ws_events, 0);
    }
}
