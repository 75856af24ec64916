use owo_colors::OwoColorize;
use serde::Serialize;

use crate::commands::{CliError, CliResult};
use crate::config::{config_path, load_config, netscope_home_dir};
use crate::util;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Check {
    name: String,
    ok: bool,
    detail: String,
}

fn check(name: &str, outcome: Result<String, String>) -> Check {
    match outcome {
        Ok(detail) => Check {
            name: name.to_string(),
            ok: true,
            detail,
        },
        Err(detail) => Check {
            name: name.to_string(),
            ok: false,
            detail,
        },
    }
}

/// `netscope doctor [--json]` — environment diagnostics: config parse,
/// output folder writability, body-type filter validity.
pub fn run(json: bool) -> CliResult<()> {
    let mut checks: Vec<Check> = Vec::new();

    checks.push(check(
        "home directory",
        Ok(netscope_home_dir().display().to_string()),
    ));

    let config = match load_config() {
        Ok(cfg) => {
            let path = config_path();
            let detail = if path.exists() {
                path.display().to_string()
            } else {
                "using defaults (no config.json yet)".to_string()
            };
            checks.push(check("config", Ok(detail)));
            Some(cfg)
        }
        Err(err) => {
            checks.push(check("config", Err(format!("{err:#}"))));
            None
        }
    };

    if let Some(config) = &config {
        let probe = config.output_folder.join(".netscope-doctor");
        let outcome = util::ensure_directory(&config.output_folder)
            .and_then(|()| {
                std::fs::write(&probe, b"ok")
                    .map_err(|e| anyhow::anyhow!("write probe failed: {e}"))
            })
            .map(|()| {
                let _ = std::fs::remove_file(&probe);
                format!("writable: {}", config.output_folder.display())
            })
            .map_err(|e| format!("{e:#}"));
        checks.push(check("output folder", outcome));

        let outcome = if config.capture_body_types.trim().is_empty() {
            Err("empty pattern; body persistence matches nothing".to_string())
        } else {
            match config.body_types_regex() {
                Some(_) => Ok(config.capture_body_types.clone()),
                None => Err(format!(
                    "invalid pattern {:?}; body persistence matches nothing",
                    config.capture_body_types
                )),
            }
        };
        checks.push(check("captureBodyTypes", outcome));
    }

    if json {
        let text =
            serde_json::to_string_pretty(&checks).map_err(|e| CliError::Other(e.to_string()))?;
        println!("{text}");
    } else {
        for c in &checks {
            let marker = if c.ok {
                "ok".green().bold().to_string()
            } else {
                "!!".red().bold().to_string()
            };
            println!("{marker:>4}  {:<18} {}", c.name, c.detail);
        }
    }

    if checks.iter().any(|c| !c.ok) {
        return Err(CliError::Other("doctor found problems".to_string()));
    }
    Ok(())
}
