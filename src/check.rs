use anyhow::{bail, Result};
use serde::Serialize;
use std::path::PathBuf;

use crate::config::Config;
use crate::operator_message::render_operator_message;

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub config_path: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub backend_count: usize,
}

impl CheckReport {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn to_plain_text(&self, verbose: bool) -> String {
        let mut lines = vec![
            "torfleet check".to_string(),
            format!(
                "  result: {}",
                if self.has_errors() { "FAILED" } else { "OK" }
            ),
            format!("  backends: {}", self.backend_count),
            format!("  warnings: {}", self.warnings.len()),
        ];

        if !verbose {
            if !self.errors.is_empty() {
                lines.extend(render_operator_message(
                    "configuration validation failed",
                    "required fields are missing or invalid values were provided",
                    "run 'torfleet check --verbose' and fix listed errors",
                ));
            } else if self.has_warnings() {
                lines.extend(render_operator_message(
                    "configuration is usable but has warnings",
                    "safe defaults or network-exposure settings may need review",
                    "run 'torfleet doctor' now, then inspect warnings with 'torfleet check --verbose'",
                ));
            } else {
                lines.push("  next: run 'torfleet doctor'".to_string());
            }

            return lines.join("\n");
        }

        lines.push(format!("  config: {}", self.config_path));

        if self.errors.is_empty() {
            lines.push("  errors: none".to_string());
        } else {
            lines.push(format!("  errors: {}", self.errors.len()));
            for error in &self.errors {
                lines.push(format!("    - {}", error));
            }
        }

        if self.warnings.is_empty() {
            lines.push("  warning_details: none".to_string());
        } else {
            lines.push("  warning_details:".to_string());
            for warning in &self.warnings {
                lines.push(format!("    - {}", warning));
            }
        }

        lines.join("\n")
    }
}

pub async fn run_check(config_path: Option<PathBuf>) -> Result<CheckReport> {
    let path = if let Some(path) = config_path {
        path
    } else {
        Config::resolve_config_path(None)?
    };

    if !path.exists() {
        bail!("Configuration file not found: {}", path.display());
    }

    let config = Config::load_from_file(&path).await?;
    let mut warnings = Vec::new();

    if config.socks_bind == "0.0.0.0" {
        warnings.push("socks_bind is 0.0.0.0 (SOCKS listener exposed on all interfaces)".to_string());
    }
    if config.dns_bind == "0.0.0.0" {
        warnings.push("dns_bind is 0.0.0.0 (DNS proxy exposed on all interfaces)".to_string());
    }
    if config.api_bind == "0.0.0.0" {
        warnings.push("api_bind is 0.0.0.0 (management API exposed on all interfaces, which has no auth)".to_string());
    }
    if config.allow_private_destinations {
        warnings.push("allow_private_destinations is true (SOCKS clients can reach private/loopback/link-local targets)".to_string());
    }

    if let (Some(min), Some(max)) = (
        config.dns_cache.min_ttl_override_secs,
        config.dns_cache.max_ttl_override_secs,
    ) {
        if max.saturating_sub(min) < 5 {
            warnings.push(format!(
                "dns_cache TTL override window is narrow ({}..{}s), most responses will be clamped to nearly the same TTL",
                min, max
            ));
        }
    }

    Ok(CheckReport {
        config_path: path.display().to_string(),
        errors: Vec::new(),
        warnings,
        backend_count: config.backends.len(),
    })
}

pub async fn run_and_print(
    config_path: Option<PathBuf>,
    strict: bool,
    json: bool,
    verbose: bool,
) -> Result<()> {
    let report = run_check(config_path).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.to_plain_text(verbose));
    }

    if report.has_errors() || (strict && report.has_warnings()) {
        bail!("static check failed")
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> CheckReport {
        CheckReport {
            config_path: "/tmp/torfleet.yaml".to_string(),
            errors: Vec::new(),
            warnings: vec!["socks_bind is 0.0.0.0 (SOCKS listener exposed on all interfaces)".to_string()],
            backend_count: 2,
        }
    }

    #[test]
    fn plain_text_default_is_concise() {
        let rendered = sample_report().to_plain_text(false);
        assert!(rendered.contains("torfleet check"));
        assert!(rendered.contains("warnings: 1"));
        assert!(!rendered.contains("warning_details:"));
        assert!(!rendered.contains("config:"));
    }

    #[test]
    fn plain_text_verbose_includes_details() {
        let rendered = sample_report().to_plain_text(true);
        assert!(rendered.contains("config: /tmp/torfleet.yaml"));
        assert!(rendered.contains("warning_details:"));
        assert!(rendered.contains("socks_bind is 0.0.0.0"));
    }

    #[test]
    fn plain_text_concise_warn_includes_operator_action_triplet() {
        let rendered = sample_report().to_plain_text(false);
        assert!(rendered.contains("what_happened:"));
        assert!(rendered.contains("why_likely:"));
        assert!(rendered.contains("do_this_now:"));
    }
}
