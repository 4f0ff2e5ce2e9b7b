//! Process management module
//!
//! Handles PID file creation/management, process termination signals,
//! and process status checks. Operates based on home directory for
//! non-root user support.

use anyhow::{Result, bail};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process;

use crate::config::Config;
use crate::constants::{get_pid_file_path, get_runtime_dir};
use crate::error::ResultExt;
use crate::protection;

/// Protection-mode summary surfaced by `status` and `doctor`.
#[derive(Debug, Clone, Serialize)]
pub struct ProtectionModeSummary {
    pub enabled: bool,
    pub reason: Option<String>,
}

/// Process manager
/// 
/// Identifies and controls daemon process via PID file.
pub struct ProcessManager;

impl ProcessManager {
    /// Write current process PID to file
    /// 
    /// If PID file already exists, considers it a duplicate execution and returns error.
    pub fn write_pid_file() -> Result<()> {
        let pid_path = get_pid_file_path();
        
        // Create runtime directory
        let runtime_dir = get_runtime_dir();
        std::fs::create_dir_all(&runtime_dir)
            .context_process(&format!("Failed to create runtime directory: {}", runtime_dir.display()))?;
        
        // Check existing PID file
        if pid_path.exists() {
            // Check if existing process is running
            if let Ok(old_pid) = Self::read_pid_file() {
                if Self::is_process_running(old_pid) {
                    bail!("torfleet is already running (PID: {}). Run 'torfleet stop' first.", old_pid);
                }
            }
            // Remove file if not running
            let _ = fs::remove_file(&pid_path);
        }
        
        // Write new PID file
        let pid = process::id();
        let mut file = fs::File::create(&pid_path)
            .context_process(&format!("Failed to create PID file: {}", pid_path.display()))?;
        
        writeln!(file, "{}", pid)
            .context_process(&format!("Failed to write PID file: {}", pid_path.display()))?;
        
        log::debug!("PID file created: {} (PID: {})", pid_path.display(), pid);
        Ok(())
    }
    
    /// Read PID from PID file
    pub fn read_pid_file() -> Result<i32> {
        let pid_path = get_pid_file_path();
        
        let content = fs::read_to_string(&pid_path)
            .context_process(&format!("Failed to read PID file: {}", pid_path.display()))?;
        
        let pid: i32 = content.trim()
            .parse::<i32>()
            .map_err(|e| anyhow::anyhow!("Invalid PID file content: {}", e))?;
        
        Ok(pid)
    }
    
    /// Remove PID file
    pub fn remove_pid_file() -> Result<()> {
        let pid_path = get_pid_file_path();
        
        if pid_path.exists() {
            fs::remove_file(&pid_path)
                .context_process(&format!("Failed to remove PID file: {}", pid_path.display()))?;
            log::debug!("PID file removed: {}", pid_path.display());
        }
        
        Ok(())
    }
    
    /// Check if process is running
    /// 
    /// Uses kill(pid, 0) to check process existence.
    /// Signal 0 doesn't actually send signal to process, only checks existence.
    fn is_process_running(pid: i32) -> bool {
        let pid = Pid::from_raw(pid);
        signal::kill(pid, None).is_ok()
    }

    /// Public wrapper used by `doctor`'s PID-consistency check.
    pub fn probe_process_running(pid: i32) -> bool {
        Self::is_process_running(pid)
    }
    
    /// Stop running daemon
    /// 
    /// Reads PID file and sends SIGTERM signal to gracefully
    /// terminate and clean up files.
    pub fn stop_daemon() -> Result<()> {
        let pid = Self::read_pid_file()
            .context_process("Cannot find running torfleet process. PID file does not exist or is corrupted.")?;
        
        if !Self::is_process_running(pid) {
            // Process already terminated - clean up file
            log::warn!("Process with PID {} does not exist. Cleaning up PID file.", pid);
            Self::remove_pid_file()?;
            bail!("torfleet is not running.");
        }
        
        // Send SIGTERM signal
        let nix_pid = Pid::from_raw(pid);
        signal::kill(nix_pid, Signal::SIGTERM)
            .map_err(|e| anyhow::anyhow!("Failed to send SIGTERM to process {}: {}", pid, e))?;
        
        log::info!("Sent termination signal to torfleet process (PID: {})", pid);
        
        // File is automatically cleaned up when process terminates
        Ok(())
    }
    
    /// Send configuration reload signal (SIGHUP)
    /// 
    /// Sends SIGHUP signal to running daemon to reload configuration
    /// without downtime.
    pub fn send_reload_signal() -> Result<()> {
        let pid = Self::read_pid_file()
            .context_process("Cannot find running torfleet process.")?;
        
        if !Self::is_process_running(pid) {
            bail!("torfleet is not running. Clean up the PID file and try again.");
        }
        
        // Send SIGHUP signal
        let nix_pid = Pid::from_raw(pid);
        signal::kill(nix_pid, Signal::SIGHUP)
            .map_err(|e| anyhow::anyhow!("Failed to send SIGHUP to process {}: {}", pid, e))?;
        
        log::info!("Sent configuration reload signal to torfleet process (PID: {})", pid);
        Ok(())
    }
    
    /// Check daemon running status
    pub fn is_daemon_running() -> bool {
        match Self::read_pid_file() {
            Ok(pid) => Self::is_process_running(pid),
            Err(_) => false,
        }
    }
}

/// Cleanup guard - PID file auto-cleanup using RAII pattern
/// 
/// Automatically cleans up PID file on normal/abnormal process termination.
pub struct PidFileGuard;

impl PidFileGuard {
    pub fn new() -> Result<Self> {
        ProcessManager::write_pid_file()?;
        Ok(Self)
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        // Clean up PID file on termination
        if let Err(e) = ProcessManager::remove_pid_file() {
            log::error!("Failed to clean up PID file: {}", e);
        }
    }
}

/// Local (non-live) snapshot of daemon/backend state for the `status`
/// command. Reads the PID file, config file, and protection-mode snapshot
/// file; does not dial any backend, since this process may not be the one
/// running the daemon being inspected.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub daemon_running: bool,
    pub pid: Option<i32>,
    pub config_path: Option<String>,
    pub backend_count: usize,
    pub method: Option<String>,
    pub protection_mode: ProtectionModeSummary,
}

impl StatusReport {
    pub fn to_plain_text(&self, verbose: bool) -> String {
        let mut lines = vec![
            "torfleet status".to_string(),
            format!(
                "  daemon: {}",
                if self.daemon_running { "running" } else { "stopped" }
            ),
            format!("  backends: {}", self.backend_count),
            format!(
                "  protection_mode: {}{}",
                if self.protection_mode.enabled { "on" } else { "off" },
                self.protection_mode
                    .reason
                    .as_ref()
                    .map(|r| format!(" ({})", r))
                    .unwrap_or_default()
            ),
        ];

        if !verbose {
            if !self.daemon_running {
                lines.push("  next: run 'torfleet start' or 'torfleet start --daemon'".to_string());
            } else {
                lines.push("  next: run 'torfleet doctor' for deeper diagnostics".to_string());
            }
            return lines.join("\n");
        }

        lines.push(format!(
            "  pid: {}",
            self.pid.map(|p| p.to_string()).unwrap_or_else(|| "none".to_string())
        ));
        lines.push(format!(
            "  config: {}",
            self.config_path.as_deref().unwrap_or("unresolved")
        ));
        lines.push(format!(
            "  method: {}",
            self.method.as_deref().unwrap_or("unknown")
        ));

        lines.join("\n")
    }
}

fn current_protection_mode() -> ProtectionModeSummary {
    match protection::read_snapshot() {
        Some(snapshot) => ProtectionModeSummary {
            enabled: snapshot.enabled,
            reason: snapshot.reason,
        },
        None => ProtectionModeSummary {
            enabled: false,
            reason: None,
        },
    }
}

impl ProcessManager {
    /// Build and print a `StatusReport` for the `status` command.
    pub async fn print_status(config_path: Option<PathBuf>, json: bool, verbose: bool) -> Result<()> {
        let pid = Self::read_pid_file().ok();
        let daemon_running = pid.map(Self::is_process_running).unwrap_or(false);

        let resolved_path = Config::resolve_config_path(config_path.as_deref()).ok();
        let config = match &resolved_path {
            Some(path) if path.exists() => Config::load_from_file(path).await.ok(),
            _ => None,
        };

        let report = StatusReport {
            daemon_running,
            pid,
            config_path: resolved_path.map(|p| p.display().to_string()),
            backend_count: config.as_ref().map(|c| c.backends.len()).unwrap_or(0),
            method: config.as_ref().map(|c| c.method.to_string()),
            protection_mode: current_protection_mode(),
        };

        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!("{}", report.to_plain_text(verbose));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_report_concise_omits_pid_and_config() {
        let report = StatusReport {
            daemon_running: true,
            pid: Some(4242),
            config_path: Some("/home/user/.torfleet/config.yaml".to_string()),
            backend_count: 2,
            method: Some("round-robin".to_string()),
            protection_mode: ProtectionModeSummary {
                enabled: false,
                reason: None,
            },
        };

        let rendered = report.to_plain_text(false);
        assert!(rendered.contains("daemon: running"));
        assert!(!rendered.contains("pid:"));
        assert!(!rendered.contains("config:"));
    }

    #[test]
    fn status_report_verbose_includes_pid_and_method() {
        let report = StatusReport {
            daemon_running: true,
            pid: Some(4242),
            config_path: Some("/home/user/.torfleet/config.yaml".to_string()),
            backend_count: 2,
            method: Some("least-connections".to_string()),
            protection_mode: ProtectionModeSummary {
                enabled: true,
                reason: Some("timeout_or_refused_storm".to_string()),
            },
        };

        let rendered = report.to_plain_text(true);
        assert!(rendered.contains("pid: 4242"));
        assert!(rendered.contains("method: least-connections"));
        assert!(rendered.contains("protection_mode: on (timeout_or_refused_storm)"));
    }
}
