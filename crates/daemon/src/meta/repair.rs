//! Self-repair diagnostics
//!
//! Six checks run at boot and on a schedule: service health, directory
//! permissions, persisted config validity, port accessibility, pattern-db
//! integrity, and log rotation. Auto-fixable issues are remediated in the
//! same pass and recorded under `fixed`; the rest surface in a summary file
//! for the administrator.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::Severity;
use crate::config::CoreConfig;

/// A single log file is archived beyond this size.
const MAX_LOG_FILE_BYTES: u64 = 100 * 1024 * 1024;
/// The log directory is pruned beyond this total.
const MAX_LOG_DIR_BYTES: u64 = 500 * 1024 * 1024;
/// The pattern store is flagged for the administrator beyond this size.
const MAX_PATTERN_DB_BYTES: u64 = 1024 * 1024 * 1024;
/// Keep this many recent report files.
const REPORT_RETENTION: usize = 50;

/// One detected issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    /// Stable identifier, e.g. `missing_config_dir`.
    pub id: String,
    pub description: String,
    pub severity: Severity,
    pub auto_fix: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_action: Option<String>,
}

/// Outcome of one diagnostic run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairReport {
    pub timestamp: DateTime<Utc>,
    pub issues: Vec<Issue>,
    /// Issue ids remediated during this run.
    pub fixed: Vec<String>,
    pub healthy: bool,
}

/// Everything the diagnostics need to know about the deployment.
#[derive(Clone)]
pub struct RepairContext {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    /// (logical id, device path) pairs for configured ports.
    pub expected_ports: Vec<(String, String)>,
    /// Set by the bridge once its listener is up.
    pub listening: Arc<AtomicBool>,
}

impl RepairContext {
    pub fn new(config: &CoreConfig, listening: Arc<AtomicBool>) -> Self {
        Self {
            config_dir: config.paths.config_dir.clone(),
            data_dir: config.paths.data_dir.clone(),
            log_dir: config.paths.log_dir.clone(),
            expected_ports: Vec::new(),
            listening,
        }
    }
}

/// Run the full diagnostic pass, auto-fixing what can be fixed.
pub fn run_diagnostics(ctx: &RepairContext) -> RepairReport {
    let mut issues = Vec::new();
    let mut fixed = Vec::new();

    check_service_health(ctx, &mut issues);
    check_directories(ctx, &mut issues, &mut fixed);
    check_config_validity(ctx, &mut issues, &mut fixed);
    check_port_accessibility(ctx, &mut issues);
    check_pattern_db(ctx, &mut issues, &mut fixed);
    check_log_rotation(ctx, &mut issues, &mut fixed);

    let healthy = issues.iter().all(|i| fixed.contains(&i.id));
    let report = RepairReport {
        timestamp: Utc::now(),
        issues,
        fixed,
        healthy,
    };
    if !report.healthy {
        warn!(
            open_issues = report.issues.len() - report.fixed.len(),
            "diagnostics found unresolved issues"
        );
    }
    report
}

/// Whether this run found the process not listening (supervisor restart).
pub fn service_down(report: &RepairReport) -> bool {
    report.issues.iter().any(|i| i.id == "service_not_listening")
}

fn check_service_health(ctx: &RepairContext, issues: &mut Vec<Issue>) {
    if !ctx.listening.load(Ordering::Acquire) {
        issues.push(Issue {
            id: "service_not_listening".to_string(),
            description: "bridge listener is not accepting connections".to_string(),
            severity: Severity::Critical,
            auto_fix: false,
            user_action: Some("process supervisor should restart the service".to_string()),
        });
    }
}

fn check_directories(ctx: &RepairContext, issues: &mut Vec<Issue>, fixed: &mut Vec<String>) {
    for (name, dir) in [
        ("config", &ctx.config_dir),
        ("data", &ctx.data_dir),
        ("log", &ctx.log_dir),
    ] {
        if !dir.is_dir() {
            let id = format!("missing_{}_dir", name);
            issues.push(Issue {
                id: id.clone(),
                description: format!("{} directory {} is missing", name, dir.display()),
                severity: Severity::Error,
                auto_fix: true,
                user_action: None,
            });
            if create_private_dir(dir).is_ok() {
                fixed.push(id);
            }
            continue;
        }
        if !dir_writable(dir) {
            let id = format!("unwritable_{}_dir", name);
            issues.push(Issue {
                id: id.clone(),
                description: format!("{} directory {} is not writable", name, dir.display()),
                severity: Severity::Error,
                auto_fix: true,
                user_action: None,
            });
            if restore_owner_write(dir).is_ok() && dir_writable(dir) {
                fixed.push(id);
            }
        }
    }
}

fn check_config_validity(ctx: &RepairContext, issues: &mut Vec<Issue>, fixed: &mut Vec<String>) {
    let path = ctx.config_dir.join("config.json");
    let Ok(bytes) = fs::read(&path) else {
        // No persisted copy is fine; the loader owns the primary format.
        return;
    };
    if serde_json::from_slice::<CoreConfig>(&bytes).is_ok() {
        return;
    }
    let id = "config_corrupt".to_string();
    issues.push(Issue {
        id: id.clone(),
        description: format!("persisted configuration {} does not parse", path.display()),
        severity: Severity::Error,
        auto_fix: true,
        user_action: None,
    });
    let stamp = Utc::now().format("%Y%m%dT%H%M%S");
    let backup = path.with_file_name(format!("config.json.bad-{}", stamp));
    let restored = fs::rename(&path, &backup)
        .and_then(|_| {
            let defaults = serde_json::to_vec_pretty(&CoreConfig::default())?;
            fs::write(&path, defaults)
        })
        .is_ok();
    if restored {
        info!(backup = %backup.display(), "corrupt config backed up and defaults written");
        fixed.push(id);
    }
}

fn check_port_accessibility(ctx: &RepairContext, issues: &mut Vec<Issue>) {
    for (id, path) in &ctx.expected_ports {
        if !Path::new(path).exists() {
            issues.push(Issue {
                id: format!("port_missing_{}", id),
                description: format!("device node {} for port {} is absent", path, id),
                severity: Severity::Warning,
                auto_fix: false,
                user_action: Some(format!("check cabling and drivers for {}", path)),
            });
        }
    }
}

fn check_pattern_db(ctx: &RepairContext, issues: &mut Vec<Issue>, fixed: &mut Vec<String>) {
    let path = ctx.data_dir.join("patterns.db");
    let Ok(meta) = fs::metadata(&path) else {
        return;
    };
    if meta.len() == 0 {
        let id = "patterns_db_empty".to_string();
        issues.push(Issue {
            id: id.clone(),
            description: "pattern store is zero bytes; scheduling rebuild".to_string(),
            severity: Severity::Warning,
            auto_fix: true,
            user_action: None,
        });
        // Removing the husk lets the next open rebuild from the journal.
        if fs::remove_file(&path).is_ok() {
            fixed.push(id);
        }
    } else if meta.len() > MAX_PATTERN_DB_BYTES {
        issues.push(Issue {
            id: "patterns_db_oversized".to_string(),
            description: format!("pattern store is {} bytes", meta.len()),
            severity: Severity::Warning,
            auto_fix: false,
            user_action: Some("inspect and truncate the learned-pattern store".to_string()),
        });
    }
}

fn check_log_rotation(ctx: &RepairContext, issues: &mut Vec<Issue>, fixed: &mut Vec<String>) {
    let Ok(entries) = fs::read_dir(&ctx.log_dir) else {
        return;
    };
    let mut files: Vec<(PathBuf, u64, std::time::SystemTime)> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            let modified = meta.modified().ok()?;
            Some((e.path(), meta.len(), modified))
        })
        .collect();

    for (path, len, _) in &files {
        if *len > MAX_LOG_FILE_BYTES {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let id = format!("oversized_log_{}", name);
            issues.push(Issue {
                id: id.clone(),
                description: format!("log file {} is {} bytes", name, len),
                severity: Severity::Warning,
                auto_fix: true,
                user_action: None,
            });
            if archive_file(&ctx.log_dir, path).is_ok() {
                // Recreate an empty successor so writers keep a target.
                let _ = fs::File::create(path);
                fixed.push(id);
            }
        }
    }

    let total: u64 = files.iter().map(|(_, len, _)| len).sum();
    if total > MAX_LOG_DIR_BYTES {
        let id = "log_dir_over_budget".to_string();
        issues.push(Issue {
            id: id.clone(),
            description: format!("log directory totals {} bytes", total),
            severity: Severity::Warning,
            auto_fix: true,
            user_action: None,
        });
        // Archive oldest-first until under budget.
        files.sort_by_key(|(_, _, modified)| *modified);
        let mut remaining = total;
        let mut ok = true;
        for (path, len, _) in &files {
            if remaining <= MAX_LOG_DIR_BYTES {
                break;
            }
            if archive_file(&ctx.log_dir, path).is_ok() {
                remaining -= len;
            } else {
                ok = false;
                break;
            }
        }
        if ok && remaining <= MAX_LOG_DIR_BYTES {
            fixed.push(id);
        }
    }
}

/// Move a log file into the archive subdirectory.
fn archive_file(log_dir: &Path, path: &Path) -> std::io::Result<()> {
    let archive = log_dir.join("archive");
    fs::create_dir_all(&archive)?;
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "log".to_string());
    fs::rename(path, archive.join(format!("{}-{}", stamp, name)))
}

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    restore_owner_write(dir)
}

#[cfg(unix)]
fn restore_owner_write(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restore_owner_write(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

fn dir_writable(dir: &Path) -> bool {
    let probe = dir.join(".cyreal-probe");
    match fs::File::create(&probe) {
        Ok(_) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// Persist a report under `repair-reports/`, pruning old ones.
pub fn persist_report(data_dir: &Path, report: &RepairReport) -> std::io::Result<PathBuf> {
    let reports = data_dir.join("repair-reports");
    fs::create_dir_all(&reports)?;
    let stamp = report.timestamp.format("%Y%m%dT%H%M%S%3f");
    let path = reports.join(format!("report-{}.json", stamp));
    fs::write(
        &path,
        serde_json::to_vec_pretty(report).unwrap_or_default(),
    )?;

    // Bounded retention.
    let mut files: Vec<PathBuf> = fs::read_dir(&reports)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
        .collect();
    files.sort();
    while files.len() > REPORT_RETENTION {
        let oldest = files.remove(0);
        let _ = fs::remove_file(oldest);
    }

    // Human-readable summary of anything needing attention.
    let unresolved: Vec<&Issue> = report
        .issues
        .iter()
        .filter(|i| !report.fixed.contains(&i.id))
        .collect();
    let summary = data_dir.join("repair-summary.txt");
    if unresolved.is_empty() {
        let _ = fs::remove_file(&summary);
    } else {
        let mut text = format!("Cyreal self-repair summary ({})\n\n", report.timestamp);
        for issue in unresolved {
            text.push_str(&format!("- [{}] {}\n", issue.id, issue.description));
            if let Some(action) = &issue.user_action {
                text.push_str(&format!("  action: {}\n", action));
            }
        }
        let _ = fs::write(&summary, text);
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(root: &Path) -> RepairContext {
        RepairContext {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
            log_dir: root.join("log"),
            expected_ports: Vec::new(),
            listening: Arc::new(AtomicBool::new(true)),
        }
    }

    fn prepared_ctx(root: &Path) -> RepairContext {
        let ctx = ctx(root);
        fs::create_dir_all(&ctx.config_dir).unwrap();
        fs::create_dir_all(&ctx.data_dir).unwrap();
        fs::create_dir_all(&ctx.log_dir).unwrap();
        ctx
    }

    #[test]
    fn test_missing_config_dir_autofixed() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        fs::create_dir_all(&ctx.data_dir).unwrap();
        fs::create_dir_all(&ctx.log_dir).unwrap();

        let report = run_diagnostics(&ctx);
        let issue = report
            .issues
            .iter()
            .find(|i| i.id == "missing_config_dir")
            .expect("missing dir detected");
        assert!(issue.auto_fix);
        assert!(report.fixed.contains(&"missing_config_dir".to_string()));
        assert!(report.healthy);
        assert!(ctx.config_dir.is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&ctx.config_dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[test]
    fn test_diagnostics_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        // First run fixes the world.
        let first = run_diagnostics(&ctx);
        assert!(!first.issues.is_empty());
        assert!(first.healthy);

        // Second run finds nothing to do: every auto-fixed issue is gone.
        let second = run_diagnostics(&ctx);
        assert!(second.issues.is_empty());
        assert!(second.healthy);

        // A third pass matches the second exactly (no oscillation).
        let third = run_diagnostics(&ctx);
        assert_eq!(
            serde_json::to_value(&second.issues).unwrap(),
            serde_json::to_value(&third.issues).unwrap()
        );
    }

    #[test]
    fn test_corrupt_config_backed_up() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = prepared_ctx(dir.path());
        fs::write(ctx.config_dir.join("config.json"), b"{ not json").unwrap();

        let report = run_diagnostics(&ctx);
        assert!(report.fixed.contains(&"config_corrupt".to_string()));

        // The replacement parses; the original is preserved with a suffix.
        let replacement = fs::read(ctx.config_dir.join("config.json")).unwrap();
        assert!(serde_json::from_slice::<CoreConfig>(&replacement).is_ok());
        let backups: Vec<_> = fs::read_dir(&ctx.config_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("bad-"))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn test_missing_port_needs_user_action() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = prepared_ctx(dir.path());
        ctx.expected_ports
            .push(("plc".to_string(), "/dev/ttyDOESNOTEXIST".to_string()));

        let report = run_diagnostics(&ctx);
        let issue = report
            .issues
            .iter()
            .find(|i| i.id == "port_missing_plc")
            .unwrap();
        assert!(!issue.auto_fix);
        assert!(issue.user_action.is_some());
        assert!(!report.healthy);
    }

    #[test]
    fn test_zero_byte_pattern_db_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = prepared_ctx(dir.path());
        fs::write(ctx.data_dir.join("patterns.db"), b"").unwrap();

        let report = run_diagnostics(&ctx);
        assert!(report.fixed.contains(&"patterns_db_empty".to_string()));
        assert!(!ctx.data_dir.join("patterns.db").exists());
    }

    #[test]
    fn test_service_down_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = prepared_ctx(dir.path());
        ctx.listening = Arc::new(AtomicBool::new(false));

        let report = run_diagnostics(&ctx);
        assert!(service_down(&report));
        assert!(!report.healthy);
    }

    #[test]
    fn test_report_persistence_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = prepared_ctx(dir.path());
        ctx.expected_ports
            .push(("plc".to_string(), "/dev/ttyGONE".to_string()));

        let report = run_diagnostics(&ctx);
        let path = persist_report(&ctx.data_dir, &report).unwrap();
        assert!(path.exists());

        let loaded: RepairReport =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(loaded.issues.len(), report.issues.len());

        let summary =
            fs::read_to_string(ctx.data_dir.join("repair-summary.txt")).unwrap();
        assert!(summary.contains("port_missing_plc"));
    }
}
