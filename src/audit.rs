/// Audit logging for privileged operations
///
/// Every nftables batch applied on behalf of an install or remove is recorded
/// as one JSON line, whether it succeeded or not.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    InstallMapping,
    RemoveMapping,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub event_type: EventType,

    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
#[derive(Debug, Clone)]
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Creates an audit log at `$STATE/audit.log`, creating the state
    /// directory if needed
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined or created
    pub fn new() -> std::io::Result<Self> {
        crate::utils::ensure_dirs()?;

        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    pub fn with_path(path: impl AsRef<Path>) -> Self {
        Self {
            log_path: path.as_ref().to_path_buf(),
        }
    }

    /// Appends an event to the audit log
    ///
    /// Events are written as JSON-lines format (one JSON object per line)
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(&event)?;

        if let Some(parent) = self.log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads the most recent events from the log, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = AuditEvent::new(
            EventType::InstallMapping,
            false,
            serde_json::json!({"mapping": ":9000 -> 10.0.0.1:8000"}),
            Some("permission denied".to_string()),
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("install_mapping"));
        assert!(json.contains("permission denied"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"timestamp":"2024-01-01T00:00:00Z","event_type":"remove_mapping","success":true,"details":{},"error":null}"#;
        let event: AuditEvent = serde_json::from_str(json).unwrap();

        assert!(event.success);
        assert!(matches!(event.event_type, EventType::RemoveMapping));
    }

    #[tokio::test]
    async fn test_log_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::with_path(dir.path().join("audit.log"));

        for port in [9000, 9001] {
            let event = AuditEvent::new(
                EventType::InstallMapping,
                true,
                serde_json::json!({"local_port": port}),
                None,
            );
            audit.log(event).await.unwrap();
        }

        let content = tokio::fs::read_to_string(audit.path()).await.unwrap();
        assert_eq!(content.lines().count(), 2);

        let recent = audit.read_recent(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].details["local_port"], 9001);
    }

    #[tokio::test]
    async fn test_default_log_created_under_fresh_state_dir() {
        let home = crate::core::test_helpers::isolate_home();

        let audit = AuditLog::new().unwrap();
        assert!(audit.path().starts_with(home));
        audit
            .log(AuditEvent::new(EventType::InstallMapping, true, serde_json::json!({}), None))
            .await
            .unwrap();

        assert!(audit.path().exists());
        assert!(!audit.read_recent(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_log_creates_missing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::with_path(dir.path().join("state/ipf/audit.log"));

        audit
            .log(AuditEvent::new(EventType::RemoveMapping, true, serde_json::json!({}), None))
            .await
            .unwrap();

        assert_eq!(audit.read_recent(5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_read_recent_skips_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        tokio::fs::write(&path, "not json\n").await.unwrap();

        let audit = AuditLog::with_path(&path);
        audit
            .log(AuditEvent::new(EventType::RemoveMapping, true, serde_json::json!({}), None))
            .await
            .unwrap();

        let recent = audit.read_recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
    }
}
