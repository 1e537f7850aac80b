/// Audit logging for privileged operations
///
/// Every engagement, teardown and connection attempt ends up as one
/// JSON-lines record in the state directory, so a support bundle shows what
/// the kill switch and dialer actually did and when.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Engage,
    Disengage,
    Connect,
    Disconnect,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Type of event
    pub event_type: EventType,

    /// Whether the operation succeeded
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
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// # Errors
    ///
    /// Returns `Err` if the state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "state directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    /// Appends an event as one JSON line
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be opened or written
    pub async fn log(&self, event: AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(&event)?;

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

    /// Reads the most recent events from the log
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be read
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

    pub fn path(&self) -> &PathBuf {
        &self.log_path
    }
}

/// Logs a kill-switch engagement
pub async fn log_engage(rule_count: usize, persist: bool, success: bool, error: Option<String>) {
    write_event(
        EventType::Engage,
        success,
        serde_json::json!({
            "rule_count": rule_count,
            "persist": persist,
        }),
        error,
    )
    .await;
}

/// Logs a kill-switch teardown
pub async fn log_disengage(success: bool, error: Option<String>) {
    write_event(EventType::Disengage, success, serde_json::json!({}), error).await;
}

/// Logs a dial attempt and its terminal outcome. Only the device and host
/// are recorded; credentials never reach the audit trail.
pub async fn log_connect(device: &str, host: &str, outcome: &str, success: bool) {
    write_event(
        EventType::Connect,
        success,
        serde_json::json!({
            "device": device,
            "host": host,
            "outcome": outcome,
        }),
        None,
    )
    .await;
}

/// Logs a disconnect
pub async fn log_disconnect(device: &str, success: bool, error: Option<String>) {
    write_event(
        EventType::Disconnect,
        success,
        serde_json::json!({ "device": device }),
        error,
    )
    .await;
}

async fn write_event(
    event_type: EventType,
    success: bool,
    details: serde_json::Value,
    error: Option<String>,
) {
    if let Ok(audit) = AuditLog::new() {
        let event = AuditEvent::new(event_type, success, details, error);
        if let Err(e) = audit.log(event).await {
            tracing::warn!("failed to write audit log: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_audit_event_creation() {
        let event = AuditEvent::new(
            EventType::Engage,
            true,
            serde_json::json!({"rule_count": 9}),
            None,
        );

        assert!(event.success);
        assert!(event.error.is_none());
        assert_eq!(event.details["rule_count"], 9);
    }

    #[test]
    fn test_event_serialization() {
        let event = AuditEvent::new(
            EventType::Disengage,
            false,
            serde_json::json!({}),
            Some("engine unavailable".to_string()),
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("disengage"));
        assert!(json.contains("engine unavailable"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"timestamp":"2025-01-01T00:00:00Z","event_type":"connect","success":true,"details":{"outcome":"connected"},"error":null}"#;
        let event: AuditEvent = serde_json::from_str(json).unwrap();

        assert!(event.success);
        assert!(matches!(event.event_type, EventType::Connect));
    }
}
