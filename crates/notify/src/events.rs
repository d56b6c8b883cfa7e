//! Notification event types emitted by the policy controller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events that can trigger notifications.
///
/// Serialized with a `type` tag and camelCase fields; the generic webhook
/// channel posts this representation unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum NotifyEvent {
    /// A policy's persisted status changed.
    StatusChanged {
        policy_id: String,
        target: String,
        #[serde(default)]
        previous_status: Option<String>,
        new_status: String,
        #[serde(default)]
        reasons: Vec<String>,
        #[serde(default)]
        message: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// A rollback or remediation exhausted its retry budget.
    ActionFailed {
        policy_id: String,
        target: String,
        action: String,
        error: String,
        attempts: u32,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
}

impl NotifyEvent {
    /// Get the policy this event is about.
    #[must_use]
    pub fn policy_id(&self) -> &str {
        match self {
            Self::StatusChanged { policy_id, .. } | Self::ActionFailed { policy_id, .. } => {
                policy_id
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_changed(new_status: &str) -> NotifyEvent {
        NotifyEvent::StatusChanged {
            policy_id: "prod/web-guard".to_string(),
            target: "Deployment/prod/web".to_string(),
            previous_status: Some("NoActionNeeded".to_string()),
            new_status: new_status.to_string(),
            reasons: vec!["AvailableReplicas 6 LessThan 8".to_string()],
            message: "rolled back to revision 3".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_status_changed_wire_shape() {
        let json = serde_json::to_value(status_changed("RolledBack")).unwrap();
        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["policyId"], "prod/web-guard");
        assert_eq!(json["previousStatus"], "NoActionNeeded");
        assert_eq!(json["newStatus"], "RolledBack");
        assert_eq!(json["reasons"][0], "AvailableReplicas 6 LessThan 8");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_action_failed_defaults_timestamp() {
        let raw = r#"{"type":"action_failed","policyId":"a/b","target":"Deployment/a/web",
            "action":"Rollback","error":"boom","attempts":3}"#;
        let event: NotifyEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.policy_id(), "a/b");
        assert!(matches!(event, NotifyEvent::ActionFailed { attempts: 3, .. }));
    }
}
