//! Purpose-scoped consent over the memory manager: grant/revoke checks,
//! consent-gated storage, erasure, export, rectification and a data
//! minimisation report.

use crate::audit::hash_identifier;
use crate::errors::{ConsentError, ConsentResult};
use crate::memory::MemoryManager;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Closed set of processing purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Research,
    Analytics,
    Improvement,
    Personalization,
    LegalCompliance,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Research => "research",
            Purpose::Analytics => "analytics",
            Purpose::Improvement => "improvement",
            Purpose::Personalization => "personalization",
            Purpose::LegalCompliance => "legal_compliance",
        }
    }

    pub fn all() -> [Purpose; 5] {
        [
            Purpose::Research,
            Purpose::Analytics,
            Purpose::Improvement,
            Purpose::Personalization,
            Purpose::LegalCompliance,
        ]
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Purpose {
    type Err = ConsentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "research" => Ok(Purpose::Research),
            "analytics" => Ok(Purpose::Analytics),
            "improvement" => Ok(Purpose::Improvement),
            "personalization" => Ok(Purpose::Personalization),
            "legal_compliance" => Ok(Purpose::LegalCompliance),
            other => Err(ConsentError::InvalidPurpose(other.to_string())),
        }
    }
}

/// Counts returned by `erase_user`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ErasureReport {
    pub deleted: usize,
    pub anonymized: usize,
}

/// One exported record of a user's data.
#[derive(Debug, Clone, Serialize)]
pub struct ExportedRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub purpose: String,
}

/// Portable export of everything held about one user.
#[derive(Debug, Clone, Serialize)]
pub struct UserExport {
    pub user_id: String,
    pub export_timestamp: DateTime<Utc>,
    pub consents: HashMap<String, DateTime<Utc>>,
    pub data: Vec<ExportedRecord>,
}

/// Data minimisation findings.
#[derive(Debug, Clone, Serialize)]
pub struct MinimisationReport {
    pub total_events: usize,
    pub redundant_data: Vec<RedundantEntry>,
    pub excessive_retention: Vec<RetentionEntry>,
    pub unnecessary_fields: Vec<UnnecessaryFieldsEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedundantEntry {
    pub event_id: String,
    pub duplicate_of: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetentionEntry {
    pub event_id: String,
    pub age_days: i64,
    pub retention_days: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnnecessaryFieldsEntry {
    pub event_id: String,
    pub fields: Vec<String>,
}

/// Internal fields stripped from exported data.
const INTERNAL_FIELDS: [&str; 3] = ["_id", "_internal", "system_metadata"];

/// Consent gate wrapping the memory manager.
pub struct ConsentGate {
    memory: Arc<MemoryManager>,
    consents: parking_lot::Mutex<HashMap<String, HashMap<Purpose, DateTime<Utc>>>>,
}

impl ConsentGate {
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self {
            memory,
            consents: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn grant(&self, user_id: &str, purpose: Purpose) {
        self.consents
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .insert(purpose, Utc::now());
        tracing::debug!(user_id, %purpose, "consent granted");
    }

    pub fn revoke(&self, user_id: &str, purpose: Purpose) {
        if let Some(purposes) = self.consents.lock().get_mut(user_id) {
            purposes.remove(&purpose);
        }
        tracing::debug!(user_id, %purpose, "consent revoked");
    }

    pub fn has(&self, user_id: &str, purpose: Purpose) -> bool {
        self.consents
            .lock()
            .get(user_id)
            .map_or(false, |purposes| purposes.contains_key(&purpose))
    }

    fn consent_timestamp(&self, user_id: &str, purpose: Purpose) -> Option<DateTime<Utc>> {
        self.consents
            .lock()
            .get(user_id)
            .and_then(|purposes| purposes.get(&purpose))
            .copied()
    }

    /// Store personal data, requiring prior consent for the purpose. The
    /// stored metadata marks the record as PII under the
    /// `gdpr_personal_data` retention class.
    pub async fn store_with_consent(
        &self,
        key: &str,
        value: Value,
        user_id: &str,
        purpose: Purpose,
    ) -> ConsentResult<()> {
        let granted_at = self
            .consent_timestamp(user_id, purpose)
            .ok_or_else(|| ConsentError::ConsentRequired(purpose.to_string()))?;

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), Value::from(user_id));
        metadata.insert("purpose".to_string(), Value::from(purpose.as_str()));
        metadata.insert(
            "consent_timestamp".to_string(),
            Value::from(granted_at.to_rfc3339()),
        );
        metadata.insert("contains_pii".to_string(), Value::Bool(true));
        metadata.insert(
            "data_type".to_string(),
            Value::from("gdpr_personal_data"),
        );

        self.memory
            .remember(key, value, metadata, &format!("gdpr_system_{user_id}"))
            .await;
        Ok(())
    }

    /// Right to be forgotten: remove (or anonymise, when deletion is
    /// disallowed) every event carrying the user's id, clear the user's
    /// entries from all memory tiers and the cache, and revoke all
    /// consents.
    pub async fn erase_user(&self, user_id: &str) -> ErasureReport {
        let mut report = ErasureReport::default();
        let store = self.memory.event_store();

        for event in store.all_events() {
            let matches = event
                .metadata
                .get("user_id")
                .and_then(Value::as_str)
                .map_or(false, |id| id == user_id);
            if !matches {
                continue;
            }

            let can_delete = event
                .metadata
                .get("can_delete")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            if can_delete {
                store.remove_event(&event.id);
                report.deleted += 1;
            } else {
                let anonymized = self.memory.audit().anonymize_event(&event);
                store.replace_event(&event.id, anonymized);
                report.anonymized += 1;
            }
        }

        self.memory.purge_user(user_id);
        self.consents.lock().remove(user_id);

        tracing::info!(
            user_id,
            deleted = report.deleted,
            anonymized = report.anonymized,
            "user data erased"
        );
        report
    }

    /// Right to access.
    pub fn access_user_data(&self, user_id: &str) -> UserExport {
        self.export_user_data(user_id)
    }

    /// Right to data portability: all events carrying the user's id, with
    /// internal fields stripped.
    pub fn export_user_data(&self, user_id: &str) -> UserExport {
        let consents = self
            .consents
            .lock()
            .get(user_id)
            .map(|purposes| {
                purposes
                    .iter()
                    .map(|(purpose, at)| (purpose.as_str().to_string(), *at))
                    .collect()
            })
            .unwrap_or_default();

        let data = self
            .memory
            .event_store()
            .all_events()
            .into_iter()
            .filter(|event| {
                event
                    .metadata
                    .get("user_id")
                    .and_then(Value::as_str)
                    .map_or(false, |id| id == user_id)
            })
            .map(|event| ExportedRecord {
                timestamp: event.timestamp,
                event_type: event.event_type.as_str().to_string(),
                data: sanitize_for_export(&event.data),
                purpose: event
                    .metadata
                    .get("purpose")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            })
            .collect();

        UserExport {
            user_id: user_id.to_string(),
            export_timestamp: Utc::now(),
            consents,
            data,
        }
    }

    /// Right to rectification: requires legal-compliance consent; the
    /// correction is stored as a new event under `<key>_rectified`.
    pub async fn rectify(
        &self,
        user_id: &str,
        key: &str,
        corrected: Value,
    ) -> ConsentResult<()> {
        if !self.has(user_id, Purpose::LegalCompliance) {
            return Err(ConsentError::ConsentRequired(
                Purpose::LegalCompliance.to_string(),
            ));
        }

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), Value::from(user_id));
        metadata.insert("rectification".to_string(), Value::Bool(true));
        metadata.insert("original_key".to_string(), Value::from(key));

        self.memory
            .remember(
                &format!("{key}_rectified"),
                corrected,
                metadata,
                &format!("gdpr_rectification_{user_id}"),
            )
            .await;
        Ok(())
    }

    /// Report duplicated data, events past their retention class, and
    /// events still carrying internal-only fields.
    pub fn data_minimisation_check(&self) -> MinimisationReport {
        let events = self.memory.event_store().all_events();
        let now = Utc::now();
        let audit = self.memory.audit();

        let mut seen: HashMap<String, String> = HashMap::new();
        let mut redundant_data = Vec::new();
        let mut excessive_retention = Vec::new();
        let mut unnecessary_fields = Vec::new();

        for event in &events {
            let fingerprint = hash_identifier(&event.data.to_string());
            match seen.get(&fingerprint) {
                Some(original) => redundant_data.push(RedundantEntry {
                    event_id: event.id.clone(),
                    duplicate_of: original.clone(),
                }),
                None => {
                    seen.insert(fingerprint, event.id.clone());
                }
            }

            let data_type = event
                .metadata
                .get("data_type")
                .and_then(Value::as_str)
                .unwrap_or("system_logs");
            let retention = audit.retention_for(data_type);
            if now - event.timestamp >= retention {
                excessive_retention.push(RetentionEntry {
                    event_id: event.id.clone(),
                    age_days: (now - event.timestamp).num_days(),
                    retention_days: retention.num_days(),
                });
            }

            if let Value::Object(fields) = &event.data {
                let internal: Vec<String> = INTERNAL_FIELDS
                    .iter()
                    .filter(|f| fields.contains_key(**f))
                    .map(|f| f.to_string())
                    .collect();
                if !internal.is_empty() {
                    unnecessary_fields.push(UnnecessaryFieldsEntry {
                        event_id: event.id.clone(),
                        fields: internal,
                    });
                }
            }
        }

        MinimisationReport {
            total_events: events.len(),
            redundant_data,
            excessive_retention,
            unnecessary_fields,
        }
    }
}

fn sanitize_for_export(data: &Value) -> Value {
    match data {
        Value::Object(fields) => {
            let mut sanitized = fields.clone();
            for field in INTERNAL_FIELDS {
                sanitized.remove(field);
            }
            Value::Object(sanitized)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purpose_parsing_is_closed() {
        assert_eq!("research".parse::<Purpose>().unwrap(), Purpose::Research);
        assert_eq!(
            "legal_compliance".parse::<Purpose>().unwrap(),
            Purpose::LegalCompliance
        );
        assert!("marketing".parse::<Purpose>().is_err());
    }

    #[test]
    fn sanitize_strips_internal_fields() {
        let data = serde_json::json!({
            "_id": 7,
            "_internal": true,
            "system_metadata": {},
            "note": "kept"
        });
        let sanitized = sanitize_for_export(&data);
        assert_eq!(sanitized, serde_json::json!({ "note": "kept" }));
    }
}
