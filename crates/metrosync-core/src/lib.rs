//! Core domain model for metrosync: cleaned rows, CRM payloads and audit entries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "metrosync-core";

/// One spreadsheet record as handed over by a row source: column name to raw cell value.
pub type RawRecord = Map<String, JsonValue>;

/// Maps a numeric spreadsheet column onto the CRM field it is written to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub column: String,
    pub crm_field: String,
}

impl FieldMapping {
    pub fn new(column: impl Into<String>, crm_field: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            crm_field: crm_field.into(),
        }
    }
}

/// Column layout of the metro sheet and the CRM object it feeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetroSchema {
    pub key_column: String,
    pub object_type: String,
    pub numeric_fields: Vec<FieldMapping>,
}

impl Default for MetroSchema {
    fn default() -> Self {
        Self {
            key_column: "metro_area".to_string(),
            object_type: "Metro_Area__c".to_string(),
            numeric_fields: vec![
                FieldMapping::new("active_drivers", "Active_Drivers__c"),
                FieldMapping::new("engaged_drivers", "Engaged_Drivers__c"),
                FieldMapping::new("cdl_active_drivers", "CDL_Active_Drivers__c"),
                FieldMapping::new("inactive_drivers", "Inactive_Drivers__c"),
                FieldMapping::new("l07d_itinerary", "L7D_Itinerary__c"),
                FieldMapping::new("l14d_itinerary", "L14D_Itinerary__c"),
                FieldMapping::new("l30d_itinerary", "L30D_Itinerary__c"),
                FieldMapping::new("l60d_itinerary", "L60D_Itinerary__c"),
                FieldMapping::new("l90d_itinerary", "L90D_Itinerary__c"),
            ],
        }
    }
}

impl MetroSchema {
    pub fn numeric_columns(&self) -> impl Iterator<Item = &str> {
        self.numeric_fields.iter().map(|f| f.column.as_str())
    }

    /// Builds the CRM body for a row. Columns the row lacks are sent as 0.
    pub fn payload_for(&self, row: &Row) -> CrmPayload {
        let fields = self
            .numeric_fields
            .iter()
            .map(|mapping| {
                let value = row.fields.get(&mapping.column).copied().unwrap_or(0);
                (mapping.crm_field.clone(), value)
            })
            .collect();
        CrmPayload {
            name: row.key.clone(),
            fields,
        }
    }
}

/// Cleaned record ready for upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub key: String,
    /// 1-based position within one cleaning pass; never sent to the CRM.
    pub sequence_id: u64,
    pub fields: BTreeMap<String, u64>,
}

/// Body written to the CRM for one metro record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmPayload {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertAction {
    Create,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Error,
}

/// Outcome of one row's upsert attempt.
///
/// The serialized field names are consumed by downstream log readers and must
/// stay as they are.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "metro_id")]
    pub sequence_id: u64,
    #[serde(rename = "metro_name")]
    pub key: String,
    /// `None` when the row failed before an action could be decided.
    pub action: Option<UpsertAction>,
    pub payload: CrmPayload,
    pub status: AuditStatus,
    #[serde(rename = "response")]
    pub detail: JsonValue,
    #[serde(rename = "salesforce_id")]
    pub remote_id: Option<String>,
}

impl AuditEntry {
    pub fn success(
        row: &Row,
        action: UpsertAction,
        payload: CrmPayload,
        remote_id: String,
        detail: JsonValue,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            sequence_id: row.sequence_id,
            key: row.key.clone(),
            action: Some(action),
            payload,
            status: AuditStatus::Success,
            detail,
            remote_id: Some(remote_id),
        }
    }

    pub fn failure(
        row: &Row,
        action: Option<UpsertAction>,
        payload: CrmPayload,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            sequence_id: row.sequence_id,
            key: row.key.clone(),
            action,
            payload,
            status: AuditStatus::Error,
            detail: JsonValue::String(message.into()),
            remote_id: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == AuditStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn austin() -> Row {
        Row {
            key: "Austin".to_string(),
            sequence_id: 1,
            fields: BTreeMap::from([
                ("active_drivers".to_string(), 12),
                ("l07d_itinerary".to_string(), 3),
            ]),
        }
    }

    #[test]
    fn payload_maps_columns_to_crm_fields_and_zero_fills() {
        let payload = MetroSchema::default().payload_for(&austin());
        assert_eq!(payload.name, "Austin");
        assert_eq!(payload.fields.len(), 9);
        assert_eq!(payload.fields["Active_Drivers__c"], 12);
        assert_eq!(payload.fields["L7D_Itinerary__c"], 3);
        assert_eq!(payload.fields["Inactive_Drivers__c"], 0);
    }

    #[test]
    fn payload_serializes_flat_with_name() {
        let payload = MetroSchema::default().payload_for(&austin());
        let json = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(json["Name"], "Austin");
        assert_eq!(json["Active_Drivers__c"], 12);
        assert!(json.get("fields").is_none());
    }

    #[test]
    fn audit_entry_uses_log_consumer_field_names() {
        let row = austin();
        let mut entry = AuditEntry::failure(
            &row,
            None,
            MetroSchema::default().payload_for(&row),
            "lookup failed",
        );
        entry.timestamp = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();

        let json = serde_json::to_value(&entry).expect("serialize");
        let keys: Vec<&str> = json
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        for expected in [
            "timestamp",
            "metro_id",
            "metro_name",
            "action",
            "payload",
            "status",
            "response",
            "salesforce_id",
        ] {
            assert!(keys.contains(&expected), "missing {expected}");
        }
        assert_eq!(json["action"], JsonValue::Null);
        assert_eq!(json["status"], "error");
        assert_eq!(json["response"], "lookup failed");
        assert_eq!(json["metro_id"], 1);
    }
}
