//! Find-or-create-or-update of cleaned rows against a CRM.

use std::num::NonZeroUsize;

use metrosync_adapters::CrmClient;
use metrosync_core::{AuditEntry, MetroSchema, Row, UpsertAction};
use metrosync_storage::AuditLog;
use tracing::{debug, info, warn};

/// Owns the CRM handle and the run's audit log.
pub struct UpsertEngine<C> {
    crm: C,
    schema: MetroSchema,
    log: AuditLog,
}

impl<C: CrmClient> UpsertEngine<C> {
    pub fn new(crm: C, schema: MetroSchema) -> Self {
        Self {
            crm,
            schema,
            log: AuditLog::new(),
        }
    }

    pub fn log(&self) -> &AuditLog {
        &self.log
    }

    pub fn into_log(self) -> AuditLog {
        self.log
    }

    /// Upsert every row strictly in order and return the entries this call appended.
    ///
    /// Batches only set how often progress is reported; the entries are the
    /// same for any batch size.
    pub async fn process(&mut self, rows: &[Row], batch_size: NonZeroUsize) -> &[AuditEntry] {
        let start = self.log.len();
        let total_batches = rows.len().div_ceil(batch_size.get());

        for (batch_index, batch) in rows.chunks(batch_size.get()).enumerate() {
            info!(
                batch = batch_index + 1,
                total_batches,
                rows = batch.len(),
                "processing batch"
            );
            for row in batch {
                let entry = self.upsert_row(row).await;
                self.log.record(entry);
            }
        }

        &self.log.entries()[start..]
    }

    /// Runs one row through lookup, decide and apply. Never fails: remote
    /// errors become an `error` entry.
    pub async fn upsert_row(&self, row: &Row) -> AuditEntry {
        let object_type = self.schema.object_type.as_str();
        let payload = self.schema.payload_for(row);

        let existing = match self.crm.find(object_type, &row.key).await {
            Ok(existing) => existing,
            Err(err) => {
                warn!(sequence_id = row.sequence_id, key = %row.key, error = %err, "lookup failed");
                return AuditEntry::failure(row, None, payload, err.to_string());
            }
        };

        match existing {
            Some(id) => match self.crm.update(object_type, &id, &payload).await {
                Ok(ack) => {
                    debug!(sequence_id = row.sequence_id, key = %row.key, %id, "updated");
                    AuditEntry::success(row, UpsertAction::Update, payload, id, ack)
                }
                Err(err) => {
                    warn!(sequence_id = row.sequence_id, key = %row.key, error = %err, "update failed");
                    AuditEntry::failure(row, Some(UpsertAction::Update), payload, err.to_string())
                }
            },
            None => match self.crm.create(object_type, &payload).await {
                Ok(created) => {
                    debug!(sequence_id = row.sequence_id, key = %row.key, id = %created.id, "created");
                    AuditEntry::success(
                        row,
                        UpsertAction::Create,
                        payload,
                        created.id,
                        created.response,
                    )
                }
                Err(err) => {
                    warn!(sequence_id = row.sequence_id, key = %row.key, error = %err, "create failed");
                    AuditEntry::failure(row, Some(UpsertAction::Create), payload, err.to_string())
                }
            },
        }
    }
}
