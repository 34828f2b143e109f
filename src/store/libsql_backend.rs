//! libSQL backend: async `MailStore` implementation.
//!
//! Supports local file and in-memory databases. Exactly-once sending rests
//! on the `UNIQUE (campaign_ident, subject_id)` constraint of
//! `send_records`: inserts use `INSERT OR IGNORE` and state changes are
//! conditional updates, so the affected-row count tells the caller whether
//! it won.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::campaign::SubjectQuery;
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{CampaignRow, MailStore, SendRecord, SendStatus};
use crate::subject::{SubjectKind, SubjectRecord};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn opt_time(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(dt.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn parse_kind(s: &str) -> Result<SubjectKind, DatabaseError> {
    s.parse().map_err(DatabaseError::Serialization)
}

/// JSON filter value as a SQL value comparable with `json_extract` output.
fn filter_value(value: &serde_json::Value) -> libsql::Value {
    match value {
        serde_json::Value::Null => libsql::Value::Null,
        serde_json::Value::Bool(b) => libsql::Value::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => libsql::Value::Integer(i),
            None => libsql::Value::Real(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => libsql::Value::Text(s.clone()),
        other => libsql::Value::Text(other.to_string()),
    }
}

const SUBJECT_COLUMNS: &str = "kind, id, email, gets_emails, fields";

fn row_to_subject(row: &libsql::Row) -> Result<SubjectRecord, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("subject row parse: {e}"));
    let kind_str: String = row.get(0).map_err(read)?;
    let fields_str: String = row.get(4).map_err(read)?;

    let kind = parse_kind(&kind_str)?;
    let fields = serde_json::from_str(&fields_str)
        .map_err(|e| DatabaseError::Serialization(format!("subject fields: {e}")))?;

    Ok(SubjectRecord {
        kind,
        id: row.get(1).map_err(read)?,
        email: row.get(2).map_err(read)?,
        gets_emails: row.get::<i64>(3).map_err(read)? != 0,
        fields,
    })
}

const CAMPAIGN_COLUMNS: &str = "ident, kind, subject, template, template_source, \
    template_missing, sender, needs_approval, approved, active_after, active_before, \
    allow_at_the_con, allow_post_con, orphaned, updated_at";

fn row_to_campaign(row: &libsql::Row) -> Result<CampaignRow, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("campaign row parse: {e}"));
    let flag = |idx: i32| row.get::<i64>(idx).map(|v| v != 0).map_err(read);
    let kind_str: String = row.get(1).map_err(read)?;
    let active_after: Option<String> = row.get(9).ok();
    let active_before: Option<String> = row.get(10).ok();
    let updated_str: String = row.get(14).map_err(read)?;

    Ok(CampaignRow {
        ident: row.get(0).map_err(read)?,
        kind: parse_kind(&kind_str)?,
        subject: row.get(2).map_err(read)?,
        template: row.get(3).map_err(read)?,
        template_source: row.get(4).ok(),
        template_missing: flag(5)?,
        sender: row.get(6).map_err(read)?,
        needs_approval: flag(7)?,
        approved: flag(8)?,
        active_after: parse_optional_datetime(&active_after),
        active_before: parse_optional_datetime(&active_before),
        allow_at_the_con: flag(11)?,
        allow_post_con: flag(12)?,
        orphaned: flag(13)?,
        updated_at: parse_datetime(&updated_str),
    })
}

const SEND_COLUMNS: &str = "id, campaign_ident, subject_kind, subject_id, recipient, \
    subject_line, body, status, created_at, updated_at, claimed_at, sent_at";

/// Fixed-width claim stamp, so claims compare correctly as text.
fn claim_stamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_send_record(row: &libsql::Row) -> Result<SendRecord, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("send record row parse: {e}"));
    let id_str: String = row.get(0).map_err(read)?;
    let kind_str: String = row.get(2).map_err(read)?;
    let status_str: String = row.get(7).map_err(read)?;
    let created_str: String = row.get(8).map_err(read)?;
    let updated_str: String = row.get(9).map_err(read)?;
    let claimed_str: Option<String> = row.get(10).ok();
    let sent_str: Option<String> = row.get(11).ok();

    Ok(SendRecord {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        campaign_ident: row.get(1).map_err(read)?,
        subject_kind: parse_kind(&kind_str)?,
        subject_id: row.get(3).map_err(read)?,
        recipient: row.get(4).map_err(read)?,
        subject_line: row.get(5).map_err(read)?,
        body: row.get(6).map_err(read)?,
        // Unknown statuses count as handled.
        status: status_str.parse().unwrap_or(SendStatus::Sending),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        claimed_at: parse_optional_datetime(&claimed_str),
        sent_at: parse_optional_datetime(&sent_str),
    })
}

// ── MailStore implementation ────────────────────────────────────────

#[async_trait]
impl MailStore for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Subjects ────────────────────────────────────────────────────

    async fn upsert_subject(&self, record: &SubjectRecord) -> Result<(), DatabaseError> {
        let fields = serde_json::to_string(&record.fields)
            .map_err(|e| DatabaseError::Serialization(format!("subject fields: {e}")))?;
        self.conn()
            .execute(
                "INSERT INTO subjects (kind, id, email, gets_emails, fields, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (kind, id) DO UPDATE SET
                    email = excluded.email,
                    gets_emails = excluded.gets_emails,
                    fields = excluded.fields,
                    updated_at = excluded.updated_at",
                params![
                    record.kind.as_str(),
                    record.id.as_str(),
                    record.email.as_str(),
                    i64::from(record.gets_emails),
                    fields,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_subject: {e}")))?;
        Ok(())
    }

    async fn subjects(
        &self,
        kind: SubjectKind,
        query: &SubjectQuery,
    ) -> Result<Vec<SubjectRecord>, DatabaseError> {
        let mut sql = format!("SELECT {SUBJECT_COLUMNS} FROM subjects WHERE kind = ?1");
        let mut values = vec![libsql::Value::Text(kind.as_str().to_string())];

        for (field, value) in &query.filters {
            values.push(libsql::Value::Text(format!("$.{field}")));
            let path_param = values.len();
            if value.is_null() {
                sql.push_str(&format!(" AND json_extract(fields, ?{path_param}) IS NULL"));
            } else {
                values.push(filter_value(value));
                let value_param = values.len();
                sql.push_str(&format!(
                    " AND json_extract(fields, ?{path_param}) = ?{value_param}"
                ));
            }
        }
        sql.push_str(" ORDER BY id");

        let mut rows = self
            .conn()
            .query(&sql, libsql::params_from_iter(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("subjects: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("subjects: {e}")))?
        {
            records.push(row_to_subject(&row)?);
        }
        Ok(records)
    }

    // ── Campaigns ───────────────────────────────────────────────────

    async fn upsert_campaign(&self, row: &CampaignRow) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO campaigns ({CAMPAIGN_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                     ON CONFLICT (ident) DO UPDATE SET
                        kind = excluded.kind,
                        subject = excluded.subject,
                        template = excluded.template,
                        template_source = excluded.template_source,
                        template_missing = excluded.template_missing,
                        sender = excluded.sender,
                        needs_approval = excluded.needs_approval,
                        active_after = excluded.active_after,
                        active_before = excluded.active_before,
                        allow_at_the_con = excluded.allow_at_the_con,
                        allow_post_con = excluded.allow_post_con,
                        orphaned = excluded.orphaned,
                        updated_at = excluded.updated_at"
                ),
                params![
                    row.ident.as_str(),
                    row.kind.as_str(),
                    row.subject.as_str(),
                    row.template.as_str(),
                    opt_text(row.template_source.as_deref()),
                    i64::from(row.template_missing),
                    row.sender.as_str(),
                    i64::from(row.needs_approval),
                    i64::from(row.approved),
                    opt_time(row.active_after),
                    opt_time(row.active_before),
                    i64::from(row.allow_at_the_con),
                    i64::from(row.allow_post_con),
                    i64::from(row.orphaned),
                    row.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_campaign: {e}")))?;

        debug!(ident = %row.ident, "Campaign row upserted");
        Ok(())
    }

    async fn get_campaign(&self, ident: &str) -> Result<Option<CampaignRow>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE ident = ?1"),
                params![ident],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_campaign: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                Ok(Some(row_to_campaign(&row)?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_campaign: {e}"))),
        }
    }

    async fn list_campaigns(&self) -> Result<Vec<CampaignRow>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns ORDER BY ident"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_campaigns: {e}")))?;

        let mut campaigns = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            campaigns.push(row_to_campaign(&row)?);
        }
        Ok(campaigns)
    }

    async fn set_approved(&self, ident: &str, approved: bool) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE campaigns SET approved = ?1, updated_at = ?2 WHERE ident = ?3",
                params![i64::from(approved), Utc::now().to_rfc3339(), ident],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_approved: {e}")))?;

        if changed > 0 {
            info!(ident = %ident, approved, "Campaign approval updated");
        }
        Ok(changed > 0)
    }

    async fn is_approved(&self, ident: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT approved FROM campaigns WHERE ident = ?1", params![ident])
            .await
            .map_err(|e| DatabaseError::Query(format!("is_approved: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) != 0),
            Ok(None) => Ok(false),
            Err(e) => Err(DatabaseError::Query(format!("is_approved: {e}"))),
        }
    }

    async fn set_orphaned(&self, ident: &str, orphaned: bool) -> Result<bool, DatabaseError> {
        let flag = i64::from(orphaned);
        let changed = self
            .conn()
            .execute(
                "UPDATE campaigns SET orphaned = ?1, updated_at = ?2
                 WHERE ident = ?3 AND orphaned != ?1",
                params![flag, Utc::now().to_rfc3339(), ident],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_orphaned: {e}")))?;
        Ok(changed > 0)
    }

    // ── Send log ────────────────────────────────────────────────────

    async fn get_send_record(
        &self,
        campaign_ident: &str,
        subject_id: &str,
    ) -> Result<Option<SendRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SEND_COLUMNS} FROM send_records
                     WHERE campaign_ident = ?1 AND subject_id = ?2"
                ),
                params![campaign_ident, subject_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_send_record: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                Ok(Some(row_to_send_record(&row)?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_send_record: {e}"))),
        }
    }

    async fn insert_send_record(&self, record: &SendRecord) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO send_records ({SEND_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    record.id.to_string(),
                    record.campaign_ident.as_str(),
                    record.subject_kind.as_str(),
                    record.subject_id.as_str(),
                    record.recipient.as_str(),
                    record.subject_line.as_str(),
                    record.body.as_str(),
                    record.status.as_str(),
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                    opt_text(record.claimed_at.map(claim_stamp).as_deref()),
                    opt_time(record.sent_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_send_record: {e}")))?;

        if inserted == 0 {
            debug!(
                campaign = %record.campaign_ident,
                subject = %record.subject_id,
                "Send record already exists"
            );
        }
        Ok(inserted == 1)
    }

    async fn claim_pending(
        &self,
        campaign_ident: &str,
        subject_id: &str,
        subject_line: &str,
        body: &str,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now();
        let claimed = self
            .conn()
            .execute(
                "UPDATE send_records
                 SET status = 'sending', subject_line = ?1, body = ?2,
                     updated_at = ?3, claimed_at = ?4
                 WHERE campaign_ident = ?5 AND subject_id = ?6 AND status = 'pending'",
                params![
                    subject_line,
                    body,
                    now.to_rfc3339(),
                    claim_stamp(now),
                    campaign_ident,
                    subject_id
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_pending: {e}")))?;
        Ok(claimed == 1)
    }

    async fn reclaim_stale(
        &self,
        campaign_ident: &str,
        subject_id: &str,
        subject_line: &str,
        body: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now();
        let taken = self
            .conn()
            .execute(
                "UPDATE send_records
                 SET subject_line = ?1, body = ?2, updated_at = ?3, claimed_at = ?4
                 WHERE campaign_ident = ?5 AND subject_id = ?6 AND status = 'sending'
                   AND (claimed_at IS NULL OR claimed_at < ?7)",
                params![
                    subject_line,
                    body,
                    now.to_rfc3339(),
                    claim_stamp(now),
                    campaign_ident,
                    subject_id,
                    claim_stamp(stale_before)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reclaim_stale: {e}")))?;
        Ok(taken == 1)
    }

    async fn mark_sent(&self, campaign_ident: &str, subject_id: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let updated = self
            .conn()
            .execute(
                "UPDATE send_records SET status = 'sent', sent_at = ?1, updated_at = ?1
                 WHERE campaign_ident = ?2 AND subject_id = ?3",
                params![now, campaign_ident, subject_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_sent: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "send_record".into(),
                id: format!("{campaign_ident}/{subject_id}"),
            });
        }
        Ok(())
    }

    async fn release_claim(
        &self,
        campaign_ident: &str,
        subject_id: &str,
        revert_to_pending: bool,
    ) -> Result<(), DatabaseError> {
        let result = if revert_to_pending {
            self.conn()
                .execute(
                    "UPDATE send_records SET status = 'pending', updated_at = ?1
                     WHERE campaign_ident = ?2 AND subject_id = ?3 AND status = 'sending'",
                    params![Utc::now().to_rfc3339(), campaign_ident, subject_id],
                )
                .await
        } else {
            self.conn()
                .execute(
                    "DELETE FROM send_records
                     WHERE campaign_ident = ?1 AND subject_id = ?2 AND status = 'sending'",
                    params![campaign_ident, subject_id],
                )
                .await
        };
        result.map_err(|e| DatabaseError::Query(format!("release_claim: {e}")))?;
        Ok(())
    }

    async fn discard_pending(
        &self,
        campaign_ident: &str,
        subject_id: &str,
    ) -> Result<bool, DatabaseError> {
        let removed = self
            .conn()
            .execute(
                "DELETE FROM send_records
                 WHERE campaign_ident = ?1 AND subject_id = ?2 AND status = 'pending'",
                params![campaign_ident, subject_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("discard_pending: {e}")))?;
        Ok(removed > 0)
    }

    async fn pending_counts(&self) -> Result<BTreeMap<String, i64>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT s.campaign_ident, COUNT(*) FROM send_records s
                 LEFT JOIN campaigns c ON c.ident = s.campaign_ident
                 WHERE s.status = 'pending' AND COALESCE(c.orphaned, 0) = 0
                 GROUP BY s.campaign_ident",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("pending_counts: {e}")))?;

        let mut counts = BTreeMap::new();
        while let Ok(Some(row)) = rows.next().await {
            let ident: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("pending_counts row parse: {e}")))?;
            let count: i64 = row.get(1).unwrap_or(0);
            counts.insert(ident, count);
        }
        Ok(counts)
    }

    async fn list_send_records(
        &self,
        campaign_ident: Option<&str>,
    ) -> Result<Vec<SendRecord>, DatabaseError> {
        let mut rows = match campaign_ident {
            Some(ident) => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {SEND_COLUMNS} FROM send_records
                             WHERE campaign_ident = ?1 ORDER BY created_at, subject_id"
                        ),
                        params![ident],
                    )
                    .await
            }
            None => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {SEND_COLUMNS} FROM send_records \
                             ORDER BY created_at, subject_id"
                        ),
                        (),
                    )
                    .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("list_send_records: {e}")))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            records.push(row_to_send_record(&row)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::{CampaignDefinition, Predicate};
    use serde_json::json;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn campaign(ident: &str) -> CampaignDefinition {
        CampaignDefinition::new(
            SubjectKind::Attendee,
            "Welcome",
            "welcome.txt",
            Predicate::always(),
            ident,
        )
    }

    fn attendee(id: &str) -> SubjectRecord {
        SubjectRecord::new(SubjectKind::Attendee, id, format!("{id}@example.com"))
            .with_field("paid", true)
            .with_field("badge_type", "attendee")
    }

    fn send(ident: &str, subject_id: &str, status: SendStatus) -> SendRecord {
        SendRecord::new(&campaign(ident), &attendee(subject_id), "Welcome", "Hi", status)
    }

    // ── Subjects ────────────────────────────────────────────────────

    #[tokio::test]
    async fn subjects_filter_by_kind_and_fields() {
        let db = test_db().await;
        db.upsert_subject(&attendee("a-1")).await.unwrap();
        db.upsert_subject(&attendee("a-2").with_field("paid", false))
            .await
            .unwrap();
        db.upsert_subject(&SubjectRecord::new(SubjectKind::Group, "g-1", "g@example.com"))
            .await
            .unwrap();

        let all = db
            .subjects(SubjectKind::Attendee, &SubjectQuery::all())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let paid = db
            .subjects(SubjectKind::Attendee, &SubjectQuery::all().eq("paid", true))
            .await
            .unwrap();
        assert_eq!(paid.len(), 1);
        assert_eq!(paid[0].id, "a-1");
        assert_eq!(paid[0].str_field("badge_type").unwrap(), "attendee");

        let by_badge = db
            .subjects(
                SubjectKind::Attendee,
                &SubjectQuery::all().eq("badge_type", "staff"),
            )
            .await
            .unwrap();
        assert!(by_badge.is_empty());
    }

    #[tokio::test]
    async fn subject_upsert_replaces() {
        let db = test_db().await;
        db.upsert_subject(&attendee("a-1")).await.unwrap();
        db.upsert_subject(&attendee("a-1").opted_out().with_field("paid", json!(false)))
            .await
            .unwrap();

        let all = db
            .subjects(SubjectKind::Attendee, &SubjectQuery::all())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert!(!all[0].gets_emails);
        assert!(!all[0].bool_field("paid").unwrap());
    }

    // ── Campaigns ───────────────────────────────────────────────────

    #[tokio::test]
    async fn upsert_preserves_approval() {
        let db = test_db().await;
        let row = CampaignRow::from_definition(&campaign("welcome"), "regdesk@example.com", None);
        db.upsert_campaign(&row).await.unwrap();
        assert!(!db.is_approved("welcome").await.unwrap());

        assert!(db.set_approved("welcome", true).await.unwrap());
        db.upsert_campaign(&row).await.unwrap();
        assert!(db.is_approved("welcome").await.unwrap());

        let stored = db.get_campaign("welcome").await.unwrap().unwrap();
        assert!(stored.template_missing);
        assert!(stored.approved);
        assert!(stored.same_definition(&row));
    }

    #[tokio::test]
    async fn approve_unknown_campaign() {
        let db = test_db().await;
        assert!(!db.set_approved("nope", true).await.unwrap());
        assert!(!db.is_approved("nope").await.unwrap());
    }

    #[tokio::test]
    async fn orphan_flag_reports_changes() {
        let db = test_db().await;
        let row =
            CampaignRow::from_definition(&campaign("old"), "regdesk@example.com", Some("inline"));
        db.upsert_campaign(&row).await.unwrap();

        assert!(db.set_orphaned("old", true).await.unwrap());
        assert!(!db.set_orphaned("old", true).await.unwrap());
        assert!(db.get_campaign("old").await.unwrap().unwrap().orphaned);
    }

    // ── Send log ────────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_is_once_per_pair() {
        let db = test_db().await;
        let first = send("welcome", "a-1", SendStatus::Sending);
        assert!(db.insert_send_record(&first).await.unwrap());
        let duplicate = send("welcome", "a-1", SendStatus::Sending);
        assert!(!db.insert_send_record(&duplicate).await.unwrap());
        let other = send("welcome", "a-2", SendStatus::Sending);
        assert!(db.insert_send_record(&other).await.unwrap());
        assert_eq!(db.list_send_records(Some("welcome")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn pending_claim_and_send() {
        let db = test_db().await;
        db.insert_send_record(&send("welcome", "a-1", SendStatus::Pending))
            .await
            .unwrap();

        assert!(db.claim_pending("welcome", "a-1", "Welcome!", "Hi there").await.unwrap());
        assert!(!db.claim_pending("welcome", "a-1", "Welcome!", "Hi there").await.unwrap());

        db.mark_sent("welcome", "a-1").await.unwrap();
        let record = db.get_send_record("welcome", "a-1").await.unwrap().unwrap();
        assert_eq!(record.status, SendStatus::Sent);
        assert_eq!(record.body, "Hi there");
        assert!(record.sent_at.is_some());
    }

    #[tokio::test]
    async fn stale_claims_are_taken_over_once() {
        let db = test_db().await;
        let mut abandoned = send("welcome", "a-1", SendStatus::Sending);
        abandoned.claimed_at = Some(Utc::now() - chrono::Duration::hours(2));
        db.insert_send_record(&abandoned).await.unwrap();
        db.insert_send_record(&send("welcome", "a-2", SendStatus::Sending))
            .await
            .unwrap();

        let stale_before = Utc::now() - chrono::Duration::minutes(15);
        let record = db.get_send_record("welcome", "a-1").await.unwrap().unwrap();
        assert!(record.claim_expired(stale_before));

        assert!(db.reclaim_stale("welcome", "a-1", "s", "b", stale_before).await.unwrap());
        // The takeover refreshed the claim.
        assert!(!db.reclaim_stale("welcome", "a-1", "s", "b", stale_before).await.unwrap());
        // Fresh claims are left to their owner.
        assert!(!db.reclaim_stale("welcome", "a-2", "s", "b", stale_before).await.unwrap());

        db.mark_sent("welcome", "a-1").await.unwrap();
        assert!(!db.reclaim_stale("welcome", "a-1", "s", "b", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn mark_sent_missing_record() {
        let db = test_db().await;
        assert!(matches!(
            db.mark_sent("welcome", "a-1").await,
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn release_claim_deletes_or_reverts() {
        let db = test_db().await;
        db.insert_send_record(&send("welcome", "a-1", SendStatus::Sending))
            .await
            .unwrap();
        db.release_claim("welcome", "a-1", false).await.unwrap();
        assert!(db.get_send_record("welcome", "a-1").await.unwrap().is_none());

        db.insert_send_record(&send("welcome", "a-2", SendStatus::Pending))
            .await
            .unwrap();
        db.claim_pending("welcome", "a-2", "s", "b").await.unwrap();
        db.release_claim("welcome", "a-2", true).await.unwrap();
        let record = db.get_send_record("welcome", "a-2").await.unwrap().unwrap();
        assert_eq!(record.status, SendStatus::Pending);
    }

    #[tokio::test]
    async fn release_leaves_sent_records_alone() {
        let db = test_db().await;
        db.insert_send_record(&send("welcome", "a-1", SendStatus::Sending))
            .await
            .unwrap();
        db.mark_sent("welcome", "a-1").await.unwrap();
        db.release_claim("welcome", "a-1", false).await.unwrap();
        assert!(db.get_send_record("welcome", "a-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn discard_only_touches_pending() {
        let db = test_db().await;
        db.insert_send_record(&send("welcome", "a-1", SendStatus::Pending)).await.unwrap();
        db.insert_send_record(&send("welcome", "a-2", SendStatus::Sent)).await.unwrap();

        assert!(db.discard_pending("welcome", "a-1").await.unwrap());
        assert!(!db.discard_pending("welcome", "a-2").await.unwrap());
        assert!(db.get_send_record("welcome", "a-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn pending_counts_skip_orphans() {
        let db = test_db().await;
        for ident in ["welcome", "old"] {
            let row = CampaignRow::from_definition(&campaign(ident), "regdesk@example.com", None);
            db.upsert_campaign(&row).await.unwrap();
        }
        db.insert_send_record(&send("welcome", "a-1", SendStatus::Pending)).await.unwrap();
        db.insert_send_record(&send("welcome", "a-2", SendStatus::Pending)).await.unwrap();
        db.insert_send_record(&send("welcome", "a-3", SendStatus::Sent)).await.unwrap();
        db.insert_send_record(&send("old", "a-1", SendStatus::Pending)).await.unwrap();
        db.set_orphaned("old", true).await.unwrap();

        let counts = db.pending_counts().await.unwrap();
        assert_eq!(counts.get("welcome"), Some(&2));
        assert!(!counts.contains_key("old"));
    }
}
