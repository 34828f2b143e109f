//! `MailStore` trait: the single async interface for mailer persistence.
//!
//! Covers three tables: subject records (the bundled stand-in for the host
//! application's data), the campaign mirror, and the send log.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::campaign::{CampaignDefinition, SubjectQuery};
use crate::error::DatabaseError;
use crate::subject::{SubjectKind, SubjectRecord};

/// State of one (campaign, subject) send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    /// Eligible, waiting for the campaign to be approved.
    Pending,
    /// Claimed by a dispatcher; transmission in progress. A record left in
    /// this state by a crash is treated as handled.
    Sending,
    Sent,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendStatus::Pending => "pending",
            SendStatus::Sending => "sending",
            SendStatus::Sent => "sent",
        }
    }
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SendStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SendStatus::Pending),
            "sending" => Ok(SendStatus::Sending),
            "sent" => Ok(SendStatus::Sent),
            other => Err(format!("unknown send status: {other}")),
        }
    }
}

/// A persisted send-log entry, unique per (campaign, subject).
#[derive(Debug, Clone, Serialize)]
pub struct SendRecord {
    pub id: Uuid,
    pub campaign_ident: String,
    pub subject_kind: SubjectKind,
    pub subject_id: String,
    pub recipient: String,
    /// Rendered subject line.
    pub subject_line: String,
    /// Rendered body.
    pub body: String,
    pub status: SendStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the current `sending` claim was taken.
    pub claimed_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl SendRecord {
    pub fn new(
        campaign: &CampaignDefinition,
        record: &SubjectRecord,
        subject_line: &str,
        body: &str,
        status: SendStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            campaign_ident: campaign.ident.clone(),
            subject_kind: record.kind,
            subject_id: record.id.clone(),
            recipient: record.email.clone(),
            subject_line: subject_line.to_string(),
            body: body.to_string(),
            status,
            created_at: now,
            updated_at: now,
            claimed_at: (status == SendStatus::Sending).then_some(now),
            sent_at: None,
        }
    }

    /// True for a `sending` record claimed before `stale_before`.
    pub fn claim_expired(&self, stale_before: DateTime<Utc>) -> bool {
        self.status == SendStatus::Sending && self.claimed_at.is_none_or(|at| at < stale_before)
    }
}

/// Persisted mirror of a registered campaign.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignRow {
    pub ident: String,
    pub kind: SubjectKind,
    pub subject: String,
    pub template: String,
    /// Where the template was resolved from; `None` when missing.
    pub template_source: Option<String>,
    pub template_missing: bool,
    pub sender: String,
    pub needs_approval: bool,
    /// Set by administrators; reconciliation never changes it.
    pub approved: bool,
    pub active_after: Option<DateTime<Utc>>,
    pub active_before: Option<DateTime<Utc>>,
    pub allow_at_the_con: bool,
    pub allow_post_con: bool,
    /// The ident is no longer registered.
    pub orphaned: bool,
    pub updated_at: DateTime<Utc>,
}

impl CampaignRow {
    /// Mirror row for a registered definition. `approved` starts false and
    /// is left alone by [`MailStore::upsert_campaign`] on existing rows.
    pub fn from_definition(
        definition: &CampaignDefinition,
        sender: &str,
        template_source: Option<&str>,
    ) -> Self {
        Self {
            ident: definition.ident.clone(),
            kind: definition.kind,
            subject: definition.subject.clone(),
            template: definition.template.clone(),
            template_source: template_source.map(str::to_string),
            template_missing: template_source.is_none(),
            sender: sender.to_string(),
            needs_approval: definition.needs_approval,
            approved: false,
            active_after: definition.window.active_after,
            active_before: definition.window.active_before,
            allow_at_the_con: definition.allow_at_the_con,
            allow_post_con: definition.allow_post_con,
            orphaned: false,
            updated_at: Utc::now(),
        }
    }

    /// True if the registry-owned columns match `other`.
    pub fn same_definition(&self, other: &CampaignRow) -> bool {
        self.kind == other.kind
            && self.subject == other.subject
            && self.template == other.template
            && self.template_source == other.template_source
            && self.template_missing == other.template_missing
            && self.sender == other.sender
            && self.needs_approval == other.needs_approval
            && self.active_after == other.active_after
            && self.active_before == other.active_before
            && self.allow_at_the_con == other.allow_at_the_con
            && self.allow_post_con == other.allow_post_con
            && self.orphaned == other.orphaned
    }
}

/// Backend-agnostic persistence for the mailer.
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Subjects ────────────────────────────────────────────────────

    /// Insert or replace a subject record.
    async fn upsert_subject(&self, record: &SubjectRecord) -> Result<(), DatabaseError>;

    /// Records of one kind matching every filter in `query`.
    async fn subjects(
        &self,
        kind: SubjectKind,
        query: &SubjectQuery,
    ) -> Result<Vec<SubjectRecord>, DatabaseError>;

    // ── Campaigns ───────────────────────────────────────────────────

    /// Insert a campaign row, or update every column except `approved`.
    async fn upsert_campaign(&self, row: &CampaignRow) -> Result<(), DatabaseError>;

    async fn get_campaign(&self, ident: &str) -> Result<Option<CampaignRow>, DatabaseError>;

    async fn list_campaigns(&self) -> Result<Vec<CampaignRow>, DatabaseError>;

    /// Set the approval flag. Returns false if the campaign is unknown.
    async fn set_approved(&self, ident: &str, approved: bool) -> Result<bool, DatabaseError>;

    /// Approval flag; unknown campaigns are unapproved.
    async fn is_approved(&self, ident: &str) -> Result<bool, DatabaseError>;

    /// Set the orphaned flag. Returns true if the stored value changed.
    async fn set_orphaned(&self, ident: &str, orphaned: bool) -> Result<bool, DatabaseError>;

    // ── Send log ────────────────────────────────────────────────────

    async fn get_send_record(
        &self,
        campaign_ident: &str,
        subject_id: &str,
    ) -> Result<Option<SendRecord>, DatabaseError>;

    /// Insert `record` unless the pair already has one. Returns true if
    /// this call inserted it.
    async fn insert_send_record(&self, record: &SendRecord) -> Result<bool, DatabaseError>;

    /// Atomically move a `pending` record to `sending`, refreshing its
    /// rendered content. Returns true if this call made the transition.
    async fn claim_pending(
        &self,
        campaign_ident: &str,
        subject_id: &str,
        subject_line: &str,
        body: &str,
    ) -> Result<bool, DatabaseError>;

    /// Atomically take over a `sending` record whose claim is older than
    /// `stale_before`. Returns true if this call took it.
    async fn reclaim_stale(
        &self,
        campaign_ident: &str,
        subject_id: &str,
        subject_line: &str,
        body: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn mark_sent(&self, campaign_ident: &str, subject_id: &str) -> Result<(), DatabaseError>;

    /// Undo a `sending` claim after a failed transmission: back to
    /// `pending` when the record was promoted from pending, otherwise
    /// removed so the pair is retried from scratch.
    async fn release_claim(
        &self,
        campaign_ident: &str,
        subject_id: &str,
        revert_to_pending: bool,
    ) -> Result<(), DatabaseError>;

    /// Remove a `pending` record whose pair is no longer eligible. Returns
    /// true if a record was removed.
    async fn discard_pending(
        &self,
        campaign_ident: &str,
        subject_id: &str,
    ) -> Result<bool, DatabaseError>;

    /// Pending-approval counts per campaign, excluding orphaned campaigns
    /// and campaigns with nothing pending.
    async fn pending_counts(&self) -> Result<BTreeMap<String, i64>, DatabaseError>;

    /// Send records, optionally restricted to one campaign.
    async fn list_send_records(
        &self,
        campaign_ident: Option<&str>,
    ) -> Result<Vec<SendRecord>, DatabaseError>;
}
