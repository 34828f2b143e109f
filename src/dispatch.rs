//! Batch dispatch of campaign emails.
//!
//! For every registered campaign, the dispatcher loads subject records of
//! the campaign's kind and evaluates each pair. Eligible pairs are claimed
//! in the send log before anything is transmitted; only the caller that
//! wins the claim transmits, and a failed transmission releases the claim
//! so the pair is retried on the next run.
//!
//! A claim older than the claim lease is assumed to belong to a run that
//! died between claiming and recording the send. It is taken over and
//! transmitted again, so a crash can duplicate an email but never lose it.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::campaign::{CampaignDefinition, CampaignRegistry, EvalContext};
use crate::config::DEFAULT_CLAIM_LEASE_SECS;
use crate::eligibility::{Eligibility, evaluate};
use crate::error::DatabaseError;
use crate::store::{MailStore, SendRecord, SendStatus};
use crate::subject::SubjectRecord;
use crate::template::{TemplateRegistry, render_context};
use crate::transport::{OutgoingEmail, Transport};

/// A (campaign, record) pair that could not be handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairError {
    pub campaign: String,
    pub subject_id: String,
    pub error: String,
}

/// Outcome of one dispatch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Emails transmitted this run.
    pub sent: usize,
    /// Pending-approval records created this run.
    pub newly_pending: usize,
    /// Stale `sending` claims taken over this run.
    pub reclaimed: usize,
    /// Transmission failures; each pair is retried next run.
    pub failures: Vec<PairError>,
    /// Campaigns skipped because their template could not be rendered.
    pub template_errors: BTreeMap<String, String>,
    /// Records skipped because a predicate raised an error.
    pub predicate_errors: Vec<PairError>,
    /// Pending-approval counts per campaign after the run.
    pub pending_counts: BTreeMap<String, i64>,
}

/// How an eligible pair gets claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    /// No record yet: insert a fresh `sending` record.
    Fresh,
    /// Promote an approved `pending` record.
    Pending,
    /// Take over an abandoned `sending` record.
    Stale,
}

pub struct Dispatcher {
    registry: Arc<CampaignRegistry>,
    templates: Arc<TemplateRegistry>,
    store: Arc<dyn MailStore>,
    transport: Arc<dyn Transport>,
    claim_lease: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<CampaignRegistry>,
        templates: Arc<TemplateRegistry>,
        store: Arc<dyn MailStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            registry,
            templates,
            store,
            transport,
            claim_lease: Duration::seconds(DEFAULT_CLAIM_LEASE_SECS),
        }
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// Run every campaign once as of `now`.
    ///
    /// Store errors abort the run. Template, predicate, and transport
    /// errors are collected in the report and never stop other campaigns.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<DispatchReport, DatabaseError> {
        let mut report = DispatchReport::default();

        for campaign in self.registry.list() {
            if let Err(e) = self.templates.resolve(&campaign.template) {
                warn!(
                    campaign = %campaign.ident,
                    error = %e,
                    "Skipping campaign, template missing"
                );
                report
                    .template_errors
                    .insert(campaign.ident.clone(), e.to_string());
                continue;
            }
            self.run_campaign(&campaign, now, &mut report).await?;
        }

        report.pending_counts = self.store.pending_counts().await?;
        info!(
            transport = self.transport.name(),
            sent = report.sent,
            newly_pending = report.newly_pending,
            reclaimed = report.reclaimed,
            failures = report.failures.len(),
            template_errors = report.template_errors.len(),
            predicate_errors = report.predicate_errors.len(),
            "Dispatch run complete"
        );
        Ok(report)
    }

    async fn run_campaign(
        &self,
        campaign: &CampaignDefinition,
        now: DateTime<Utc>,
        report: &mut DispatchReport,
    ) -> Result<(), DatabaseError> {
        let event = self.registry.event();
        let ctx = EvalContext::new(now, event);
        let approved = !campaign.needs_approval || self.store.is_approved(&campaign.ident).await?;
        let records = self.store.subjects(campaign.kind, &campaign.query).await?;
        debug!(
            campaign = %campaign.ident,
            candidates = records.len(),
            approved,
            "Evaluating campaign"
        );

        // Claims are stamped with wall-clock time, not the evaluation time.
        let stale_before = Utc::now() - self.claim_lease;

        for record in &records {
            let existing = self
                .store
                .get_send_record(&campaign.ident, &record.id)
                .await?;
            let claim = match existing.as_ref() {
                None => Claim::Fresh,
                Some(r) if r.status == SendStatus::Pending => Claim::Pending,
                Some(r) if r.status == SendStatus::Sending && r.claim_expired(stale_before) => {
                    Claim::Stale
                }
                Some(_) => continue,
            };
            let pending = claim == Claim::Pending;

            match evaluate(campaign, record, &ctx, approved) {
                Eligibility::Send => {
                    if let Some(email) = self.render(campaign, record, report) {
                        self.claim_and_send(campaign, record, email, claim, stale_before, report)
                            .await?;
                    }
                }
                // A stale claim was approved once; it is only retried while
                // the pair is still sendable.
                _ if claim == Claim::Stale => {}
                Eligibility::AwaitingApproval => {
                    if pending {
                        continue;
                    }
                    if let Some(email) = self.render(campaign, record, report) {
                        let entry = SendRecord::new(
                            campaign,
                            record,
                            &email.subject,
                            &email.body,
                            SendStatus::Pending,
                        );
                        if self.store.insert_send_record(&entry).await? {
                            report.newly_pending += 1;
                        }
                    }
                }
                Eligibility::PredicateFailed(e) => {
                    report.predicate_errors.push(PairError {
                        campaign: campaign.ident.clone(),
                        subject_id: record.id.clone(),
                        error: e.to_string(),
                    });
                    if pending {
                        self.store.discard_pending(&campaign.ident, &record.id).await?;
                    }
                }
                _ => {
                    if pending {
                        debug!(
                            campaign = %campaign.ident,
                            record = %record.id,
                            "No longer eligible, discarding pending send"
                        );
                        self.store.discard_pending(&campaign.ident, &record.id).await?;
                    }
                }
            }
        }
        Ok(())
    }

    fn render(
        &self,
        campaign: &CampaignDefinition,
        record: &SubjectRecord,
        report: &mut DispatchReport,
    ) -> Option<OutgoingEmail> {
        let event = self.registry.event();
        let context = render_context(campaign, record, event);
        match self
            .templates
            .render(&campaign.template, &context, campaign.format)
        {
            Ok(body) => Some(OutgoingEmail {
                sender: campaign.sender_or(&event.regdesk_email).to_string(),
                to: vec![record.email.clone()],
                cc: campaign.cc.clone(),
                bcc: campaign.bcc.clone(),
                reply_to: campaign.reply_to.clone(),
                subject: campaign.subject.clone(),
                body,
                format: campaign.format,
            }),
            Err(e) => {
                report
                    .template_errors
                    .insert(campaign.ident.clone(), e.to_string());
                None
            }
        }
    }

    async fn claim_and_send(
        &self,
        campaign: &CampaignDefinition,
        record: &SubjectRecord,
        email: OutgoingEmail,
        claim: Claim,
        stale_before: DateTime<Utc>,
        report: &mut DispatchReport,
    ) -> Result<(), DatabaseError> {
        let claimed = match claim {
            Claim::Fresh => {
                let entry = SendRecord::new(
                    campaign,
                    record,
                    &email.subject,
                    &email.body,
                    SendStatus::Sending,
                );
                self.store.insert_send_record(&entry).await?
            }
            Claim::Pending => {
                self.store
                    .claim_pending(&campaign.ident, &record.id, &email.subject, &email.body)
                    .await?
            }
            Claim::Stale => {
                let taken = self
                    .store
                    .reclaim_stale(
                        &campaign.ident,
                        &record.id,
                        &email.subject,
                        &email.body,
                        stale_before,
                    )
                    .await?;
                if taken {
                    warn!(
                        campaign = %campaign.ident,
                        record = %record.id,
                        "Taking over abandoned send claim"
                    );
                    report.reclaimed += 1;
                }
                taken
            }
        };
        if !claimed {
            debug!(campaign = %campaign.ident, record = %record.id, "Already claimed, skipping");
            return Ok(());
        }

        match self.transport.send(&email).await {
            Ok(()) => {
                self.store.mark_sent(&campaign.ident, &record.id).await?;
                report.sent += 1;
            }
            Err(e) => {
                warn!(
                    campaign = %campaign.ident,
                    record = %record.id,
                    error = %e,
                    "Transmission failed, will retry next run"
                );
                self.store
                    .release_claim(&campaign.ident, &record.id, claim == Claim::Pending)
                    .await?;
                report.failures.push(PairError {
                    campaign: campaign.ident.clone(),
                    subject_id: record.id.clone(),
                    error: e.to_string(),
                });
            }
        }
        Ok(())
    }
}
