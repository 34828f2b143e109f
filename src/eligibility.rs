//! Eligibility evaluation for one (campaign, record) pair.
//!
//! A pair is sendable only when every check passes:
//! - the recipient has not opted out of email
//! - the campaign predicate matches the record
//! - `now` falls inside the campaign's active window
//! - the event phase allows it (at-the-con / post-con switches)
//! - the campaign is approved, if it needs approval
//!
//! Checks run in that order and the first failure is reported.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::campaign::{CampaignDefinition, EvalContext};
use crate::config::EventConfig;
use crate::error::PredicateError;
use crate::subject::SubjectRecord;

/// Where `now` sits relative to the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPhase {
    BeforeCon,
    /// `epoch <= now <= eschaton`.
    AtTheCon,
    /// `now > eschaton`.
    PostCon,
}

impl EventPhase {
    pub fn at(now: DateTime<Utc>, event: &EventConfig) -> Self {
        if now > event.eschaton {
            EventPhase::PostCon
        } else if now >= event.epoch {
            EventPhase::AtTheCon
        } else {
            EventPhase::BeforeCon
        }
    }
}

/// Outcome of evaluating one pair.
#[derive(Debug, Clone, PartialEq)]
pub enum Eligibility {
    /// Eligible; transmit now.
    Send,
    /// Would send, but the campaign has not been approved yet.
    AwaitingApproval,
    /// Recipient opted out of email.
    Suppressed,
    /// Predicate returned false.
    Filtered,
    /// Predicate raised an error; the record is skipped.
    PredicateFailed(PredicateError),
    OutsideWindow,
    /// The event is running and the campaign does not allow at-the-con sends.
    AtTheCon,
    /// The event is over and the campaign does not allow post-con sends.
    PostCon,
}

impl Eligibility {
    /// True for `Send` and `AwaitingApproval`.
    pub fn would_send_if_approved(&self) -> bool {
        matches!(self, Eligibility::Send | Eligibility::AwaitingApproval)
    }

    pub fn is_send(&self) -> bool {
        matches!(self, Eligibility::Send)
    }
}

/// Decide whether `campaign` should go to `record` at `ctx.now`.
pub fn evaluate(
    campaign: &CampaignDefinition,
    record: &SubjectRecord,
    ctx: &EvalContext<'_>,
    approved: bool,
) -> Eligibility {
    if !record.gets_emails {
        return Eligibility::Suppressed;
    }

    match campaign.predicate.eval(record, ctx) {
        Ok(true) => {}
        Ok(false) => return Eligibility::Filtered,
        Err(e) => {
            warn!(
                campaign = %campaign.ident,
                record = %record.id,
                error = %e,
                "Predicate failed, treating record as ineligible"
            );
            return Eligibility::PredicateFailed(e);
        }
    }

    if !campaign.window.contains(ctx.now) {
        return Eligibility::OutsideWindow;
    }

    match EventPhase::at(ctx.now, ctx.event) {
        EventPhase::AtTheCon if !campaign.allow_at_the_con => return Eligibility::AtTheCon,
        EventPhase::PostCon if !campaign.allow_post_con => return Eligibility::PostCon,
        _ => {}
    }

    if campaign.needs_approval && !approved {
        debug!(campaign = %campaign.ident, record = %record.id, "Eligible pending approval");
        return Eligibility::AwaitingApproval;
    }

    Eligibility::Send
}
