//! Built-in convention campaigns.
//!
//! Registered once at startup from the event configuration. Campaigns tied
//! to optional features (attendee accounts, hotels, printed badges, the
//! volunteer agreement) are only registered when the feature is configured.
//! The check-in QR code and parental consent emails stay registered and
//! match nobody while their switch is off.
//!
//! Predicates read these record fields:
//!
//! - `attendee`: `paid` (`has_paid`, `need_not_pay`, `paid_by_group`,
//!   `not_paid`), `placeholder`, `staffing`, `badge_type`, `registered`,
//!   `admin_notes`, `admin_account`, `group`, `takes_shifts`,
//!   `shift_minutes`, `weighted_hours`, `ribbons`, `age_group_conf`, ...
//! - `attendee_account`: `imported`, `hashed`, `password_reset`,
//!   `is_sso_account`
//! - `group`: `amount_paid` (cents), `cost` (dollars), `leader_id`,
//!   `registered`, `unregistered_badges`
//! - `promo_code_group`: `buyer.amount_paid`
//! - `room`: `locked_in`
//!
//! Idents here are persisted send-history keys and must never be renamed.

use crate::campaign::model::CampaignDefinition;
use crate::campaign::predicate::{EvalContext, Predicate};
use crate::campaign::registry::CampaignRegistry;
use crate::campaign::window::DateRule;
use crate::config::{DeptChecklist, EventConfig};
use crate::error::{PredicateError, RegistryError};
use crate::subject::{SubjectKind, SubjectRecord};

const HAS_PAID: &str = "has_paid";
const NEED_NOT_PAY: &str = "need_not_pay";
const PAID_BY_GROUP: &str = "paid_by_group";

const ATTENDEE_BADGE: &str = "attendee";
const STAFF_BADGE: &str = "staff";
const CONTRACTOR_BADGE: &str = "contractor";

const VOLUNTEER_RIBBON: &str = "volunteer";

/// Hours of shifts a volunteer must work to keep hotel space.
const HOURS_FOR_HOTEL_SPACE: f64 = 30.0;

/// Register every built-in campaign for the registry's event.
pub fn register_defaults(registry: &CampaignRegistry) -> Result<(), RegistryError> {
    let event = registry.event().clone();

    for campaign in registration_campaigns(&event)
        .into_iter()
        .chain(placeholder_campaigns(&event))
        .chain(volunteer_campaigns(&event))
        .chain(event.dept_checklists.iter().map(|conf| dept_checklist_campaign(&event, conf)))
        .chain(hotel_campaigns(&event))
    {
        registry.register(campaign)?;
    }

    tracing::info!(count = registry.len(), "Built-in campaigns registered");
    Ok(())
}

// ── Registration workflow ───────────────────────────────────────────

fn registration_campaigns(event: &EventConfig) -> Vec<CampaignDefinition> {
    let mut campaigns = vec![
        CampaignDefinition::new(
            SubjectKind::Attendee,
            "{EVENT_NAME} registration confirmed",
            "reg_workflow/attendee_confirmation.html",
            Predicate::new(|a, _| {
                let paid = a.str_field("paid")?;
                Ok((paid == HAS_PAID && a.len_field("promo_code_groups")? == 0)
                    || (paid == NEED_NOT_PAY
                        && (a.flag("confirmed")
                            || a.flag("promo_code_id")
                            || a.flag("age_discount"))))
            }),
            "attendee_badge_confirmed",
        )
        .needs_approval(false)
        .allow_at_the_con(),
        CampaignDefinition::new(
            SubjectKind::PromoCodeGroup,
            "{EVENT_NAME} group registration successful",
            "reg_workflow/promo_code_group_confirmation.html",
            Predicate::new(|g, _| Ok(g.flag("buyer") && g.f64_field("buyer.amount_paid")? > 0.0)),
            "pc_group_payment_received",
        )
        .needs_approval(false)
        .allow_at_the_con(),
        CampaignDefinition::new(
            SubjectKind::Group,
            "{EVENT_NAME} group payment received",
            "reg_workflow/group_confirmation.html",
            Predicate::new(|g, _| {
                let cost = g.i64_field("cost")?;
                Ok(g.i64_field("amount_paid")? == cost * 100 && cost != 0 && g.flag("leader_id"))
            }),
            "group_payment_received",
        )
        .needs_approval(false),
        CampaignDefinition::new(
            SubjectKind::Attendee,
            "{EVENT_NAME} group registration confirmed",
            "reg_workflow/attendee_confirmation.html",
            Predicate::new(|a, _| {
                if !a.flag("group") {
                    return Ok(false);
                }
                let not_leader =
                    a.field("group.leader_id").and_then(|v| v.as_str()) != Some(a.id.as_str());
                Ok((not_leader || a.i64_field("group.cost")? == 0) && !a.truthy("placeholder")?)
            }),
            "attendee_group_reg_confirmation",
        )
        .needs_approval(false)
        .allow_at_the_con(),
        CampaignDefinition::new(
            SubjectKind::Attendee,
            "{EVENT_NAME} merch pre-order received",
            "reg_workflow/group_donation.txt",
            Predicate::new(|a, _| {
                let extra = a.f64_field("amount_extra")?;
                Ok(a.str_field("paid")? == PAID_BY_GROUP
                    && extra != 0.0
                    && a.f64_field("amount_paid")? >= extra * 100.0)
            }),
            "group_extra_payment_received",
        )
        .needs_approval(false)
        .sender(&event.merch_email),
        // Only sent for groups with unassigned badges, so these are safe
        // even when group preregistration is off.
        CampaignDefinition::new(
            SubjectKind::Group,
            "Reminder to pre-assign {EVENT_NAME} group badges",
            "reg_workflow/group_preassign_reminder.txt",
            Predicate::new(|g, ctx| {
                Ok(ctx.before(ctx.event.group_prereg_takedown)
                    && ctx.days_after(30, Some(g.datetime_field("registered")?))
                    && g.i64_field("unregistered_badges")? > 0)
            }),
            "group_preassign_badges_reminder",
        )
        .when(DateRule::before(event.group_prereg_takedown))
        .needs_approval(false)
        .sender(&event.regdesk_email),
        CampaignDefinition::new(
            SubjectKind::Group,
            "Last chance to pre-assign {EVENT_NAME} group badges",
            "reg_workflow/group_preassign_reminder.txt",
            Predicate::new(|g, ctx| {
                Ok(ctx.after(ctx.event.group_prereg_takedown)
                    && g.i64_field("unregistered_badges")? > 0)
            }),
            "group_preassign_badges_reminder_last_chance",
        )
        .when(DateRule::after(event.group_prereg_takedown))
        .needs_approval(false)
        .allow_at_the_con()
        .sender(&event.regdesk_email),
        CampaignDefinition::new(
            SubjectKind::Attendee,
            "Check in faster at {EVENT_NAME}",
            "reg_workflow/attendee_qrcode.html",
            Predicate::new(|a, ctx| {
                Ok(ctx.event.use_checkin_barcode && !a.flag("cannot_check_in_reason"))
            }),
            "qrcode_for_checkin",
        )
        .when(DateRule::days_before(7, event.epoch))
        .allow_at_the_con(),
        // Minors must bring a signed consent form.
        CampaignDefinition::new(
            SubjectKind::Attendee,
            "{EVENT_NAME} ({EVENT_DATE}) parental consent form reminder",
            "reg_workflow/under_18_reminder.txt",
            Predicate::new(|a, ctx| {
                Ok(ctx.event.consent_form_url.is_some()
                    && a.flag("age_group_conf.consent_form")
                    && ctx.days_after(14, Some(a.datetime_field("registered")?)))
            }),
            "under_18_parental_consent_reminder",
        )
        .when(DateRule::days_before(60, event.epoch))
        .allow_at_the_con(),
    ];

    if event.attendee_accounts_enabled {
        campaigns.push(
            CampaignDefinition::new(
                SubjectKind::AttendeeAccount,
                "{EVENT_NAME} account creation confirmed",
                "reg_workflow/account_confirmation.html",
                Predicate::new(|a, _| {
                    Ok(!a.truthy("imported")?
                        && a.truthy("hashed")?
                        && !a.flag("password_reset")
                        && !a.flag("is_sso_account"))
                }),
                "attendee_account_confirmed",
            )
            .needs_approval(false)
            .allow_at_the_con(),
        );
    }

    campaigns
}

// ── Placeholder badges ──────────────────────────────────────────────
//
// An admin-created "placeholder" badge asks its holder to fill in the rest
// of their registration. Staff imported before preregistration opens get
// their own wording. When preregistration has no opening date, every
// placeholder counts as created after it opened.

fn registered_before_prereg(
    a: &SubjectRecord,
    ctx: &EvalContext<'_>,
) -> Result<bool, PredicateError> {
    match ctx.event.prereg_open {
        Some(open) => Ok(a.datetime_field("registered")? <= open),
        None => Ok(false),
    }
}

fn mentions_staff_import(a: &SubjectRecord) -> bool {
    a.field("admin_notes")
        .and_then(|v| v.as_str())
        .is_some_and(|notes| notes.to_lowercase().contains("staff import"))
}

fn deferred_attendee_placeholder(
    a: &SubjectRecord,
    ctx: &EvalContext<'_>,
) -> Result<bool, PredicateError> {
    Ok(a.truthy("placeholder")?
        && registered_before_prereg(a, ctx)?
        && a.str_field("badge_type")? == ATTENDEE_BADGE
        && a.str_field("paid")? == NEED_NOT_PAY
        && !mentions_staff_import(a)
        && !a.flag("admin_account"))
}

fn staff_import_placeholder(
    a: &SubjectRecord,
    ctx: &EvalContext<'_>,
) -> Result<bool, PredicateError> {
    Ok(a.truthy("placeholder")?
        && registered_before_prereg(a, ctx)?
        && (a.flag("admin_account") || mentions_staff_import(a)))
}

fn volunteer_placeholder(a: &SubjectRecord, ctx: &EvalContext<'_>) -> Result<bool, PredicateError> {
    if !(a.flag("staffing") && a.truthy("placeholder")?) || registered_before_prereg(a, ctx)? {
        return Ok(false);
    }
    let badge = a.str_field("badge_type")?;
    Ok(badge != STAFF_BADGE && badge != CONTRACTOR_BADGE)
}

fn generic_placeholder(a: &SubjectRecord, ctx: &EvalContext<'_>) -> Result<bool, PredicateError> {
    Ok(a.truthy("placeholder")?
        && !deferred_attendee_placeholder(a, ctx)?
        && !staff_import_placeholder(a, ctx)?
        && !volunteer_placeholder(a, ctx)?
        && !registered_before_prereg(a, ctx)?)
}

fn placeholder_campaigns(event: &EventConfig) -> Vec<CampaignDefinition> {
    let last_chance_deadline = event.placeholder_deadline.or(event.uber_takedown);

    vec![
        CampaignDefinition::new(
            SubjectKind::Attendee,
            "Claim your badge for {EVENT_NAME} {EVENT_YEAR}!",
            "placeholders/regular.txt",
            Predicate::new(|a, ctx| {
                Ok(generic_placeholder(a, ctx)? && a.str_field("paid")? == NEED_NOT_PAY)
            }),
            "generic_badge_confirmation_comped",
        )
        .sender(&event.contact_email)
        .allow_at_the_con(),
        CampaignDefinition::new(
            SubjectKind::Attendee,
            "Please complete your {EVENT_NAME} {EVENT_YEAR} registration",
            "placeholders/regular.txt",
            Predicate::new(|a, ctx| {
                let converted = a
                    .field("admin_notes")
                    .and_then(|v| v.as_str())
                    .is_some_and(|n| n.to_lowercase().contains("converted badge"));
                Ok(generic_placeholder(a, ctx)?
                    && a.str_field("paid")? != NEED_NOT_PAY
                    && !converted)
            }),
            "generic_badge_confirmation",
        )
        .sender(&event.contact_email)
        .allow_at_the_con(),
        CampaignDefinition::new(
            SubjectKind::Attendee,
            "Claim your deferred badge for {EVENT_NAME} {EVENT_YEAR}!",
            "placeholders/deferred.html",
            Predicate::new(deferred_attendee_placeholder),
            "claim_deferred_badge",
        )
        .when(DateRule::after(event.prereg_open)),
        staffing_campaign(
            event,
            "Claim your Staff badge for {EVENT_NAME} {EVENT_YEAR}!",
            "placeholders/imported_volunteer.txt",
            Predicate::new(staff_import_placeholder),
            "volunteer_again_inquiry",
        ),
        staffing_campaign(
            event,
            "Claim your Volunteer badge for {EVENT_NAME} {EVENT_YEAR}",
            "placeholders/volunteer.txt",
            Predicate::new(volunteer_placeholder),
            "volunteer_badge_confirmation",
        ),
        CampaignDefinition::new(
            SubjectKind::Attendee,
            "{EVENT_NAME} Badge Confirmation Reminder",
            "placeholders/reminder.txt",
            Predicate::new(|a, ctx| {
                Ok(a.truthy("placeholder")?
                    && ctx.days_after(7, Some(a.datetime_field("registered")?)))
            }),
            "badge_confirmation_reminder",
        ),
        CampaignDefinition::new(
            SubjectKind::Attendee,
            "Last Chance to Accept Your {EVENT_NAME} ({EVENT_DATE}) Badge",
            "placeholders/reminder.txt",
            Predicate::field("placeholder"),
            "badge_confirmation_reminder_last_chance",
        )
        .when(DateRule::days_before(7, last_chance_deadline)),
    ]
}

// ── Volunteers ──────────────────────────────────────────────────────

/// A campaign for staffers only, sent from the staffing address.
fn staffing_campaign(
    event: &EventConfig,
    subject: &str,
    template: &str,
    filter: Predicate,
    ident: &str,
) -> CampaignDefinition {
    CampaignDefinition::new(
        SubjectKind::Attendee,
        subject,
        template,
        Predicate::new(|a, _| Ok(a.flag("staffing"))).and(filter),
        ident,
    )
    .sender(&event.staff_email)
}

fn not_contractor(a: &SubjectRecord) -> Result<bool, PredicateError> {
    Ok(a.str_field("badge_type")? != CONTRACTOR_BADGE)
}

fn has_ribbon(a: &SubjectRecord, ribbon: &str) -> bool {
    a.field("ribbons")
        .and_then(|v| v.as_array())
        .is_some_and(|ribbons| ribbons.iter().any(|r| r.as_str() == Some(ribbon)))
}

fn volunteer_campaigns(event: &EventConfig) -> Vec<CampaignDefinition> {
    let mut campaigns = vec![
        staffing_campaign(
            event,
            "Please complete your {EVENT_NAME} Staff/Volunteer Checklist",
            "shifts/created.txt",
            Predicate::always(),
            "volunteer_checklist_completion_request",
        )
        .when(DateRule::after(event.volunteer_checklist_open))
        .allow_at_the_con(),
        staffing_campaign(
            event,
            "{EVENT_NAME} ({EVENT_DATE}) shifts are live!",
            "shifts/shifts_created.txt",
            Predicate::new(|a, ctx| {
                let Some(created) = ctx.event.shifts_created else {
                    return Ok(false);
                };
                Ok(ctx.now >= created
                    && not_contractor(a)?
                    && a.truthy("takes_shifts")?
                    && a.datetime_field("registered")? <= created)
            }),
            "volunteer_shift_signup_notification",
        )
        .when(DateRule::before(event.prereg_takedown)),
        staffing_campaign(
            event,
            "Reminder to sign up for {EVENT_NAME} ({EVENT_DATE}) shifts",
            "shifts/reminder.txt",
            Predicate::new(|a, ctx| {
                let Some(created) = ctx.event.shifts_created else {
                    return Ok(false);
                };
                let since = a.datetime_field("registered")?.max(created);
                Ok(ctx.now >= created
                    && not_contractor(a)?
                    && ctx.days_after(14, Some(since))
                    && a.truthy("takes_shifts")?
                    && !a.flag("shift_minutes"))
            }),
            "volunteer_shift_signup_reminder",
        )
        .when(DateRule::before(event.prereg_takedown)),
        staffing_campaign(
            event,
            "Last chance to sign up for {EVENT_NAME} ({EVENT_DATE}) shifts",
            "shifts/reminder.txt",
            Predicate::new(|a, ctx| {
                let Some(created) = ctx.event.shifts_created else {
                    return Ok(false);
                };
                Ok(ctx.now >= created
                    && not_contractor(a)?
                    && ctx.event.prereg_takedown.is_none_or(|t| ctx.now < t)
                    && a.truthy("takes_shifts")?
                    && !a.flag("shift_minutes"))
            }),
            "volunteer_shift_signup_reminder_last_chance",
        )
        .when(DateRule::days_before(10, event.epoch)),
        staffing_campaign(
            event,
            "Still want to volunteer at {EVENT_NAME} ({EVENT_DATE})?",
            "shifts/volunteer_check.txt",
            Predicate::new(|a, ctx| {
                Ok(ctx.event.volunteer_checklist_open.is_some()
                    && not_contractor(a)?
                    && has_ribbon(a, VOLUNTEER_RIBBON)
                    && a.truthy("takes_shifts")?
                    && a.f64_field("weighted_hours")? == 0.0)
            }),
            "volunteer_still_interested_inquiry",
        )
        .when(DateRule::days_before(28, event.final_email_deadline)),
        staffing_campaign(
            event,
            "Your {EVENT_NAME} ({EVENT_DATE}) shift schedule",
            "shifts/schedule.html",
            Predicate::new(|a, ctx| {
                Ok(ctx.event.shifts_created.is_some()
                    && a.flag("weighted_hours")
                    && not_contractor(a)?)
            }),
            "volunteer_shift_schedule",
        )
        .when(DateRule::days_before(1, event.final_email_deadline))
        .allow_at_the_con(),
        staffing_campaign(
            event,
            "Please review your worked shifts for {EVENT_NAME}!",
            "shifts/shifts_worked.html",
            Predicate::new(|a, _| {
                Ok((a.flag("weighted_hours") || a.flag("nonshift_minutes")) && not_contractor(a)?)
            }),
            "volunteer_shifts_worked",
        )
        .when(DateRule::days_after(1, event.eschaton))
        .allow_post_con(true),
    ];

    if event.volunteer_agreement_enabled {
        campaigns.push(
            staffing_campaign(
                event,
                concat!(
                    "Reminder: Please agree to terms of ",
                    "{EVENT_NAME} ({EVENT_DATE}) volunteer agreement"
                ),
                "staffing/volunteer_agreement.txt",
                Predicate::new(|a, ctx| {
                    Ok(ctx.after(ctx.event.volunteer_checklist_open)
                        && !a.flag("agreed_to_volunteer_agreement"))
                }),
                "volunteer_agreement",
            )
            .when(DateRule::days_before(45, event.final_email_deadline)),
        );
    }

    if event.printed_badge_deadline.is_some() {
        campaigns.push(
            staffing_campaign(
                event,
                "Last chance to personalize your {EVENT_NAME} ({EVENT_DATE}) badge",
                "personalized_badges/volunteers.txt",
                Predicate::new(|a, _| {
                    Ok(a.flag("has_personalized_badge")
                        && a.truthy("placeholder")?
                        && not_contractor(a)?)
                }),
                "volunteer_personalized_badge_reminder",
            )
            .when(DateRule::days_before(7, event.printed_badge_deadline)),
        );
        campaigns.push(
            CampaignDefinition::new(
                SubjectKind::Attendee,
                "Personalized {EVENT_NAME} ({EVENT_DATE}) badges will be ordered next week",
                "personalized_badges/reminder.txt",
                Predicate::new(|a, _| {
                    Ok(a.flag("has_personalized_badge") && !a.truthy("placeholder")?)
                }),
                "personalized_badge_reminder",
            )
            .when(DateRule::days_before(7, event.printed_badge_deadline)),
        );
    }

    campaigns
}

/// Reminder for department heads who have not completed one checklist item.
fn dept_checklist_campaign(event: &EventConfig, conf: &DeptChecklist) -> CampaignDefinition {
    let slug = conf.slug.clone();
    let mut campaign = CampaignDefinition::new(
        SubjectKind::Attendee,
        &format!("{{EVENT_NAME}} Department Checklist: {}", conf.name),
        "shifts/dept_checklist.txt",
        Predicate::new(move |a, _| {
            if !a.flag("admin_account") {
                return Ok(false);
            }
            let depts = a
                .field("checklist_admin_depts")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            Ok(depts.iter().any(|dept| {
                !dept
                    .get("completed_items")
                    .and_then(|v| v.as_array())
                    .is_some_and(|items| items.iter().any(|i| i.as_str() == Some(slug.as_str())))
            }))
        }),
        &format!("department_checklist_{}", conf.name),
    )
    .when(DateRule::days_before(10, conf.deadline))
    .sender(&event.staff_email)
    .extra(serde_json::json!({ "conf": { "slug": conf.slug, "name": conf.name } }))
    .allow_post_con(conf.email_post_con);

    if conf.email_post_con {
        campaign = campaign.when(DateRule::after(event.epoch));
    }
    campaign
}

// ── Hotel ───────────────────────────────────────────────────────────

fn wants_hotel_space(a: &SubjectRecord) -> Result<bool, PredicateError> {
    Ok(not_contractor(a)?
        && a.flag("hotel_eligible")
        && a.len_field("hotel_requests")? == 0
        && a.truthy("takes_shifts")?)
}

fn short_of_hotel_hours(a: &SubjectRecord) -> Result<bool, PredicateError> {
    Ok(not_contractor(a)?
        && a.flag("hotel_shifts_required")
        && a.f64_field("weighted_hours")? < HOURS_FOR_HOTEL_SPACE)
}

fn hotel_campaigns(event: &EventConfig) -> Vec<CampaignDefinition> {
    if !event.hotels_enabled {
        return Vec::new();
    }

    let mut campaigns = vec![
        CampaignDefinition::new(
            SubjectKind::Attendee,
            "Want volunteer hotel room space at {EVENT_NAME}?",
            "hotel/hotel_rooms.txt",
            Predicate::new(|a, _| wants_hotel_space(a)),
            "volunteer_hotel_room_inquiry",
        )
        .sender(&event.room_email_sender)
        .when(DateRule::days_before_until(45, event.room_deadline, 14)),
        CampaignDefinition::new(
            SubjectKind::Attendee,
            "Reminder to sign up for {EVENT_NAME} hotel room space",
            "hotel/hotel_reminder.txt",
            Predicate::new(|a, _| wants_hotel_space(a)),
            "hotel_sign_up_reminder",
        )
        .sender(&event.room_email_sender)
        .when(DateRule::days_before_until(14, event.room_deadline, 2)),
        CampaignDefinition::new(
            SubjectKind::Attendee,
            "Last chance to sign up for {EVENT_NAME} hotel room space",
            "hotel/hotel_reminder.txt",
            Predicate::new(|a, _| wants_hotel_space(a)),
            "hotel_sign_up_reminder_last_chance",
        )
        .sender(&event.room_email_sender)
        .when(DateRule::days_before(2, event.room_deadline)),
        CampaignDefinition::new(
            SubjectKind::Attendee,
            "Reminder to meet your {EVENT_NAME} hotel room requirements",
            "hotel/hotel_hours.txt",
            Predicate::new(|a, _| short_of_hotel_hours(a)),
            "hotel_requirements_reminder",
        )
        .sender(&event.room_email_sender)
        .when(DateRule::days_before_until(14, event.final_email_deadline, 7)),
        CampaignDefinition::new(
            SubjectKind::Attendee,
            "Final reminder to meet your {EVENT_NAME} hotel room requirements",
            "hotel/hotel_hours.txt",
            Predicate::new(|a, _| short_of_hotel_hours(a)),
            "hotel_requirements_reminder_last_chance",
        )
        .sender(&event.room_email_sender)
        .when(DateRule::days_before(7, event.final_email_deadline)),
    ];

    // With an external request form, assignments go out from there.
    if event.hotel_requests_url.is_none() {
        campaigns.push(
            CampaignDefinition::new(
                SubjectKind::Room,
                "{EVENT_NAME} Hotel Room Assignment",
                "hotel/room_assignment.txt",
                Predicate::field("locked_in"),
                "hotel_room_assignment",
            )
            .sender(&event.room_email_sender),
        );
    }

    campaigns
}
