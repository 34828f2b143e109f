//! Configuration types, built from environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use secrecy::SecretString;

use crate::error::ConfigError;

/// Default cron schedule for daemon mode: every 15 minutes.
pub const DEFAULT_SCHEDULE: &str = "0 */15 * * * *";

/// Default claim lease: 15 minutes.
pub const DEFAULT_CLAIM_LEASE_SECS: i64 = 900;

/// Top-level mailer configuration.
#[derive(Debug, Clone)]
pub struct MailerConfig {
    /// Path to the libSQL database file.
    pub db_path: PathBuf,
    /// Directory holding email templates (`<dir>/<reference>`).
    pub template_dir: PathBuf,
    /// Event dates, names, and feature switches.
    pub event: EventConfig,
    /// SMTP transport. `None` means transmission is disabled.
    pub smtp: Option<SmtpConfig>,
    /// Batch schedule for daemon mode.
    pub schedule: ScheduleConfig,
    /// Age after which an unfinished `sending` claim is taken over.
    pub claim_lease: chrono::Duration,
}

impl MailerConfig {
    /// Build the full configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("MAILER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/campaign-mailer.db"));
        let template_dir = std::env::var("MAILER_TEMPLATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./templates/emails"));

        Ok(Self {
            db_path,
            template_dir,
            event: EventConfig::from_env()?,
            smtp: SmtpConfig::from_env()?,
            schedule: ScheduleConfig::from_env()?,
            claim_lease: claim_lease_from_env()?,
        })
    }
}

fn claim_lease_from_env() -> Result<chrono::Duration, ConfigError> {
    match std::env::var("MAILER_CLAIM_LEASE_SECS") {
        Ok(raw) => parse_lease_secs(&raw),
        Err(_) => Ok(chrono::Duration::seconds(DEFAULT_CLAIM_LEASE_SECS)),
    }
}

/// Parse a claim lease in whole seconds. Zero and negatives are rejected.
pub fn parse_lease_secs(raw: &str) -> Result<chrono::Duration, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: "MAILER_CLAIM_LEASE_SECS".into(),
        message,
    };
    let secs: i64 = raw.trim().parse().map_err(|e| invalid(format!("{e}")))?;
    if secs <= 0 {
        return Err(invalid(format!("must be positive, got {secs}")));
    }
    Ok(chrono::Duration::seconds(secs))
}

/// Event calendar, sender addresses, and feature switches.
///
/// Optional dates model deadlines an event may not use; date rules built
/// from an unset date contribute no window bound.
#[derive(Debug, Clone)]
pub struct EventConfig {
    pub event_name: String,
    pub event_year: String,
    /// First day of the event.
    pub epoch: DateTime<Utc>,
    /// End of the event.
    pub eschaton: DateTime<Utc>,

    pub regdesk_email: String,
    pub staff_email: String,
    pub contact_email: String,
    pub merch_email: String,
    pub room_email_sender: String,

    pub prereg_open: Option<DateTime<Utc>>,
    pub prereg_takedown: Option<DateTime<Utc>>,
    pub group_prereg_takedown: Option<DateTime<Utc>>,
    pub placeholder_deadline: Option<DateTime<Utc>>,
    pub uber_takedown: Option<DateTime<Utc>>,
    pub volunteer_checklist_open: Option<DateTime<Utc>>,
    pub shifts_created: Option<DateTime<Utc>>,
    pub final_email_deadline: Option<DateTime<Utc>>,
    pub printed_badge_deadline: Option<DateTime<Utc>>,
    pub room_deadline: Option<DateTime<Utc>>,

    pub attendee_accounts_enabled: bool,
    pub hotels_enabled: bool,
    pub volunteer_agreement_enabled: bool,
    /// Attendees get a check-in QR code email before the event.
    pub use_checkin_barcode: bool,
    /// External hotel request form. When set, room assignments are sent
    /// from there and the room assignment email is not registered.
    pub hotel_requests_url: Option<String>,
    /// Parental consent form for minors. Unset disables the reminder.
    pub consent_form_url: Option<String>,
    /// Department checklist items; each gets its own reminder campaign.
    pub dept_checklists: Vec<DeptChecklist>,
}

/// One department checklist item with a deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeptChecklist {
    pub slug: String,
    pub name: String,
    pub deadline: DateTime<Utc>,
    pub email_post_con: bool,
}

impl EventConfig {
    /// Build event configuration from `EVENT_*` environment variables.
    ///
    /// `EVENT_EPOCH` is required; `EVENT_ESCHATON` defaults to three days
    /// after the epoch.
    pub fn from_env() -> Result<Self, ConfigError> {
        let epoch = required_date("EVENT_EPOCH")?;
        let eschaton =
            optional_date("EVENT_ESCHATON")?.unwrap_or(epoch + chrono::Duration::days(3));
        let regdesk_email =
            std::env::var("EVENT_REGDESK_EMAIL").unwrap_or_else(|_| "regdesk@example.com".into());
        let fallback = |key: &str| std::env::var(key).unwrap_or_else(|_| regdesk_email.clone());

        let dept_checklists = match std::env::var("EVENT_DEPT_CHECKLISTS") {
            Ok(raw) => parse_dept_checklists(&raw)?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            event_name: std::env::var("EVENT_NAME").unwrap_or_else(|_| "The Event".into()),
            event_year: std::env::var("EVENT_YEAR")
                .unwrap_or_else(|_| epoch.format("%Y").to_string()),
            epoch,
            eschaton,
            staff_email: fallback("EVENT_STAFF_EMAIL"),
            contact_email: fallback("EVENT_CONTACT_EMAIL"),
            merch_email: fallback("EVENT_MERCH_EMAIL"),
            room_email_sender: fallback("EVENT_ROOM_EMAIL_SENDER"),
            regdesk_email,
            prereg_open: optional_date("EVENT_PREREG_OPEN")?,
            prereg_takedown: optional_date("EVENT_PREREG_TAKEDOWN")?,
            group_prereg_takedown: optional_date("EVENT_GROUP_PREREG_TAKEDOWN")?,
            placeholder_deadline: optional_date("EVENT_PLACEHOLDER_DEADLINE")?,
            uber_takedown: optional_date("EVENT_UBER_TAKEDOWN")?,
            volunteer_checklist_open: optional_date("EVENT_VOLUNTEER_CHECKLIST_OPEN")?,
            shifts_created: optional_date("EVENT_SHIFTS_CREATED")?,
            final_email_deadline: optional_date("EVENT_FINAL_EMAIL_DEADLINE")?,
            printed_badge_deadline: optional_date("EVENT_PRINTED_BADGE_DEADLINE")?,
            room_deadline: optional_date("EVENT_ROOM_DEADLINE")?,
            attendee_accounts_enabled: env_flag("EVENT_ATTENDEE_ACCOUNTS_ENABLED"),
            hotels_enabled: env_flag("EVENT_HOTELS_ENABLED"),
            volunteer_agreement_enabled: env_flag("EVENT_VOLUNTEER_AGREEMENT_ENABLED"),
            use_checkin_barcode: env_flag("EVENT_USE_CHECKIN_BARCODE"),
            hotel_requests_url: optional_string("EVENT_HOTEL_REQUESTS_URL"),
            consent_form_url: optional_string("EVENT_CONSENT_FORM_URL"),
            dept_checklists,
        })
    }

    /// A minimal configuration with every optional date unset.
    pub fn new(event_name: &str, epoch: DateTime<Utc>, eschaton: DateTime<Utc>) -> Self {
        Self {
            event_name: event_name.to_string(),
            event_year: epoch.format("%Y").to_string(),
            epoch,
            eschaton,
            regdesk_email: "regdesk@example.com".into(),
            staff_email: "staffing@example.com".into(),
            contact_email: "contact@example.com".into(),
            merch_email: "merch@example.com".into(),
            room_email_sender: "hotels@example.com".into(),
            prereg_open: None,
            prereg_takedown: None,
            group_prereg_takedown: None,
            placeholder_deadline: None,
            uber_takedown: None,
            volunteer_checklist_open: None,
            shifts_created: None,
            final_email_deadline: None,
            printed_badge_deadline: None,
            room_deadline: None,
            attendee_accounts_enabled: false,
            hotels_enabled: false,
            volunteer_agreement_enabled: false,
            use_checkin_barcode: false,
            hotel_requests_url: None,
            consent_form_url: None,
            dept_checklists: Vec::new(),
        }
    }

    /// The `{EVENT_DATE}` rendering: event start as `Jan 2027`.
    pub fn event_date(&self) -> String {
        self.epoch.format("%b %Y").to_string()
    }
}

/// SMTP transport configuration.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
}

impl SmtpConfig {
    /// Returns `None` if `SMTP_HOST` is not set (transmission disabled).
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Ok(host) = std::env::var("SMTP_HOST") else {
            return Ok(None);
        };
        let port = match std::env::var("SMTP_PORT") {
            Ok(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
                key: "SMTP_PORT".into(),
                message: format!("{e}"),
            })?,
            Err(_) => 587,
        };

        Ok(Some(Self {
            host,
            port,
            username: std::env::var("SMTP_USERNAME").unwrap_or_default(),
            password: SecretString::from(std::env::var("SMTP_PASSWORD").unwrap_or_default()),
        }))
    }
}

/// Daemon-mode schedule.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Cron expression (with seconds field) for batch runs.
    pub cron: String,
}

impl ScheduleConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            cron: std::env::var("MAILER_SCHEDULE").unwrap_or_else(|_| DEFAULT_SCHEDULE.to_string()),
        };
        config.schedule()?;
        Ok(config)
    }

    /// Parse the cron expression.
    pub fn schedule(&self) -> Result<cron::Schedule, ConfigError> {
        cron::Schedule::from_str(&self.cron).map_err(|e| ConfigError::InvalidValue {
            key: "MAILER_SCHEDULE".into(),
            message: format!("invalid cron: {e}"),
        })
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: DEFAULT_SCHEDULE.to_string(),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Parse an RFC 3339 timestamp or a bare `YYYY-MM-DD` date (midnight UTC).
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ndt| ndt.and_utc())
}

fn optional_date(key: &str) -> Result<Option<DateTime<Utc>>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => parse_date(&raw)
            .map(Some)
            .ok_or_else(|| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("not a date: {raw}"),
            }),
        Err(_) => Ok(None),
    }
}

fn required_date(key: &str) -> Result<DateTime<Utc>, ConfigError> {
    optional_date(key)?.ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn optional_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Parse `slug|Name|YYYY-MM-DD[|post_con]` entries separated by `;`.
pub fn parse_dept_checklists(raw: &str) -> Result<Vec<DeptChecklist>, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: "EVENT_DEPT_CHECKLISTS".into(),
        message,
    };

    raw.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let parts: Vec<&str> = entry.split('|').map(str::trim).collect();
            if parts.len() < 3 {
                return Err(invalid(format!("expected slug|name|deadline, got `{entry}`")));
            }
            let deadline = parse_date(parts[2])
                .ok_or_else(|| invalid(format!("bad deadline in `{entry}`")))?;
            Ok(DeptChecklist {
                slug: parts[0].to_string(),
                name: parts[1].to_string(),
                deadline,
                email_post_con: parts.get(3).is_some_and(|p| *p == "post_con"),
            })
        })
        .collect()
}
