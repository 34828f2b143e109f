//! Campaign definitions.
//!
//! A campaign is one category of automated email, e.g. "your registration
//! has been confirmed". Its `ident` keys the send history: changing the
//! ident of a campaign that has already sent makes every recipient eligible
//! again.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::campaign::predicate::Predicate;
use crate::campaign::window::{ActiveWindow, DateRule};
use crate::config::EventConfig;
use crate::subject::SubjectKind;

/// Body format, derived from the template reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailFormat {
    Text,
    Html,
}

impl EmailFormat {
    /// `.txt` templates are plain text; everything else is HTML.
    pub fn for_template(template: &str) -> Self {
        if template.ends_with(".txt") {
            EmailFormat::Text
        } else {
            EmailFormat::Html
        }
    }
}

impl fmt::Display for EmailFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmailFormat::Text => write!(f, "text"),
            EmailFormat::Html => write!(f, "html"),
        }
    }
}

impl FromStr for EmailFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(EmailFormat::Text),
            "html" => Ok(EmailFormat::Html),
            other => Err(format!("unknown email format: {other}")),
        }
    }
}

/// Field-equality filters pushed down to the subject store, narrowing the
/// candidate set before predicates run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubjectQuery {
    pub filters: Vec<(String, serde_json::Value)>,
}

impl SubjectQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<serde_json::Value>) -> Self {
        self.filters.push((field.to_string(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

/// One registered campaign.
///
/// Built with [`CampaignDefinition::new`] and the builder-style setters,
/// then handed to the registry, which substitutes subject placeholders,
/// fills in the default sender, and computes the active window.
#[derive(Debug, Clone)]
pub struct CampaignDefinition {
    pub ident: String,
    pub kind: SubjectKind,
    /// Subject line. Holds the raw text until registration, the rendered
    /// text afterwards.
    pub subject: String,
    pub template: String,
    pub format: EmailFormat,
    pub predicate: Predicate,
    pub query: SubjectQuery,
    /// `None` until registration defaults it to the registration desk.
    pub sender: Option<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Vec<String>,
    pub needs_approval: bool,
    pub allow_at_the_con: bool,
    pub allow_post_con: bool,
    pub extra: serde_json::Value,
    pub rules: Vec<DateRule>,
    pub window: ActiveWindow,
}

impl CampaignDefinition {
    /// A campaign with the defaults: approval required, not sent at or
    /// after the event, no date rules.
    pub fn new(
        kind: SubjectKind,
        subject: &str,
        template: &str,
        predicate: Predicate,
        ident: &str,
    ) -> Self {
        Self {
            ident: ident.to_string(),
            kind,
            subject: subject.to_string(),
            template: template.to_string(),
            format: EmailFormat::for_template(template),
            predicate,
            query: SubjectQuery::all(),
            sender: None,
            cc: Vec::new(),
            bcc: Vec::new(),
            reply_to: Vec::new(),
            needs_approval: true,
            allow_at_the_con: false,
            allow_post_con: false,
            extra: serde_json::Value::Null,
            rules: Vec::new(),
            window: ActiveWindow::default(),
        }
    }

    pub fn when(mut self, rule: DateRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn query(mut self, query: SubjectQuery) -> Self {
        self.query = query;
        self
    }

    pub fn sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_string());
        self
    }

    pub fn cc(mut self, address: &str) -> Self {
        self.cc.push(address.to_string());
        self
    }

    pub fn bcc(mut self, address: &str) -> Self {
        self.bcc.push(address.to_string());
        self
    }

    pub fn reply_to(mut self, address: &str) -> Self {
        self.reply_to.push(address.to_string());
        self
    }

    pub fn needs_approval(mut self, needs_approval: bool) -> Self {
        self.needs_approval = needs_approval;
        self
    }

    pub fn allow_at_the_con(mut self) -> Self {
        self.allow_at_the_con = true;
        self
    }

    pub fn allow_post_con(mut self, allow: bool) -> Self {
        self.allow_post_con = allow;
        self
    }

    pub fn extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = extra;
        self
    }

    /// Sender address, falling back to the registration desk.
    pub fn sender_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.sender.as_deref().unwrap_or(fallback)
    }
}

/// Substitute `{EVENT_NAME}`, `{EVENT_YEAR}` and `{EVENT_DATE}`.
pub fn render_subject(raw: &str, event: &EventConfig) -> String {
    raw.replace("{EVENT_NAME}", &event.event_name)
        .replace("{EVENT_YEAR}", &event.event_year)
        .replace("{EVENT_DATE}", &event.event_date())
}
