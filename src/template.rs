//! Template registry and placeholder rendering.
//!
//! Templates are loaded once from a directory; a template's reference is its
//! path relative to that directory (`reg_workflow/attendee_confirmation.html`).
//! Bodies use `{{ name }}` / `{{ a.b.c }}` placeholders resolved against a
//! JSON context. Unknown placeholders render empty.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{Value, json};

use crate::campaign::{CampaignDefinition, EmailFormat};
use crate::config::EventConfig;
use crate::error::TemplateError;
use crate::subject::SubjectRecord;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([\w.]+)\s*\}\}").expect("placeholder pattern"));

/// One loaded template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSource {
    pub reference: String,
    /// Where the body came from (a file path, or a label for inline templates).
    pub location: String,
    pub body: String,
}

/// Mapping of template references to their sources.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, TemplateSource>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every file under `root`, recursively.
    ///
    /// A missing root yields an empty registry; campaigns referencing its
    /// templates are then flagged as template-missing during reconciliation.
    pub fn load_dir(root: &Path) -> Result<Self, TemplateError> {
        let mut registry = Self::new();
        if !root.exists() {
            tracing::warn!(root = %root.display(), "Template directory does not exist");
            return Ok(registry);
        }

        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let reference = reference_for(root, &path)?;
                let body = std::fs::read_to_string(&path).map_err(|e| TemplateError::Load {
                    reference: reference.clone(),
                    reason: e.to_string(),
                })?;
                registry.insert(&reference, &path.display().to_string(), &body);
            }
        }

        tracing::info!(root = %root.display(), count = registry.len(), "Templates loaded");
        Ok(registry)
    }

    pub fn insert(&mut self, reference: &str, location: &str, body: &str) {
        self.templates.insert(
            reference.to_string(),
            TemplateSource {
                reference: reference.to_string(),
                location: location.to_string(),
                body: body.to_string(),
            },
        );
    }

    /// Look up a template by reference.
    pub fn resolve(&self, reference: &str) -> Result<&TemplateSource, TemplateError> {
        self.templates
            .get(reference)
            .ok_or_else(|| TemplateError::NotFound(reference.to_string()))
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.templates.contains_key(reference)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Render a template against `context`. Substituted values are
    /// HTML-escaped when `format` is [`EmailFormat::Html`].
    pub fn render(
        &self,
        reference: &str,
        context: &Value,
        format: EmailFormat,
    ) -> Result<String, TemplateError> {
        let source = self.resolve(reference)?;
        Ok(render_str(&source.body, context, format))
    }
}

fn reference_for(root: &Path, path: &Path) -> Result<String, TemplateError> {
    let relative = path.strip_prefix(root).map_err(|e| TemplateError::Load {
        reference: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Substitute placeholders in `body`.
pub fn render_str(body: &str, context: &Value, format: EmailFormat) -> String {
    PLACEHOLDER
        .replace_all(body, |caps: &Captures<'_>| {
            let value = lookup(context, &caps[1]);
            match format {
                EmailFormat::Text => value,
                EmailFormat::Html => escape_html(&value),
            }
        })
        .into_owned()
}

/// Escape `& < > " '` so record fields cannot inject markup.
pub fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn lookup(context: &Value, path: &str) -> String {
    let mut current = context;
    for part in path.split('.') {
        match current.get(part) {
            Some(next) => current = next,
            None => return String::new(),
        }
    }
    match current {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Build the rendering context for one (campaign, record) pair.
///
/// Namespaces: `subject` (record fields), `record` (id and email), `event`,
/// `campaign`, and `extra` (the campaign's extra metadata).
pub fn render_context(
    campaign: &CampaignDefinition,
    record: &SubjectRecord,
    event: &EventConfig,
) -> Value {
    json!({
        "subject": Value::Object(record.fields.clone()),
        "record": {
            "id": record.id,
            "email": record.email,
            "kind": record.kind.as_str(),
        },
        "event": {
            "name": event.event_name,
            "year": event.event_year,
            "date": event.event_date(),
            "epoch": event.epoch.to_rfc3339(),
            "eschaton": event.eschaton.to_rfc3339(),
            "regdesk_email": event.regdesk_email,
            "staff_email": event.staff_email,
            "contact_email": event.contact_email,
            "consent_form_url": event.consent_form_url,
            "hotel_requests_url": event.hotel_requests_url,
        },
        "campaign": {
            "ident": campaign.ident,
            "subject": campaign.subject,
            "sender": campaign.sender_or(&event.regdesk_email),
        },
        "extra": campaign.extra,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::Predicate;
    use crate::subject::SubjectKind;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn renders_nested_placeholders() {
        let context =
            json!({ "subject": { "first_name": "Ada", "group": { "name": "Byte Club" } } });
        assert_eq!(
            render_str(
                "Hi {{ subject.first_name }} of {{subject.group.name}}!",
                &context,
                EmailFormat::Text
            ),
            "Hi Ada of Byte Club!"
        );
    }

    #[test]
    fn unknown_placeholders_render_empty() {
        assert_eq!(render_str("[{{ nope.nothing }}]", &json!({}), EmailFormat::Text), "[]");
        assert_eq!(render_str("{{ a }}", &json!({ "a": null }), EmailFormat::Text), "");
        assert_eq!(render_str("{{ n }}", &json!({ "n": 3 }), EmailFormat::Text), "3");
    }

    #[test]
    fn html_bodies_escape_field_values() {
        let context = json!({ "subject": { "first_name": "<a href=\"http://evil\">click</a>" } });
        let body = render_str("<p>Hi {{ subject.first_name }}</p>", &context, EmailFormat::Html);
        assert_eq!(
            body,
            "<p>Hi &lt;a href=&quot;http://evil&quot;&gt;click&lt;/a&gt;</p>"
        );
        assert!(!body.contains("<a "));
    }

    #[test]
    fn text_bodies_are_left_alone() {
        let context = json!({ "subject": { "name": "Tom & Jerry's <Group>" } });
        assert_eq!(
            render_str("{{ subject.name }}", &context, EmailFormat::Text),
            "Tom & Jerry's <Group>"
        );
        assert_eq!(
            render_str("{{ subject.name }}", &context, EmailFormat::Html),
            "Tom &amp; Jerry&#39;s &lt;Group&gt;"
        );
    }

    #[test]
    fn resolve_missing_template() {
        let registry = TemplateRegistry::new();
        assert!(matches!(
            registry.resolve("welcome.txt"),
            Err(TemplateError::NotFound(ref r)) if r == "welcome.txt"
        ));
    }

    #[test]
    fn load_dir_uses_relative_references() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("reg_workflow")).unwrap();
        std::fs::write(
            dir.path().join("reg_workflow/attendee_confirmation.html"),
            "<p>{{ record.email }}</p>",
        )
        .unwrap();
        std::fs::write(dir.path().join("welcome.txt"), "Welcome").unwrap();

        let registry = TemplateRegistry::load_dir(dir.path()).unwrap();
        assert_eq!(registry.len(), 2);
        let source = registry.resolve("reg_workflow/attendee_confirmation.html").unwrap();
        assert!(source.location.ends_with("attendee_confirmation.html"));
        assert!(registry.contains("welcome.txt"));
    }

    #[test]
    fn load_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TemplateRegistry::load_dir(&dir.path().join("absent")).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn context_namespaces() {
        let epoch = Utc.with_ymd_and_hms(2027, 1, 8, 0, 0, 0).unwrap();
        let event = EventConfig::new("MAGFest", epoch, epoch + Duration::days(3));
        let campaign = CampaignDefinition::new(
            SubjectKind::Attendee,
            "Hi",
            "welcome.txt",
            Predicate::always(),
            "welcome",
        )
        .extra(json!({ "conf": { "name": "Tech" } }));
        let record = SubjectRecord::new(SubjectKind::Attendee, "a-1", "ada@example.com")
            .with_field("first_name", "Ada");

        let mut registry = TemplateRegistry::new();
        registry.insert(
            "welcome.txt",
            "inline",
            concat!(
                "{{subject.first_name}} {{record.email}} {{event.name}} ",
                "{{event.date}} {{campaign.ident}} {{extra.conf.name}}"
            ),
        );
        let body = registry
            .render(
                "welcome.txt",
                &render_context(&campaign, &record, &event),
                EmailFormat::Text,
            )
            .unwrap();
        assert_eq!(body, "Ada ada@example.com MAGFest Jan 2027 welcome Tech");
    }
}
