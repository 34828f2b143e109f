//! Subject records, the externally-owned entities campaigns are sent about.
//!
//! The engine never mutates a record. Predicates and templates read the
//! JSON field map through the typed accessors below, which return
//! [`PredicateError`] on missing or mistyped fields so a bad record can be
//! skipped without halting a run.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PredicateError;

/// The entity type a campaign is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Attendee,
    AttendeeAccount,
    Group,
    PromoCodeGroup,
    LotteryApplication,
    Room,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Attendee => "attendee",
            SubjectKind::AttendeeAccount => "attendee_account",
            SubjectKind::Group => "group",
            SubjectKind::PromoCodeGroup => "promo_code_group",
            SubjectKind::LotteryApplication => "lottery_application",
            SubjectKind::Room => "room",
        }
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubjectKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "attendee" => Ok(SubjectKind::Attendee),
            "attendee_account" => Ok(SubjectKind::AttendeeAccount),
            "group" => Ok(SubjectKind::Group),
            "promo_code_group" => Ok(SubjectKind::PromoCodeGroup),
            "lottery_application" => Ok(SubjectKind::LotteryApplication),
            "room" => Ok(SubjectKind::Room),
            other => Err(format!("unknown subject kind: {other}")),
        }
    }
}

/// A record queried fresh on each dispatch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub kind: SubjectKind,
    pub id: String,
    /// Primary recipient address.
    pub email: String,
    /// Suppression flag: `false` when the recipient opted out of all email.
    #[serde(default = "default_gets_emails")]
    pub gets_emails: bool,
    /// Entity fields read by predicates and templates.
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

fn default_gets_emails() -> bool {
    true
}

impl SubjectRecord {
    pub fn new(kind: SubjectKind, id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            email: email.into(),
            gets_emails: true,
            fields: serde_json::Map::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn opted_out(mut self) -> Self {
        self.gets_emails = false;
        self
    }

    /// Raw field lookup. Dotted paths descend into nested objects.
    pub fn field(&self, path: &str) -> Option<&serde_json::Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.fields.get(first)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn require(&self, path: &str) -> Result<&serde_json::Value, PredicateError> {
        self.field(path).ok_or_else(|| PredicateError::MissingField {
            record: self.id.clone(),
            field: path.to_string(),
        })
    }

    fn wrong_type(&self, path: &str, expected: &'static str) -> PredicateError {
        PredicateError::WrongType {
            record: self.id.clone(),
            field: path.to_string(),
            expected,
        }
    }

    /// Truthiness of a field: `null`, `false`, `0`, `""` and `[]` are false.
    /// A missing field is an error.
    pub fn truthy(&self, path: &str) -> Result<bool, PredicateError> {
        Ok(match self.require(path)? {
            serde_json::Value::Null => false,
            serde_json::Value::Bool(b) => *b,
            serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            serde_json::Value::String(s) => !s.is_empty(),
            serde_json::Value::Array(a) => !a.is_empty(),
            serde_json::Value::Object(o) => !o.is_empty(),
        })
    }

    /// Like [`truthy`](Self::truthy) but a missing field reads as false.
    pub fn flag(&self, path: &str) -> bool {
        self.field(path).is_some() && self.truthy(path).unwrap_or(false)
    }

    pub fn bool_field(&self, path: &str) -> Result<bool, PredicateError> {
        self.require(path)?
            .as_bool()
            .ok_or_else(|| self.wrong_type(path, "bool"))
    }

    pub fn str_field(&self, path: &str) -> Result<&str, PredicateError> {
        self.require(path)?
            .as_str()
            .ok_or_else(|| self.wrong_type(path, "string"))
    }

    pub fn i64_field(&self, path: &str) -> Result<i64, PredicateError> {
        self.require(path)?
            .as_i64()
            .ok_or_else(|| self.wrong_type(path, "integer"))
    }

    pub fn f64_field(&self, path: &str) -> Result<f64, PredicateError> {
        self.require(path)?
            .as_f64()
            .ok_or_else(|| self.wrong_type(path, "number"))
    }

    /// A timestamp field stored as an RFC 3339 string.
    pub fn datetime_field(&self, path: &str) -> Result<DateTime<Utc>, PredicateError> {
        let raw = self.str_field(path)?;
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| self.wrong_type(path, "RFC 3339 timestamp"))
    }

    /// Number of elements in an array field; a missing field counts as empty.
    pub fn len_field(&self, path: &str) -> Result<usize, PredicateError> {
        match self.field(path) {
            None | Some(serde_json::Value::Null) => Ok(0),
            Some(serde_json::Value::Array(a)) => Ok(a.len()),
            Some(_) => Err(self.wrong_type(path, "array")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attendee() -> SubjectRecord {
        SubjectRecord::new(SubjectKind::Attendee, "a-1", "alice@example.com")
            .with_field("paid", true)
            .with_field("badge_type", "attendee")
            .with_field("amount_paid", 4500)
            .with_field("registered", "2026-06-01T12:00:00Z")
            .with_field("group", json!({ "leader_id": "a-9", "cost": 0 }))
            .with_field("shifts", json!([]))
    }

    #[test]
    fn kind_roundtrip() {
        for kind in [
            SubjectKind::Attendee,
            SubjectKind::AttendeeAccount,
            SubjectKind::Group,
            SubjectKind::PromoCodeGroup,
            SubjectKind::LotteryApplication,
            SubjectKind::Room,
        ] {
            assert_eq!(kind.as_str().parse::<SubjectKind>().unwrap(), kind);
        }
        assert!("dealer".parse::<SubjectKind>().is_err());
    }

    #[test]
    fn typed_accessors() {
        let a = attendee();
        assert!(a.bool_field("paid").unwrap());
        assert_eq!(a.str_field("badge_type").unwrap(), "attendee");
        assert_eq!(a.i64_field("amount_paid").unwrap(), 4500);
        assert_eq!(a.str_field("group.leader_id").unwrap(), "a-9");
        assert_eq!(a.len_field("shifts").unwrap(), 0);
        assert_eq!(a.len_field("hotel_requests").unwrap(), 0);
        assert!(a.datetime_field("registered").is_ok());
    }

    #[test]
    fn missing_field_is_an_error() {
        let a = attendee();
        assert!(matches!(
            a.bool_field("placeholder"),
            Err(PredicateError::MissingField { .. })
        ));
        assert!(!a.flag("placeholder"));
    }

    #[test]
    fn wrong_type_is_an_error() {
        let a = attendee();
        assert!(matches!(
            a.bool_field("badge_type"),
            Err(PredicateError::WrongType { expected: "bool", .. })
        ));
    }

    #[test]
    fn truthiness() {
        let a = attendee();
        assert!(a.truthy("amount_paid").unwrap());
        assert!(!a.truthy("shifts").unwrap());
        assert!(!a.truthy("group.cost").unwrap());
    }

    #[test]
    fn deserializes_with_defaults() {
        let rec: SubjectRecord = serde_json::from_value(json!({
            "kind": "group",
            "id": "g-1",
            "email": "leader@example.com"
        }))
        .unwrap();
        assert!(rec.gets_emails);
        assert!(rec.fields.is_empty());
    }
}
