//! Core domain model and normalization rules for customer reconciliation.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "recon-core";

/// A raw CRM row in the staging table. Write-once per import run; duplicate
/// rows across imports are resolved logically by the ranker, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingRecord {
    pub id: i64,
    pub contact_id: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub gender_code: Option<String>,
    pub gender_source: Option<String>,
    pub birth_date: Option<String>,
    pub document_type: Option<String>,
    pub document_number: Option<String>,
    pub active_subscriptions: i32,
    pub created_on: Option<DateTime<Utc>>,
}

/// Staging row as parsed from a CRM CSV extract, before it gets a row id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewStagingRecord {
    pub contact_id: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub gender_code: Option<String>,
    pub gender_source: Option<String>,
    pub birth_date: Option<String>,
    pub document_type: Option<String>,
    pub document_number: Option<String>,
    pub active_subscriptions: i32,
    pub created_on: Option<DateTime<Utc>>,
}

/// One row of the identity-provider directory export mirrored into the
/// staging database. Matching runs against this table instead of hitting
/// the provider's search API once per staging row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub account_id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub gender: Option<String>,
    pub birthday: Option<String>,
    pub document_number: Option<String>,
    pub document_type: Option<String>,
    pub contact_id: Option<String>,
    pub last_login: Option<String>,
}

/// Profile metadata held by the identity provider for one account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountMetadata {
    #[serde(default)]
    pub contact_id: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub birthday: Option<String>,
    #[serde(default)]
    pub document_number: Option<String>,
    #[serde(default)]
    pub document_type: Option<String>,
    #[serde(default)]
    pub active_subscriptions: Option<i32>,
    #[serde(default)]
    pub ecommerce_user_id: Option<String>,
}

/// An authentication account owned by the identity provider. This system
/// only reads accounts and merge-patches their metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityAccount {
    pub account_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub last_login: Option<String>,
    #[serde(default)]
    pub metadata: AccountMetadata,
}

/// Partial metadata update. Only fields that are `Some` are serialized, so
/// a patch body carries exactly the keys it changes; the provider merges it
/// with the existing metadata rather than replacing it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birthday: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_subscriptions: Option<i32>,
}

impl MetadataPatch {
    pub fn subscriptions(count: i32) -> Self {
        Self {
            active_subscriptions: Some(count),
            ..Self::default()
        }
    }

    pub fn gender(gender: Gender) -> Self {
        Self {
            gender: Some(gender.as_str().to_string()),
            ..Self::default()
        }
    }

    pub fn birthday(birthday: impl Into<String>) -> Self {
        Self {
            birthday: Some(birthday.into()),
            ..Self::default()
        }
    }

    pub fn contact_id(contact_id: impl Into<String>) -> Self {
        Self {
            contact_id: Some(contact_id.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Customer profile document held by the e-commerce record store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EcommerceProfile {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub document: Option<String>,
    #[serde(default, rename = "firstName")]
    pub first_name: Option<String>,
    #[serde(default, rename = "lastName")]
    pub last_name: Option<String>,
    #[serde(default, rename = "socioFlag")]
    pub member_flag: Option<bool>,
    #[serde(default, rename = "contactId")]
    pub contact_id: Option<String>,
}

/// Field-level patch for an e-commerce profile. The constructors apply the
/// presence filter: absent, null and empty-string inputs are dropped so a
/// patch never clears a remote field by sending an empty value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfilePatch {
    #[serde(skip_serializing_if = "Option::is_none", rename = "firstName")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "lastName")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "socioFlag")]
    pub member_flag: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "contactId")]
    pub contact_id: Option<String>,
}

fn present(value: Option<&str>) -> Option<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Some(v.to_string()),
        _ => None,
    }
}

impl ProfilePatch {
    /// Build the outgoing profile patch from identity-account metadata.
    /// An active subscription count of 1 or more flips the member flag on.
    pub fn from_metadata(metadata: &AccountMetadata) -> Self {
        Self {
            first_name: present(metadata.first_name.as_deref()),
            last_name: present(metadata.last_name.as_deref()),
            document: present(metadata.document_number.as_deref()),
            member_flag: metadata.active_subscriptions.map(|n| n >= 1),
            contact_id: present(metadata.contact_id.as_deref()),
        }
    }

    pub fn contact_id(contact_id: impl Into<String>) -> Self {
        Self {
            contact_id: present(Some(&contact_id.into())),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Post-hoc CRM merge extracted from an operational log: the surviving
/// contact id for a given national document number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedContactMapping {
    pub contact_id: String,
    pub document_number: String,
}

/// Tagged outcome of an external lookup that can legitimately return zero,
/// one or many records for the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Lookup<T> {
    None,
    One { value: T },
    Many { values: Vec<T> },
}

impl<T> Lookup<T> {
    pub fn from_vec(mut values: Vec<T>) -> Self {
        match values.len() {
            0 => Lookup::None,
            1 => Lookup::One {
                value: values.remove(0),
            },
            _ => Lookup::Many { values },
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Lookup::None)
    }

    pub fn into_items(self) -> Vec<T> {
        match self {
            Lookup::None => Vec::new(),
            Lookup::One { value } => vec![value],
            Lookup::Many { values } => values,
        }
    }
}

/// Canonical gender values used by the identity-provider metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "Masculino",
            Gender::Female => "Femenino",
        }
    }
}

/// Map the heterogeneous source gender encodings (numeric codes as numbers
/// or strings, plus Spanish spellings in any case) onto the two canonical
/// values. Unrecognized input defaults to `Male`; downstream patch methods
/// rely on that default, so it is a documented behavior rather than an
/// error.
pub fn normalize_gender(raw: &str) -> Gender {
    match raw.trim().to_lowercase().as_str() {
        "2" | "fem" | "femenino" => Gender::Female,
        _ => Gender::Male,
    }
}

pub fn normalize_gender_code(code: i64) -> Gender {
    if code == 2 {
        Gender::Female
    } else {
        Gender::Male
    }
}

/// The single canonical email normalization used by every match path:
/// lower-case and trim. Empty input yields `None` so an absent email can
/// never match an absent email.
pub fn normalize_email(raw: &str) -> Option<String> {
    let normalized = raw.trim().to_lowercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

static DAY_FIRST_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,2}[-/.]\d{1,2}[-/.]\d{2,4}$").expect("static regex"));
static TIMESTAMP_WITH_MILLIS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}\.\d{3}$").expect("static regex")
});

/// Whether a raw birth-date string is in one of the source formats this
/// system knows how to canonicalize.
pub fn birthday_needs_conversion(raw: &str) -> bool {
    DAY_FIRST_DATE.is_match(raw) || TIMESTAMP_WITH_MILLIS.is_match(raw)
}

/// Convert a source birth date to `YYYY-MM-DDTHH:MM:SS`. Day-first dates
/// accept `-`, `/` or `.` separators and two- or four-digit years; the
/// timestamp form keeps its time-of-day. Unparseable input yields `None`.
pub fn convert_birthday(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if TIMESTAMP_WITH_MILLIS.is_match(raw) {
        let parsed = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.3f").ok()?;
        return Some(parsed.format("%Y-%m-%dT%H:%M:%S").to_string());
    }
    if !DAY_FIRST_DATE.is_match(raw) {
        return None;
    }
    let unified = raw.replace(['/', '.'], "-");
    let year_digits = unified.rsplit('-').next().map(str::len)?;
    let format = if year_digits == 4 { "%d-%m-%Y" } else { "%d-%m-%y" };
    let parsed = NaiveDate::parse_from_str(&unified, format).ok()?;
    Some(format!("{}T00:00:00", parsed.format("%Y-%m-%d")))
}

/// Parse a CRM `CreatedOn` cell. The exports are not consistent about the
/// timestamp format, so a few observed shapes are tried in order.
pub fn parse_created_on(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.3f", "%Y-%m-%d %H:%M:%S", "%d/%m/%Y %H:%M", "%d/%m/%Y"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(parsed.and_utc());
        }
        if let Ok(parsed) = NaiveDate::parse_from_str(raw, format) {
            return Some(parsed.and_hms_opt(0, 0, 0).expect("midnight is valid").and_utc());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gender_normalization_covers_source_encodings() {
        for raw in ["1", "masc", "masculino", "Masculino", "MASCULINO"] {
            assert_eq!(normalize_gender(raw), Gender::Male, "raw {raw:?}");
        }
        for raw in ["2", "fem", "femenino", "Femenino", "FEMENINO"] {
            assert_eq!(normalize_gender(raw), Gender::Female, "raw {raw:?}");
        }
        assert_eq!(normalize_gender_code(1), Gender::Male);
        assert_eq!(normalize_gender_code(2), Gender::Female);
    }

    #[test]
    fn gender_normalization_defaults_unknown_to_male() {
        assert_eq!(normalize_gender(""), Gender::Male);
        assert_eq!(normalize_gender("x"), Gender::Male);
        assert_eq!(normalize_gender("3"), Gender::Male);
        assert_eq!(normalize_gender_code(0), Gender::Male);
    }

    #[test]
    fn gender_normalization_is_idempotent() {
        for raw in ["1", "2", "fem", "garbage", "Masculino", "FEMENINO"] {
            let once = normalize_gender(raw);
            let twice = normalize_gender(once.as_str());
            assert_eq!(once, twice, "raw {raw:?}");
        }
    }

    #[test]
    fn email_normalization_lowercases_and_trims() {
        assert_eq!(normalize_email("  Ana@Example.COM "), Some("ana@example.com".into()));
        assert_eq!(normalize_email("   "), None);
        assert_eq!(normalize_email(""), None);
    }

    #[test]
    fn birthday_conversion_accepts_day_first_formats() {
        assert_eq!(convert_birthday("05-03-1987"), Some("1987-03-05T00:00:00".into()));
        assert_eq!(convert_birthday("5/3/1987"), Some("1987-03-05T00:00:00".into()));
        assert_eq!(convert_birthday("05.03.87"), Some("1987-03-05T00:00:00".into()));
    }

    #[test]
    fn birthday_conversion_accepts_millisecond_timestamps() {
        assert!(birthday_needs_conversion("1990-12-01 02:00:00.000"));
        assert_eq!(
            convert_birthday("1990-12-01 02:00:00.000"),
            Some("1990-12-01T02:00:00".into())
        );
    }

    #[test]
    fn birthday_conversion_rejects_unknown_shapes() {
        assert!(!birthday_needs_conversion("1990-12-01"));
        assert_eq!(convert_birthday("not a date"), None);
        assert_eq!(convert_birthday("99-99-1990"), None);
    }

    #[test]
    fn profile_patch_drops_empty_and_absent_fields() {
        let metadata = AccountMetadata {
            first_name: Some(String::new()),
            last_name: None,
            document_number: Some("123".into()),
            ..AccountMetadata::default()
        };
        let patch = ProfilePatch::from_metadata(&metadata);
        let body = serde_json::to_value(&patch).expect("serialize patch");
        assert_eq!(body, serde_json::json!({ "document": "123" }));
    }

    #[test]
    fn profile_patch_maps_subscriptions_to_member_flag() {
        let mut metadata = AccountMetadata {
            active_subscriptions: Some(3),
            ..AccountMetadata::default()
        };
        assert_eq!(ProfilePatch::from_metadata(&metadata).member_flag, Some(true));
        metadata.active_subscriptions = Some(0);
        assert_eq!(ProfilePatch::from_metadata(&metadata).member_flag, Some(false));
        metadata.active_subscriptions = None;
        assert_eq!(ProfilePatch::from_metadata(&metadata).member_flag, None);
    }

    #[test]
    fn metadata_patch_serializes_only_changed_keys() {
        let patch = MetadataPatch::subscriptions(4);
        let body = serde_json::to_value(&patch).expect("serialize patch");
        assert_eq!(body, serde_json::json!({ "active_subscriptions": 4 }));
    }

    #[test]
    fn lookup_tags_by_match_count() {
        assert!(Lookup::<i32>::from_vec(vec![]).is_none());
        assert_eq!(Lookup::from_vec(vec![7]), Lookup::One { value: 7 });
        assert_eq!(
            Lookup::from_vec(vec![1, 2]),
            Lookup::Many { values: vec![1, 2] }
        );
        assert_eq!(Lookup::from_vec(vec![1, 2, 3]).into_items(), vec![1, 2, 3]);
    }

    #[test]
    fn created_on_parses_observed_export_shapes() {
        assert!(parse_created_on("2023-06-01 10:30:00").is_some());
        assert!(parse_created_on("2023-06-01T10:30:00Z").is_some());
        assert!(parse_created_on("01/06/2023 10:30").is_some());
        assert!(parse_created_on("").is_none());
        assert!(parse_created_on("yesterday").is_none());
    }
}
