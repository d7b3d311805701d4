//! Per-type payload schemas.
//!
//! Payloads travel as opaque JSON objects. The dispatcher parses them here to
//! fail fast before anything reaches the queue, and handlers parse them again
//! on the worker side.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::job::JobType;
use crate::JsonMap;

const MAX_LABEL_LEN: usize = 64;
const MAX_PRODUCT_IDS: usize = 1_000;

/// Payload of a `backup` job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BackupPayload {
    /// Optional tag appended to the artifact name.
    #[serde(default)]
    pub label: Option<String>,
}

/// Payload of a `price_sync` job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PriceSyncPayload {
    /// Restrict the sync to these products; all tracked products when absent.
    #[serde(default)]
    pub product_ids: Option<Vec<String>>,
    /// Compare prices without writing new price records.
    #[serde(default)]
    pub dry_run: bool,
}

/// Payload of an `email_send` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EmailSendPayload {
    pub to: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub vars: JsonMap,
}

/// A payload parsed against the schema of its job type.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    Backup(BackupPayload),
    PriceSync(PriceSyncPayload),
    EmailSend(EmailSendPayload),
}

impl JobPayload {
    /// Parse and validate `payload` for `job_type`.
    pub fn parse(job_type: JobType, payload: &JsonMap) -> DomainResult<Self> {
        let parsed = match job_type {
            JobType::Backup => JobPayload::Backup(decode(job_type, payload)?),
            JobType::PriceSync => JobPayload::PriceSync(decode(job_type, payload)?),
            JobType::EmailSend => JobPayload::EmailSend(decode(job_type, payload)?),
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Parse a raw JSON value, rejecting anything that is not an object.
    pub fn parse_value(job_type: JobType, payload: &JsonValue) -> DomainResult<Self> {
        match payload {
            JsonValue::Object(map) => Self::parse(job_type, map),
            JsonValue::Null => Self::parse(job_type, &JsonMap::new()),
            _ => Err(DomainError::validation("payload must be a JSON object")),
        }
    }

    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::Backup(_) => JobType::Backup,
            JobPayload::PriceSync(_) => JobType::PriceSync,
            JobPayload::EmailSend(_) => JobType::EmailSend,
        }
    }

    /// Short audit-friendly rendering (never includes template variables).
    pub fn summary(&self) -> String {
        match self {
            JobPayload::Backup(p) => match &p.label {
                Some(label) => format!("label={label}"),
                None => "full backup".to_string(),
            },
            JobPayload::PriceSync(p) => {
                let scope = match &p.product_ids {
                    Some(ids) => format!("products={}", ids.len()),
                    None => "products=all".to_string(),
                };
                if p.dry_run {
                    format!("{scope} dry_run")
                } else {
                    scope
                }
            }
            JobPayload::EmailSend(p) => format!(
                "to={} template={}",
                p.to,
                p.template.as_deref().unwrap_or("generic")
            ),
        }
    }

    fn validate(&self) -> DomainResult<()> {
        match self {
            JobPayload::Backup(p) => {
                if let Some(label) = &p.label {
                    validate_label(label)?;
                }
            }
            JobPayload::PriceSync(p) => {
                if let Some(ids) = &p.product_ids {
                    if ids.is_empty() {
                        return Err(DomainError::validation(
                            "productIds must not be empty when present",
                        ));
                    }
                    if ids.len() > MAX_PRODUCT_IDS {
                        return Err(DomainError::validation(format!(
                            "productIds accepts at most {MAX_PRODUCT_IDS} entries"
                        )));
                    }
                    if ids.iter().any(|id| id.trim().is_empty()) {
                        return Err(DomainError::validation("productIds entries must be non-empty"));
                    }
                }
            }
            JobPayload::EmailSend(p) => {
                validate_email(&p.to)?;
                if let Some(template) = &p.template {
                    if template.trim().is_empty() {
                        return Err(DomainError::validation("template must be non-empty"));
                    }
                }
            }
        }
        Ok(())
    }
}

fn decode<T: serde::de::DeserializeOwned>(job_type: JobType, payload: &JsonMap) -> DomainResult<T> {
    serde_json::from_value(JsonValue::Object(payload.clone()))
        .map_err(|e| DomainError::validation(format!("invalid {job_type} payload: {e}")))
}

fn validate_label(label: &str) -> DomainResult<()> {
    if label.is_empty() || label.len() > MAX_LABEL_LEN {
        return Err(DomainError::validation(format!(
            "label must be 1..={MAX_LABEL_LEN} characters"
        )));
    }
    if !label
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(DomainError::validation(
            "label may only contain letters, digits, '-' and '_'",
        ));
    }
    Ok(())
}

/// Deliberately shallow address check: `local@domain.tld`, no whitespace.
pub fn validate_email(address: &str) -> DomainResult<()> {
    let invalid = || DomainError::validation(format!("invalid email address '{address}'"));

    if address.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = address.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
        return Err(invalid());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn obj(value: JsonValue) -> JsonMap {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn email_payload_with_only_recipient_is_valid() {
        let parsed = JobPayload::parse(JobType::EmailSend, &obj(json!({"to": "a@x.com"}))).unwrap();
        assert_eq!(parsed.job_type(), JobType::EmailSend);
        assert_eq!(parsed.summary(), "to=a@x.com template=generic");
    }

    #[test]
    fn email_payload_requires_recipient() {
        let err = JobPayload::parse(JobType::EmailSend, &JsonMap::new()).unwrap_err();
        assert!(matches!(err, DomainError::Validation(msg) if msg.contains("missing field `to`")));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = JobPayload::parse(JobType::Backup, &obj(json!({"tables": ["x"]}))).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn empty_payloads_are_fine_for_backup_and_price_sync() {
        assert!(JobPayload::parse(JobType::Backup, &JsonMap::new()).is_ok());
        let sync = JobPayload::parse(JobType::PriceSync, &JsonMap::new()).unwrap();
        assert_eq!(sync.summary(), "products=all");
    }

    #[test]
    fn price_sync_rejects_blank_product_ids() {
        let err = JobPayload::parse(
            JobType::PriceSync,
            &obj(json!({"productIds": ["p-1", "  "]})),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let err = JobPayload::parse(JobType::PriceSync, &obj(json!({"productIds": []}))).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn price_sync_summary_mentions_dry_run() {
        let parsed = JobPayload::parse(
            JobType::PriceSync,
            &obj(json!({"productIds": ["p-1", "p-2"], "dryRun": true})),
        )
        .unwrap();
        assert_eq!(parsed.summary(), "products=2 dry_run");
    }

    #[test]
    fn backup_label_charset_is_enforced() {
        assert!(JobPayload::parse(JobType::Backup, &obj(json!({"label": "nightly_2024-01"}))).is_ok());
        assert!(JobPayload::parse(JobType::Backup, &obj(json!({"label": "../etc"}))).is_err());
        assert!(JobPayload::parse(JobType::Backup, &obj(json!({"label": ""}))).is_err());
    }

    #[test]
    fn non_object_values_are_rejected() {
        let err = JobPayload::parse_value(JobType::Backup, &json!([1, 2])).unwrap_err();
        assert_eq!(err, DomainError::validation("payload must be a JSON object"));
        assert!(JobPayload::parse_value(JobType::Backup, &JsonValue::Null).is_ok());
    }

    #[test]
    fn email_shapes() {
        for ok in ["a@x.com", "first.last@shop.example.org"] {
            assert!(validate_email(ok).is_ok(), "{ok}");
        }
        for bad in ["", "a@", "@x.com", "a@x", "a@@x.com", "a b@x.com", "a@x..com"] {
            assert!(validate_email(bad).is_err(), "{bad}");
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: anything without an '@' is never accepted as a recipient.
        #[test]
        fn addresses_without_at_sign_are_rejected(addr in "[^@]{0,40}") {
            let payload = obj(json!({ "to": addr }));
            prop_assert!(JobPayload::parse(JobType::EmailSend, &payload).is_err());
        }
    }
}
