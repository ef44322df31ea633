use std::time::{SystemTime, UNIX_EPOCH};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

use crate::repository::RepositoryError;

const MAX_NAME_LEN: usize = 64;

/// A registered bot identity.
///
/// The secret never serializes; API views built from this type expose only
/// the name and metadata.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BotIdentity {
    pub name: String,
    #[serde(skip_serializing)]
    pub secret: Secret<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Unix milliseconds.
    pub created_at: u64,
    pub updated_at: u64,
}

/// On-disk shape of an identity record.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BotRecord {
    pub name: String,
    pub secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

impl From<BotRecord> for BotIdentity {
    fn from(r: BotRecord) -> Self {
        Self {
            name: r.name,
            secret: Secret::new(r.secret),
            description: r.description,
            created_at: r.created_at,
            updated_at: r.updated_at.max(r.created_at),
        }
    }
}

impl From<&BotIdentity> for BotRecord {
    fn from(b: &BotIdentity) -> Self {
        Self {
            name: b.name.clone(),
            secret: b.secret.expose_secret().clone(),
            description: b.description.clone(),
            created_at: b.created_at,
            updated_at: b.updated_at,
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Bot names are URL path segments and log fields: 1–64 chars of
/// `[A-Za-z0-9._-]`, not starting with a dot.
pub fn validate_name(name: &str) -> Result<(), RepositoryError> {
    let ok = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(RepositoryError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_rules() {
        assert!(validate_name("echo-bot").is_ok());
        assert!(validate_name("support_bot.v2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("slash/name").is_err());
        assert!(validate_name(&"a".repeat(65)).is_err());
    }

    #[test]
    fn serialized_identity_has_no_secret() {
        let identity = BotIdentity {
            name: "echo-bot".into(),
            secret: Secret::new("s3cr3t".into()),
            description: None,
            created_at: 1,
            updated_at: 1,
        };
        let v = serde_json::to_value(&identity).unwrap();
        assert_eq!(v["name"], "echo-bot");
        assert_eq!(v["createdAt"], 1);
        assert!(v.get("secret").is_none());
        assert!(!v.to_string().contains("s3cr3t"));
    }
}
