use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Maximum length of a username accepted as a job key.
const MAX_USERNAME_LEN: usize = 64;

/// Case-normalized username identifying one tracked analysis job.
///
/// Construct via [`JobKey::parse`]; the inner string is always trimmed
/// and lowercased so `"Alice "` and `"alice"` address the same job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobKey(String);

impl JobKey {
    /// Normalize and validate a raw username.
    ///
    /// Rules:
    /// - Must not be empty after trimming.
    /// - Must not exceed `MAX_USERNAME_LEN` characters.
    /// - Must contain only alphanumeric, hyphen or underscore characters.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(CoreError::InvalidKey("username must not be empty".into()));
        }
        if normalized.chars().count() > MAX_USERNAME_LEN {
            return Err(CoreError::InvalidKey(format!(
                "username exceeds {MAX_USERNAME_LEN} characters"
            )));
        }
        if let Some(bad) = normalized
            .chars()
            .find(|c| !(c.is_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(CoreError::InvalidKey(format!(
                "username contains invalid character {bad:?}"
            )));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for JobKey {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<JobKey> for String {
    fn from(key: JobKey) -> Self {
        key.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parse_normalizes_case_and_whitespace() {
        let key = JobKey::parse("  MagnusCarlsen ").unwrap();
        assert_eq!(key.as_str(), "magnuscarlsen");
        assert_eq!(key, JobKey::parse("magnuscarlsen").unwrap());
    }

    #[test]
    fn parse_rejects_empty() {
        assert_matches!(JobKey::parse("   "), Err(CoreError::InvalidKey(_)));
    }

    #[test]
    fn parse_rejects_path_characters() {
        assert_matches!(JobKey::parse("../admin"), Err(CoreError::InvalidKey(_)));
        assert_matches!(JobKey::parse("a b"), Err(CoreError::InvalidKey(_)));
    }

    #[test]
    fn parse_accepts_hyphen_and_underscore() {
        let key = JobKey::parse("Hikaru_N-1").unwrap();
        assert_eq!(key.to_string(), "hikaru_n-1");
    }

    #[test]
    fn deserialize_goes_through_normalization() {
        let key: JobKey = serde_json::from_str(r#""Alice""#).unwrap();
        assert_eq!(key.as_str(), "alice");
        assert!(serde_json::from_str::<JobKey>(r#""""#).is_err());
    }
}
