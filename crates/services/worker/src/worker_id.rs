//! Worker process identity.

/// A worker identity, stable for the lifetime of the process.
///
/// Used as the `worker_id` column value on claimed rows and as the broker
/// consumer tag.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    /// Derive the identity of the current process: `worker-<host>-<pid>`.
    ///
    /// Characters the identifier format does not allow are replaced with
    /// `-`, so any hostname yields a valid identity.
    pub fn for_process() -> Self {
        let hostname = gethostname::gethostname();
        let host: String = hostname
            .to_string_lossy()
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        WorkerId(format!("worker-{host}-{}", std::process::id()))
    }

    /// Returns the worker ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the [`WorkerId`] and returns the inner String
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl AsRef<str> for WorkerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for WorkerId {
    type Error = InvalidIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_worker_id(&value)?;
        Ok(WorkerId(value))
    }
}

impl From<WorkerId> for String {
    fn from(id: WorkerId) -> Self {
        id.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for WorkerId {
    type Err = InvalidIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_worker_id(s)?;
        Ok(WorkerId(s.to_string()))
    }
}

/// Validates that a worker ID follows the required format:
/// - Must start with a letter
/// - Can only contain alphanumeric characters, underscores, hyphens, and dots
/// - Must not be empty
fn validate_worker_id(id: &str) -> Result<(), InvalidIdError> {
    if id.is_empty() {
        return Err(InvalidIdError {
            id: id.to_string(),
            reason: "empty string".into(),
        });
    }

    if let Some(c) = id.chars().next() {
        if !c.is_alphabetic() {
            return Err(InvalidIdError {
                id: id.to_string(),
                reason: "must start with a letter".into(),
            });
        }
    }

    if let Some(c) = id
        .chars()
        .find(|c| !c.is_alphanumeric() && *c != '_' && *c != '-' && *c != '.')
    {
        return Err(InvalidIdError {
            id: id.to_string(),
            reason: format!("invalid character '{c}'").into(),
        });
    }

    Ok(())
}

/// Error returned when a worker ID is invalid.
#[derive(Debug, thiserror::Error)]
#[error("Invalid worker ID '{id}': {reason}")]
pub struct InvalidIdError {
    id: String,
    #[source]
    reason: Box<dyn std::error::Error + Send + Sync>,
}
