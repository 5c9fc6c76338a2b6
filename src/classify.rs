//! Error classification.
//!
//! Raw driver and I/O errors are classified by textual pattern matching over
//! the rendered error chain into a fixed taxonomy of kinds. The taxonomy
//! drives the retry and job-abort decisions: `Critical` severity always stops
//! the job, retryable kinds go through exponential backoff, everything else
//! is resolved by the config's conflict policy.
//!
//! Classification is a table-driven rule list, not a type hierarchy, and is
//! deterministic: the same message always yields the same kind.

use chrono::{DateTime, Utc};

/// Error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("lock-timeout")]
    LockTimeout,
    #[error("connection")]
    Connection,
    #[error("authentication")]
    Authentication,
    #[error("timeout")]
    Timeout,
    #[error("schema-conflict")]
    SchemaConflict,
    #[error("data-conversion")]
    DataConversion,
    #[error("primary-key-conflict")]
    PrimaryKeyConflict,
    #[error("disk-space")]
    DiskSpace,
    #[error("system-resource")]
    SystemResource,
    #[error("unknown")]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
    /// The job must stop, regardless of conflict policy.
    Critical,
}

/// A raw error after classification.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub severity: Severity,
    /// Rendered message of the original error chain.
    pub message: String,
    pub retryable: bool,
    /// Table being synced when the error occurred, if known.
    pub table: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

struct Rule {
    kind: ErrorKind,
    severity: Severity,
    retryable: bool,
    patterns: &'static [&'static str],
}

/// Ordered rule list. Lock-timeout is tested before the generic timeout
/// rule so "lock wait timeout" never classifies as a plain timeout, and
/// authentication precedes data-conversion so "invalid credentials" never
/// matches the bare "invalid" pattern.
const RULES: &[Rule] = &[
    Rule {
        kind: ErrorKind::LockTimeout,
        severity: Severity::Medium,
        retryable: true,
        patterns: &["lock wait timeout", "deadlock"],
    },
    Rule {
        kind: ErrorKind::Connection,
        severity: Severity::High,
        retryable: true,
        patterns: &[
            "connection refused",
            "connection reset",
            "no such host",
            "network unreachable",
        ],
    },
    Rule {
        kind: ErrorKind::Authentication,
        severity: Severity::Critical,
        retryable: false,
        patterns: &["access denied", "authentication failed", "invalid credentials"],
    },
    Rule {
        kind: ErrorKind::Timeout,
        severity: Severity::Medium,
        retryable: true,
        patterns: &["timeout", "deadline exceeded", "context deadline"],
    },
    Rule {
        kind: ErrorKind::SchemaConflict,
        severity: Severity::High,
        retryable: false,
        patterns: &["table doesn't exist", "unknown column", "column count"],
    },
    Rule {
        kind: ErrorKind::DiskSpace,
        severity: Severity::Critical,
        retryable: false,
        patterns: &["no space left", "disk full"],
    },
    Rule {
        kind: ErrorKind::SystemResource,
        severity: Severity::Critical,
        retryable: false,
        patterns: &["out of memory", "cannot allocate"],
    },
    Rule {
        kind: ErrorKind::PrimaryKeyConflict,
        severity: Severity::Low,
        retryable: false,
        patterns: &["duplicate entry", "unique constraint", "primary key"],
    },
    Rule {
        kind: ErrorKind::DataConversion,
        severity: Severity::Medium,
        retryable: false,
        patterns: &["data too long", "incorrect", "invalid", "truncated"],
    },
];

/// Remediation hint surfaced next to the classified error.
pub fn suggestion(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::LockTimeout => "Retry later or reduce batch size to shorten lock waits",
        ErrorKind::Connection => "Check network connectivity and that the database host is reachable",
        ErrorKind::Authentication => "Check the username and password in the connection configuration",
        ErrorKind::Timeout => "Increase the operation timeout or check database load",
        ErrorKind::SchemaConflict => {
            "Check that source and target schemas match; recreate the target table if needed"
        }
        ErrorKind::DataConversion => {
            "Check column types and value compatibility between source and target"
        }
        ErrorKind::PrimaryKeyConflict => {
            "Use the overwrite or skip conflict policy, or remove the colliding rows"
        }
        ErrorKind::DiskSpace => "Free disk space on the database host",
        ErrorKind::SystemResource => "Reduce batch size or increase available memory",
        ErrorKind::Unknown => "Inspect the error message and the database server logs",
    }
}

/// Classify a raw error by its rendered chain.
///
/// An error that already carries a [`ClassifiedError`] anywhere in its
/// chain keeps that classification instead of being re-matched.
pub fn classify(err: &anyhow::Error) -> ClassifiedError {
    for cause in err.chain() {
        if let Some(classified) = cause.downcast_ref::<ClassifiedError>() {
            return classified.clone();
        }
    }
    // `{:#}` renders the whole context chain, so a wrapped driver error
    // still matches its cause's patterns.
    classify_message(&format!("{err:#}"))
}

/// Classify an already-rendered message.
pub fn classify_message(message: &str) -> ClassifiedError {
    let haystack = message.to_lowercase();

    for rule in RULES {
        if rule.patterns.iter().any(|p| haystack.contains(p)) {
            return ClassifiedError {
                kind: rule.kind,
                severity: rule.severity,
                message: message.to_string(),
                retryable: rule.retryable,
                table: None,
                occurred_at: Utc::now(),
            };
        }
    }

    ClassifiedError {
        kind: ErrorKind::Unknown,
        severity: Severity::Medium,
        message: message.to_string(),
        retryable: true,
        table: None,
        occurred_at: Utc::now(),
    }
}

impl ClassifiedError {
    /// A schema-conflict raised by the engine itself (missing change
    /// column, missing primary key), pre-classified at the source.
    pub fn schema_conflict(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::SchemaConflict,
            severity: Severity::High,
            message: message.into(),
            retryable: false,
            table: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }

    pub fn suggestion(&self) -> &'static str {
        suggestion(self.kind)
    }
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(table) = &self.table {
            write!(f, "[{}] ", table)?;
        }
        write!(
            f,
            "{} ({}); suggestion: {}",
            self.message,
            self.kind,
            self.suggestion()
        )
    }
}

impl std::error::Error for ClassifiedError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind_of(msg: &str) -> ErrorKind {
        classify_message(msg).kind
    }

    #[test]
    fn test_each_kind_matches() {
        assert_eq!(kind_of("Deadlock found when trying to get lock"), ErrorKind::LockTimeout);
        assert_eq!(kind_of("connect: Connection refused"), ErrorKind::Connection);
        assert_eq!(
            kind_of("Access denied for user 'sync'@'10.0.0.2'"),
            ErrorKind::Authentication
        );
        assert_eq!(kind_of("operation timeout after 30s"), ErrorKind::Timeout);
        assert_eq!(kind_of("Table 'appdb.users' doesn't exist"), ErrorKind::SchemaConflict);
        assert_eq!(kind_of("Data too long for column 'name'"), ErrorKind::DataConversion);
        assert_eq!(
            kind_of("Duplicate entry '3' for key 'PRIMARY'"),
            ErrorKind::PrimaryKeyConflict
        );
        assert_eq!(kind_of("write failed: no space left on device"), ErrorKind::DiskSpace);
        assert_eq!(kind_of("cannot allocate memory"), ErrorKind::SystemResource);
        assert_eq!(kind_of("something odd happened"), ErrorKind::Unknown);
    }

    #[test]
    fn test_lock_timeout_beats_generic_timeout() {
        let err = classify_message("Lock wait timeout exceeded; try restarting transaction");
        assert_eq!(err.kind, ErrorKind::LockTimeout);
        assert!(err.retryable);
    }

    #[test]
    fn test_invalid_credentials_is_authentication_not_conversion() {
        let err = classify_message("invalid credentials supplied");
        assert_eq!(err.kind, ErrorKind::Authentication);
        assert_eq!(err.severity, Severity::Critical);
        assert!(!err.retryable);
    }

    #[test]
    fn test_classification_is_case_insensitive() {
        assert_eq!(kind_of("CONNECTION RESET by peer"), ErrorKind::Connection);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let msg = "Lock wait timeout exceeded";
        let a = classify_message(msg);
        let b = classify_message(msg);
        assert_eq!(a.kind, b.kind);
        assert_eq!(a.severity, b.severity);
        assert_eq!(a.retryable, b.retryable);
    }

    #[test]
    fn test_unknown_is_retryable_medium() {
        let err = classify_message("gremlins");
        assert_eq!(err.severity, Severity::Medium);
        assert!(err.retryable);
    }

    #[test]
    fn test_wrapped_chain_is_matched() {
        let inner = anyhow::anyhow!("Connection refused (os error 111)");
        let outer = inner.context("failed to sync table users");
        let err = classify(&outer);
        assert_eq!(err.kind, ErrorKind::Connection);
    }

    #[test]
    fn test_preclassified_error_keeps_its_classification() {
        // The message alone would match nothing, but the chain carries a
        // ready-made classification.
        let inner = anyhow::Error::new(ClassifiedError::schema_conflict(
            "table orders has no usable change tracking column",
        ));
        let outer = inner.context("incremental sync failed");
        let err = classify(&outer);
        assert_eq!(err.kind, ErrorKind::SchemaConflict);
        assert!(!err.retryable);
    }

    #[test]
    fn test_display_carries_suggestion_and_table() {
        let err = classify_message("Access denied for user").with_table("users");
        let rendered = err.to_string();
        assert!(rendered.contains("[users]"));
        assert!(rendered.contains("suggestion: Check the username"));
    }
}
