//! Error taxonomy shared by the query, discovery and subscription paths.

use std::fmt;

/// Errors surfaced to callers of the reporting pipeline.
///
/// Ingestion-side problems (malformed lines, unmapped metric paths) never
/// become a `ReportingError`; they are dropped and logged where they occur.
#[derive(Debug)]
pub enum ReportingError {
    /// Unknown graph/plugin name.
    NotFound(String),
    /// A plugin with this name is already registered.
    DuplicateName(String),
    /// Plugin definition defect (e.g. no archive types).
    Configuration(String),
    /// Aggregation name outside `min`/`mean`/`max`.
    InvalidAggregation(String),
    /// Transform expression references a series that was never defined.
    UndefinedReference { reference: String, expression: String },
    /// The archive tool exited unsuccessfully. Never retried.
    QueryExecution { status: Option<i32>, stderr: String },
    /// None of the plugin's archives exist on disk.
    NoData {
        plugin: String,
        identifier: Option<String>,
    },
    /// Malformed request or configuration record.
    Validation(String),
    /// I/O error while reading archives or invoking the tool.
    Io(std::io::Error),
    /// Archive tool output could not be decoded.
    Parse(String),
}

impl ReportingError {
    /// Stable discriminant used by API layers.
    pub fn kind(&self) -> &'static str {
        match self {
            ReportingError::NotFound(_) => "not_found",
            ReportingError::DuplicateName(_) => "duplicate_name",
            ReportingError::Configuration(_) => "configuration",
            ReportingError::InvalidAggregation(_) => "invalid_aggregation",
            ReportingError::UndefinedReference { .. } => "undefined_reference",
            ReportingError::QueryExecution { .. } => "query_execution",
            ReportingError::NoData { .. } => "no_data",
            ReportingError::Validation(_) => "validation",
            ReportingError::Io(_) => "io",
            ReportingError::Parse(_) => "parse",
        }
    }
}

impl fmt::Display for ReportingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportingError::NotFound(name) => write!(f, "graph {:?} not found", name),
            ReportingError::DuplicateName(name) => {
                write!(f, "plugin {:?} is already registered", name)
            }
            ReportingError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            ReportingError::InvalidAggregation(agg) => {
                write!(f, "aggregation {:?} is invalid", agg)
            }
            ReportingError::UndefinedReference {
                reference,
                expression,
            } => write!(
                f,
                "undefined series reference {} in expression {:?}",
                reference, expression
            ),
            ReportingError::QueryExecution { status, stderr } => match status {
                Some(code) => write!(
                    f,
                    "failed to export archive data (exit status {}): {}",
                    code,
                    stderr.trim()
                ),
                None => write!(f, "failed to export archive data: {}", stderr.trim()),
            },
            ReportingError::NoData { plugin, identifier } => match identifier {
                Some(ident) => write!(f, "no archives found for {}:{}", plugin, ident),
                None => write!(f, "no archives found for {}", plugin),
            },
            ReportingError::Validation(msg) => write!(f, "validation error: {}", msg),
            ReportingError::Io(e) => write!(f, "I/O error: {}", e),
            ReportingError::Parse(msg) => write!(f, "parse error: {}", msg),
        }
    }
}

impl std::error::Error for ReportingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReportingError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ReportingError {
    fn from(e: std::io::Error) -> Self {
        ReportingError::Io(e)
    }
}

impl From<serde_json::Error> for ReportingError {
    fn from(e: serde_json::Error) -> Self {
        ReportingError::Parse(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReportingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_stable() {
        assert_eq!(ReportingError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(
            ReportingError::InvalidAggregation("sum".into()).kind(),
            "invalid_aggregation"
        );
        assert_eq!(
            ReportingError::NoData {
                plugin: "disk".into(),
                identifier: None
            }
            .kind(),
            "no_data"
        );
    }

    #[test]
    fn test_query_execution_display_includes_stderr() {
        let err = ReportingError::QueryExecution {
            status: Some(1),
            stderr: "ERROR: opening 'x.rrd': No such file\n".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("exit status 1"));
        assert!(msg.ends_with("No such file"));
    }
}
