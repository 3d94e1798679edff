//! External archive tool invocation.

use std::path::PathBuf;
use std::process::Command;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{ReportingError, Result};

/// One compiled export: absolute window plus `DEF`/`CDEF`/`XPORT` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    pub start: i64,
    pub end: i64,
    pub definitions: Vec<String>,
}

/// Runs a windowed export and returns the tool's JSON output.
///
/// Implementations block; async callers run them on a blocking thread.
pub trait ArchiveTool: Send + Sync {
    fn export(&self, request: &ExportRequest) -> Result<String>;
}

/// `rrdtool xport`, optionally flushing through `rrdcached`.
#[derive(Debug, Clone)]
pub struct RrdTool {
    binary: PathBuf,
    daemon: Option<String>,
}

impl RrdTool {
    pub fn new(binary: impl Into<PathBuf>, daemon: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            daemon,
        }
    }

    fn args(&self, request: &ExportRequest) -> Vec<String> {
        let mut args = vec!["xport".to_string()];
        if let Some(daemon) = &self.daemon {
            args.push("--daemon".into());
            args.push(daemon.clone());
        }
        args.extend([
            "--start".to_string(),
            request.start.to_string(),
            "--end".to_string(),
            request.end.to_string(),
            "--json".to_string(),
        ]);
        args.extend(request.definitions.iter().cloned());
        args
    }
}

impl ArchiveTool for RrdTool {
    fn export(&self, request: &ExportRequest) -> Result<String> {
        let args = self.args(request);
        debug!(binary = %self.binary.display(), args = ?args, "running archive export");

        let output = Command::new(&self.binary).args(&args).output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            warn!(
                status = ?output.status.code(),
                stderr = %stderr.trim(),
                "archive export failed"
            );
            return Err(ReportingError::QueryExecution {
                status: output.status.code(),
                stderr,
            });
        }
        String::from_utf8(output.stdout)
            .map_err(|e| ReportingError::Parse(format!("export output is not UTF-8: {}", e)))
    }
}

/// Decoded `xport --json` document.
#[derive(Debug, Clone, Deserialize)]
pub struct XportOutput {
    pub meta: XportMeta,
    pub data: Vec<Vec<Option<f64>>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XportMeta {
    pub start: i64,
    pub end: i64,
    pub step: i64,
    pub legend: Vec<String>,
}

impl XportOutput {
    pub fn parse(json: &str) -> Result<Self> {
        let output: XportOutput = serde_json::from_str(json)?;
        if output.meta.step <= 0 {
            return Err(ReportingError::Parse(format!(
                "export step must be positive, got {}",
                output.meta.step
            )));
        }
        let width = output.meta.legend.len();
        if let Some(row) = output.data.iter().find(|row| row.len() != width) {
            return Err(ReportingError::Parse(format!(
                "export row has {} values, legend has {}",
                row.len(),
                width
            )));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ExportRequest {
        ExportRequest {
            start: 990,
            end: 1010,
            definitions: vec![
                "DEF:load_shortterm=/rrd/load/load.rrd:shortterm:AVERAGE".into(),
                "XPORT:load_shortterm:load_shortterm".into(),
            ],
        }
    }

    #[test]
    fn test_args_layout() {
        let tool = RrdTool::new("rrdtool", Some("unix:/var/run/rrdcached.sock".into()));
        assert_eq!(
            tool.args(&request()),
            vec![
                "xport",
                "--daemon",
                "unix:/var/run/rrdcached.sock",
                "--start",
                "990",
                "--end",
                "1010",
                "--json",
                "DEF:load_shortterm=/rrd/load/load.rrd:shortterm:AVERAGE",
                "XPORT:load_shortterm:load_shortterm",
            ]
        );
    }

    #[test]
    fn test_args_without_daemon() {
        let tool = RrdTool::new("rrdtool", None);
        assert_eq!(tool.args(&request())[..3], ["xport", "--start", "990"]);
    }

    #[test]
    #[cfg(unix)]
    fn test_nonzero_exit_is_query_execution_error() {
        let err = RrdTool::new("false", None).export(&request()).unwrap_err();
        match err {
            ReportingError::QueryExecution { status, .. } => assert_eq!(status, Some(1)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_binary_is_io_error() {
        let err = RrdTool::new("/nonexistent/rrdtool", None)
            .export(&request())
            .unwrap_err();
        assert_eq!(err.kind(), "io");
    }

    #[test]
    fn test_parse_output() {
        let json = r#"{
            "about": "RRDtool graph JSON output",
            "meta": {"start": 990, "end": 1010, "step": 10, "legend": ["a", "b"]},
            "data": [[1.0e+00, null], [null, null], [2.5e+00, 3.0e+00]]
        }"#;
        let output = XportOutput::parse(json).unwrap();
        assert_eq!(output.meta.legend, vec!["a", "b"]);
        assert_eq!(output.data[2], vec![Some(2.5), Some(3.0)]);
    }

    #[test]
    fn test_parse_rejects_ragged_rows() {
        let json = r#"{"meta": {"start": 0, "end": 10, "step": 10, "legend": ["a"]},
                       "data": [[1.0, 2.0]]}"#;
        assert_eq!(XportOutput::parse(json).unwrap_err().kind(), "parse");
    }
}
