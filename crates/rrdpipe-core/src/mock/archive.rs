//! In-memory archive tool for testing exports without `rrdtool`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;

use crate::error::{ReportingError, Result};
use crate::query::{ArchiveTool, ExportRequest};

/// Answers `DEF`/`XPORT` exports from recorded samples.
///
/// Raw series are looked up by `(path, field)`; derived (`CDEF`) series are
/// not evaluated and export as unknown. Rows are aligned to the step and
/// cover `[start, end]`.
#[derive(Debug)]
pub struct MockArchiveTool {
    step: i64,
    samples: Mutex<HashMap<(String, String), BTreeMap<i64, f64>>>,
    failure: Mutex<Option<String>>,
    requests: Mutex<Vec<ExportRequest>>,
    calls: AtomicUsize,
}

impl MockArchiveTool {
    pub fn new(step: i64) -> Self {
        Self {
            step,
            samples: Mutex::new(HashMap::new()),
            failure: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Stores a sample, as the collector would.
    pub fn record(&self, path: impl AsRef<Path>, field: &str, timestamp: i64, value: f64) {
        let key = (path.as_ref().to_string_lossy().into_owned(), field.to_string());
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.entry(key).or_default().insert(timestamp, value);
    }

    /// Makes the next export fail with exit status 1 and `stderr`.
    pub fn fail_next(&self, stderr: &str) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(stderr.to_string());
    }

    /// Number of exports run so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<ExportRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }
}

/// `DEF:<name>=<path>:<field>:AVERAGE` with `\:` escapes in the path.
fn parse_def(line: &str) -> Option<(String, String, String)> {
    let (name, rest) = line.strip_prefix("DEF:")?.split_once('=')?;
    let rest = rest.strip_suffix(":AVERAGE")?;
    let (path, field) = rest.rsplit_once(':')?;
    Some((name.to_string(), path.replace("\\:", ":"), field.to_string()))
}

/// `XPORT:<vname>:<label>`
fn parse_xport(line: &str) -> Option<(String, String)> {
    let (vname, label) = line.strip_prefix("XPORT:")?.split_once(':')?;
    Some((vname.to_string(), label.to_string()))
}

impl ArchiveTool for MockArchiveTool {
    fn export(&self, request: &ExportRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        if let Some(stderr) = self.failure.lock().unwrap_or_else(|e| e.into_inner()).take() {
            return Err(ReportingError::QueryExecution {
                status: Some(1),
                stderr,
            });
        }

        let mut defs = HashMap::new();
        let mut exports = Vec::new();
        for line in &request.definitions {
            if let Some((name, path, field)) = parse_def(line) {
                defs.insert(name, (path, field));
            } else if let Some(export) = parse_xport(line) {
                exports.push(export);
            } else if !line.starts_with("CDEF:") {
                return Err(ReportingError::QueryExecution {
                    status: Some(1),
                    stderr: format!("ERROR: invalid definition '{}'", line),
                });
            }
        }

        let start = request.start.div_euclid(self.step) * self.step;
        let timestamps: Vec<i64> = (start..=request.end).step_by(self.step as usize).collect();

        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let columns: Vec<Vec<Option<f64>>> = exports
            .iter()
            .map(|(vname, _)| {
                let series = defs
                    .get(vname)
                    .and_then(|(path, field)| samples.get(&(path.clone(), field.clone())));
                timestamps
                    .iter()
                    .map(|t| series.and_then(|s| s.get(t).copied()))
                    .collect()
            })
            .collect();

        let data: Vec<Vec<Option<f64>>> = (0..timestamps.len())
            .map(|row| columns.iter().map(|col| col[row]).collect())
            .collect();
        let legend: Vec<&str> = exports.iter().map(|(_, label)| label.as_str()).collect();

        Ok(json!({
            "about": "RRDtool graph JSON output",
            "meta": {
                "start": start,
                "end": timestamps.last().copied().unwrap_or(start),
                "step": self.step,
                "legend": legend,
            },
            "data": data,
        })
        .to_string())
    }
}
