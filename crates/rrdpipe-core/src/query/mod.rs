//! Windowed exports over a plugin's archives.
//!
//! An export compiles the plugin's archive types into `DEF`/`CDEF`/`XPORT`
//! lines, runs the archive tool once, and decodes its JSON output into an
//! [`ExportRecord`], optionally with per-series aggregations.

pub mod aggregate;
pub mod tool;
pub mod window;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};
use tracing::debug;

use crate::error::{ReportingError, Result};
use crate::expression::{Expression, ExpressionEngine, SeriesDef};
use crate::fs::FileSystem;
use crate::registry::Plugin;

pub use aggregate::Aggregation;
pub use tool::{ArchiveTool, ExportRequest, RrdTool, XportOutput};
pub use window::{MAX_TIMESTAMP, TimeUnit, TimeWindow, WindowQuery};

/// One exported row: timestamp followed by one value per legend entry.
///
/// Serialized as a flat array `[timestamp, v0, v1, ...]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRow {
    pub timestamp: i64,
    pub values: Vec<Option<f64>>,
}

impl Serialize for ExportRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.values.len() + 1))?;
        seq.serialize_element(&self.timestamp)?;
        for value in &self.values {
            seq.serialize_element(value)?;
        }
        seq.end()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct ExportMeta {
    pub start: i64,
    pub end: i64,
    pub step: i64,
    pub legend: Vec<String>,
}

/// Result of one export.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct ExportRecord {
    pub name: String,
    pub identifier: Option<String>,
    #[cfg_attr(feature = "api", schema(value_type = Vec<Vec<Option<f64>>>))]
    pub data: Vec<ExportRow>,
    pub meta: ExportMeta,
    /// Aggregation name to one value per legend entry.
    pub aggregations: BTreeMap<String, Vec<Option<f64>>>,
}

/// Compiles and runs exports against one archive root.
#[derive(Clone)]
pub struct ArchiveQueryEngine {
    root: PathBuf,
    fs: Arc<dyn FileSystem>,
    tool: Arc<dyn ArchiveTool>,
}

impl ArchiveQueryEngine {
    pub fn new(root: impl Into<PathBuf>, fs: Arc<dyn FileSystem>, tool: Arc<dyn ArchiveTool>) -> Self {
        Self {
            root: root.into(),
            fs,
            tool,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Builds the `DEF`/`CDEF`/`XPORT` lines for one identifier.
    ///
    /// Archive types whose file is missing are left out, along with every
    /// derived or extra line that references them. Fails with `NoData` when
    /// no archive file exists at all.
    pub fn compile(&self, plugin: &Plugin, identifier: Option<&str>) -> Result<Vec<String>> {
        let types = plugin.archive_types_in(identifier, self.fs.as_ref(), &self.root)?;
        if types.is_empty() {
            return Err(ReportingError::Configuration(format!(
                "plugin {:?} defines no archive types",
                plugin.name()
            )));
        }

        let defs: Vec<SeriesDef> = types
            .iter()
            .map(|t| SeriesDef {
                name: t.series_name(),
                derived: t.transform.is_some(),
            })
            .collect();
        let present: Vec<bool> = types
            .iter()
            .map(|t| {
                self.fs
                    .exists(&plugin.type_path(&self.root, identifier, t))
            })
            .collect();
        if !present.contains(&true) {
            return Err(ReportingError::NoData {
                plugin: plugin.name().to_string(),
                identifier: identifier.map(str::to_string),
            });
        }

        let engine = ExpressionEngine::new(&defs);
        let mut args = Vec::with_capacity(types.len() * 3 + plugin.extra_lines().len());

        for ((archive_type, def), _) in types
            .iter()
            .zip(&defs)
            .zip(&present)
            .filter(|(_, present)| **present)
        {
            let path = plugin.type_path(&self.root, identifier, archive_type);
            args.push(format!(
                "DEF:{}={}:{}:AVERAGE",
                def.name,
                escape_path(&path),
                archive_type.field
            ));
        }

        for (i, (archive_type, def)) in types.iter().zip(&defs).enumerate() {
            if !present[i] {
                debug!(plugin = plugin.name(), series = %def.name, "archive missing, skipping");
                continue;
            }
            match &archive_type.transform {
                Some(transform) => {
                    let expr = Expression::parse(transform);
                    let resolved = engine.resolve_transform(&expr, i)?;
                    if let Some(missing) = expr.references().into_iter().find(|&r| !present[r]) {
                        debug!(
                            plugin = plugin.name(),
                            series = %def.name,
                            missing = %defs[missing].name,
                            "transform references a missing archive, skipping"
                        );
                        continue;
                    }
                    args.push(format!("CDEF:c{}={}", def.name, resolved));
                    args.push(format!("XPORT:c{}:{}", def.name, def.name));
                }
                None => args.push(format!("XPORT:{}:{}", def.name, def.name)),
            }
        }

        let mut extra = Vec::with_capacity(plugin.extra_lines().len());
        let mut complete = true;
        for line in plugin.extra_lines() {
            let expr = Expression::parse(line);
            extra.push(engine.resolve_extra(&expr)?);
            complete &= expr.references().iter().all(|&r| present[r]);
        }
        if complete {
            args.extend(extra);
        } else {
            debug!(plugin = plugin.name(), "extra series reference a missing archive, skipping");
        }

        Ok(args)
    }

    /// Exports one identifier of `plugin` over `window`.
    pub fn export(
        &self,
        plugin: &Plugin,
        identifier: Option<&str>,
        window: TimeWindow,
        aggregate: bool,
    ) -> Result<ExportRecord> {
        let aggregations = if aggregate {
            Aggregation::parse_all(plugin.aggregation_names())?
        } else {
            Vec::new()
        };

        let request = ExportRequest {
            start: window.start,
            end: window.end,
            definitions: self.compile(plugin, identifier)?,
        };
        let output = XportOutput::parse(&self.tool.export(&request)?)?;

        let columns = output.meta.legend.len();
        let aggregations = aggregations
            .into_iter()
            .map(|agg| {
                let values = agg.apply(output.data.iter().map(Vec::as_slice), columns);
                (agg.name().to_string(), values)
            })
            .collect();

        let meta = output.meta;
        let data = output
            .data
            .into_iter()
            .enumerate()
            .map(|(i, values)| ExportRow {
                timestamp: meta.start + i as i64 * meta.step,
                values,
            })
            .collect();

        Ok(ExportRecord {
            name: plugin.name().to_string(),
            identifier: identifier.map(str::to_string),
            data,
            meta: ExportMeta {
                start: meta.start,
                end: meta.end,
                step: meta.step,
                legend: meta.legend,
            },
            aggregations,
        })
    }
}

/// The archive tool treats `:` as a field separator inside `DEF` lines.
fn escape_path(path: &Path) -> String {
    path.to_string_lossy().replace(':', "\\:")
}
