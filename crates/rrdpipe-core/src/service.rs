//! Query and discovery API over the registry and the export engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ReportingConfig;
use crate::error::{ReportingError, Result};
use crate::fs::{FileSystem, RealFs};
use crate::query::{ArchiveQueryEngine, ArchiveTool, ExportRecord, RrdTool, TimeWindow, WindowQuery};
use crate::registry::{
    ArchiveType, DiscoveryContext, IdentifierMode, InterfaceSource, Plugin, PluginRegistry,
    SysfsInterfaces, all_plugins,
};
use crate::router::SubscriptionKey;

/// One graph selected by a query or subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct GraphRequest {
    pub name: String,
    #[serde(default)]
    pub identifier: Option<String>,
}

impl GraphRequest {
    pub fn new(name: impl Into<String>, identifier: Option<&str>) -> Self {
        Self {
            name: name.into(),
            identifier: identifier.map(str::to_string),
        }
    }
}

/// Discovery API entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct GraphInfo {
    pub name: String,
    /// May contain an `{identifier}` placeholder.
    pub title: String,
    pub vertical_label: String,
    /// `None` for graphs without instances.
    pub identifiers: Option<Vec<String>>,
}

/// Directory and archive types behind one requested graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginTypes {
    pub graph: GraphRequest,
    pub directory: String,
    /// Encoded identifier as it appears in metric paths.
    pub identifier: Option<String>,
    pub archive_types: Vec<ArchiveType>,
}

impl PluginTypes {
    /// Router keys whose arrivals affect this graph.
    pub fn subscription_keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<SubscriptionKey> = self
            .archive_types
            .iter()
            .map(|t| match &t.directory {
                Some(dir) => SubscriptionKey::new(format!("{}.{}.{}", dir, t.archive, t.field), None),
                None => SubscriptionKey::new(
                    format!("{}.{}.{}", self.directory, t.archive, t.field),
                    self.identifier.clone(),
                ),
            })
            .collect();
        keys.dedup();
        keys
    }
}

pub struct ReportingService {
    config: ReportingConfig,
    registry: PluginRegistry,
    engine: ArchiveQueryEngine,
    fs: Arc<dyn FileSystem>,
    interfaces: Arc<dyn InterfaceSource>,
    dev_root: PathBuf,
    proc_root: PathBuf,
}

impl ReportingService {
    pub fn new(
        config: ReportingConfig,
        registry: PluginRegistry,
        fs: Arc<dyn FileSystem>,
        tool: Arc<dyn ArchiveTool>,
        interfaces: Arc<dyn InterfaceSource>,
    ) -> Self {
        let engine = ArchiveQueryEngine::new(config.archive_root(), Arc::clone(&fs), tool);
        Self {
            config,
            registry,
            engine,
            fs,
            interfaces,
            dev_root: PathBuf::from("/dev"),
            proc_root: PathBuf::from("/proc"),
        }
    }

    /// Host setup: real filesystem, `rrdtool`, sysfs interfaces and the full
    /// plugin table.
    pub fn from_config(config: ReportingConfig) -> Result<Self> {
        config.validate()?;
        let registry = PluginRegistry::with_plugins(all_plugins(&config))?;
        let tool = RrdTool::new(&config.rrdtool, config.rrdcached_socket.clone());
        Ok(Self::new(
            config,
            registry,
            Arc::new(RealFs::new()),
            Arc::new(tool),
            Arc::new(SysfsInterfaces::default()),
        ))
    }

    pub fn with_dev_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.dev_root = path.into();
        self
    }

    pub fn with_proc_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.proc_root = path.into();
        self
    }

    pub fn config(&self) -> &ReportingConfig {
        &self.config
    }

    pub fn archive_root(&self) -> &Path {
        self.config.archive_root()
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn filesystem(&self) -> Arc<dyn FileSystem> {
        Arc::clone(&self.fs)
    }

    fn discovery_context(&self) -> DiscoveryContext<'_> {
        DiscoveryContext {
            fs: self.fs.as_ref(),
            root: self.config.archive_root(),
            dev_root: &self.dev_root,
            proc_root: &self.proc_root,
            interfaces: self.interfaces.as_ref(),
        }
    }

    /// Current identifiers of `plugin`, `[None]` when it has no instances.
    pub fn identifiers(&self, plugin: &Plugin) -> Result<Vec<Option<String>>> {
        self.registry.identifiers(plugin, &self.discovery_context())
    }

    /// Discovery API: every graph with its current identifiers.
    ///
    /// A plugin whose discovery fails is listed with no identifiers.
    pub fn graphs(&self) -> Vec<GraphInfo> {
        self.registry
            .iter()
            .map(|plugin| {
                let identifiers = match plugin.identifier_mode() {
                    IdentifierMode::None => None,
                    IdentifierMode::PerInstance => {
                        Some(match self.identifiers(plugin) {
                            Ok(ids) => ids.into_iter().flatten().collect(),
                            Err(e) => {
                                warn!(plugin = plugin.name(), error = %e, "identifier discovery failed");
                                Vec::new()
                            }
                        })
                    }
                };
                GraphInfo {
                    name: plugin.name().to_string(),
                    title: plugin.title_template().to_string(),
                    vertical_label: plugin.vertical_label_text().to_string(),
                    identifiers,
                }
            })
            .collect()
    }

    /// Exports one graph over an already resolved window.
    pub fn export(
        &self,
        graph: &GraphRequest,
        window: TimeWindow,
        aggregate: bool,
    ) -> Result<ExportRecord> {
        let plugin = self.registry.get(&graph.name)?;
        self.engine
            .export(plugin, graph.identifier.as_deref(), window, aggregate)
    }

    /// Query API: exports each requested graph, in request order.
    pub fn get_data(&self, graphs: &[GraphRequest], query: &WindowQuery) -> Result<Vec<ExportRecord>> {
        let window = query.resolve(Utc::now())?;
        debug!(graphs = graphs.len(), start = window.start, end = window.end, "get_data");
        graphs
            .iter()
            .map(|graph| self.export(graph, window, query.aggregate))
            .collect()
    }

    /// Exports every plugin for every identifier it currently has.
    /// Identifiers whose archives are all missing are left out.
    pub fn get_all(&self, query: &WindowQuery) -> Result<Vec<ExportRecord>> {
        let window = query.resolve(Utc::now())?;
        let mut records = Vec::new();
        for plugin in self.registry.iter() {
            for identifier in self.identifiers(plugin)? {
                match self
                    .engine
                    .export(plugin, identifier.as_deref(), window, query.aggregate)
                {
                    Ok(record) => records.push(record),
                    Err(ReportingError::NoData { plugin, identifier }) => {
                        debug!(plugin = %plugin, identifier = ?identifier, "no archives, skipping");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(records)
    }

    /// Directory and archive types behind each requested graph.
    pub fn plugin_and_types(&self, graphs: &[GraphRequest]) -> Result<Vec<PluginTypes>> {
        graphs
            .iter()
            .map(|graph| {
                let plugin = self.registry.get(&graph.name)?;
                let identifier = graph.identifier.as_deref();
                Ok(PluginTypes {
                    graph: graph.clone(),
                    directory: plugin.directory().to_string(),
                    identifier: plugin.subscription_identifier(identifier),
                    archive_types: plugin.archive_types_in(
                        identifier,
                        self.fs.as_ref(),
                        self.config.archive_root(),
                    )?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockArchiveTool, MockFs};
    use crate::registry::StaticInterfaces;
    use crate::registry::discovery::ArchiveDirs;

    fn service(fs: MockFs, tool: Arc<MockArchiveTool>) -> ReportingService {
        let config = ReportingConfig {
            archive_root: PathBuf::from("/rrd"),
            ..ReportingConfig::default()
        };
        let registry = PluginRegistry::with_plugins(vec![
            Plugin::new("cpu", "cpu")
                .title("CPU {identifier}")
                .vertical_label("%CPU")
                .archive_types(vec![ArchiveType::new("value", "value")])
                .discovery(ArchiveDirs::new("cpu", "value.rrd")),
            Plugin::new("load", "load")
                .title("System Load")
                .archive_types(vec![
                    ArchiveType::new("load", "shortterm"),
                    ArchiveType::new("load", "midterm"),
                ]),
        ])
        .unwrap();
        ReportingService::new(
            config,
            registry,
            Arc::new(fs),
            tool,
            Arc::new(StaticInterfaces::default()),
        )
    }

    fn archives() -> MockFs {
        let mut fs = MockFs::new();
        fs.add_archive("/rrd", "cpu-0", "value");
        fs.add_archive("/rrd", "cpu-1", "value");
        fs.add_archive("/rrd", "load", "load");
        fs
    }

    #[test]
    fn test_graphs_lists_identifiers() {
        let service = service(archives(), Arc::new(MockArchiveTool::new(10)));
        let graphs = service.graphs();

        assert_eq!(graphs.len(), 2);
        assert_eq!(graphs[0].name, "cpu");
        assert_eq!(graphs[0].title, "CPU {identifier}");
        assert_eq!(
            graphs[0].identifiers,
            Some(vec!["0".to_string(), "1".to_string()])
        );
        assert_eq!(graphs[1].identifiers, None);
    }

    #[test]
    fn test_get_data_round_trip() {
        let tool = Arc::new(MockArchiveTool::new(10));
        tool.record("/rrd/cpu-0/value.rrd", "value", 1000, 42.0);
        let service = service(archives(), tool);

        let records = service
            .get_data(
                &[GraphRequest::new("cpu", Some("0"))],
                &WindowQuery::absolute(990, 1010).with_aggregate(false),
            )
            .unwrap();
        assert_eq!(records.len(), 1);
        let known: Vec<(i64, Option<f64>)> = records[0]
            .data
            .iter()
            .filter(|row| row.values[0].is_some())
            .map(|row| (row.timestamp, row.values[0]))
            .collect();
        assert_eq!(known, vec![(1000, Some(42.0))]);
    }

    #[test]
    fn test_get_data_unknown_graph() {
        let service = service(archives(), Arc::new(MockArchiveTool::new(10)));
        let err = service
            .get_data(&[GraphRequest::new("nope", None)], &WindowQuery::default())
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_get_data_rejects_mixed_window() {
        let tool = Arc::new(MockArchiveTool::new(10));
        let service = service(archives(), tool.clone());
        let query = WindowQuery {
            unit: Some(crate::query::TimeUnit::Day),
            start: Some(1),
            ..WindowQuery::default()
        };
        let err = service
            .get_data(&[GraphRequest::new("load", None)], &query)
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert_eq!(tool.calls(), 0);
    }

    #[test]
    fn test_get_all_covers_every_identifier() {
        let mut fs = archives();
        fs.add_dir("/rrd/cpu-2");
        let tool = Arc::new(MockArchiveTool::new(10));
        let service = service(fs, tool.clone());

        let records = service.get_all(&WindowQuery::default()).unwrap();
        let names: Vec<(&str, Option<&str>)> = records
            .iter()
            .map(|r| (r.name.as_str(), r.identifier.as_deref()))
            .collect();
        assert_eq!(names, vec![("cpu", Some("0")), ("cpu", Some("1")), ("load", None)]);
        assert_eq!(tool.calls(), 3);
    }

    #[test]
    fn test_plugin_and_types_keys() {
        let service = service(archives(), Arc::new(MockArchiveTool::new(10)));
        let types = service
            .plugin_and_types(&[
                GraphRequest::new("cpu", Some("0")),
                GraphRequest::new("load", None),
            ])
            .unwrap();

        assert_eq!(types[0].directory, "cpu");
        assert_eq!(
            types[0].subscription_keys(),
            vec![SubscriptionKey::new("cpu.value.value", Some("0".into()))]
        );
        assert_eq!(
            types[1].subscription_keys(),
            vec![
                SubscriptionKey::new("load.load.shortterm", None),
                SubscriptionKey::new("load.load.midterm", None),
            ]
        );
    }

    #[test]
    fn test_cputemp_spans_core_directories() {
        let mut fs = MockFs::new();
        fs.add_archive("/rrd", "cputemp-0", "temperature");
        fs.add_archive("/rrd", "cputemp-1", "temperature");
        let config = ReportingConfig {
            archive_root: PathBuf::from("/rrd"),
            ..ReportingConfig::default()
        };
        let registry = PluginRegistry::with_plugins(all_plugins(&config)).unwrap();
        let service = ReportingService::new(
            config,
            registry,
            Arc::new(fs),
            Arc::new(MockArchiveTool::new(10)),
            Arc::new(StaticInterfaces::default()),
        );
        let graph = GraphRequest::new("cputemp", None);

        let types = service.plugin_and_types(std::slice::from_ref(&graph)).unwrap();
        assert_eq!(
            types[0].subscription_keys(),
            vec![
                SubscriptionKey::new("cputemp-0.temperature.value", None),
                SubscriptionKey::new("cputemp-1.temperature.value", None),
            ]
        );

        let records = service
            .get_data(&[graph], &WindowQuery::absolute(990, 1010).with_aggregate(false))
            .unwrap();
        assert_eq!(records[0].identifier, None);
        assert_eq!(
            records[0].meta.legend,
            vec!["cputemp0_temperature_value", "cputemp1_temperature_value"]
        );
    }
}
