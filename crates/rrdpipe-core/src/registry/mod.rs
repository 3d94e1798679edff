//! Metric plugin table.
//!
//! A plugin names one graph: which archive directory it reads, which
//! archive types it exports, how its identifiers are discovered. The table
//! is built once at startup from [`plugins::all_plugins`] and is immutable
//! afterwards; only identifier discovery is re-run on every call.

pub mod discovery;
pub mod plugins;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{ReportingError, Result};
use crate::fs::FileSystem;

pub use discovery::{Discovery, DiscoveryContext, InterfaceSource, StaticInterfaces, SysfsInterfaces};
pub use plugins::all_plugins;

/// Aggregations computed by default when an export asks for them.
pub const DEFAULT_AGGREGATIONS: &[&str] = &["min", "mean", "max"];

/// One series kind inside a plugin: `<archive>.rrd`, data source `field`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveType {
    pub archive: String,
    pub field: String,
    /// Postfix transform; `%name%` and `%name_i%` are resolved at export time.
    pub transform: Option<String>,
    /// Archive directory overriding the plugin's own.
    pub directory: Option<String>,
}

impl ArchiveType {
    pub fn new(archive: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            archive: archive.into(),
            field: field.into(),
            transform: None,
            directory: None,
        }
    }

    pub fn with_transform(mut self, transform: impl Into<String>) -> Self {
        self.transform = Some(transform.into());
        self
    }

    pub fn in_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// Raw series name used in `DEF` lines.
    pub fn series_name(&self) -> String {
        match &self.directory {
            Some(dir) => format!("{}_{}_{}", dir.replace('-', ""), self.archive, self.field),
            None => format!("{}_{}", self.archive, self.field),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierMode {
    None,
    PerInstance,
}

/// Archive types of a plugin.
#[derive(Clone)]
pub enum ArchiveTypes {
    /// Same list for every identifier; the identifier selects the directory.
    Fixed(Vec<ArchiveType>),
    /// Computed from the identifier; the identifier is part of the archive
    /// name and the directory is shared.
    PerIdentifier(fn(&str) -> Vec<ArchiveType>),
    /// Derived from the archive tree on every call; empty means no data.
    Scanned(fn(&dyn FileSystem, &Path) -> io::Result<Vec<ArchiveType>>),
}

impl fmt::Debug for ArchiveTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveTypes::Fixed(types) => f.debug_tuple("Fixed").field(types).finish(),
            ArchiveTypes::PerIdentifier(_) => f.write_str("PerIdentifier(..)"),
            ArchiveTypes::Scanned(_) => f.write_str("Scanned(..)"),
        }
    }
}

/// A registered graph.
pub struct Plugin {
    name: String,
    directory: String,
    title: String,
    vertical_label: String,
    archive_types: ArchiveTypes,
    extra: Vec<String>,
    aggregations: Vec<String>,
    encode: fn(&str) -> String,
    discovery: Option<Box<dyn Discovery>>,
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("directory", &self.directory)
            .field("archive_types", &self.archive_types)
            .field("instance_scoped", &self.discovery.is_some())
            .finish()
    }
}

fn identity(identifier: &str) -> String {
    identifier.to_string()
}

impl Plugin {
    /// A plugin reading archives from `root/<directory>[-<identifier>]`.
    pub fn new(name: impl Into<String>, directory: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            title: String::new(),
            vertical_label: String::new(),
            archive_types: ArchiveTypes::Fixed(Vec::new()),
            extra: Vec::new(),
            aggregations: DEFAULT_AGGREGATIONS.iter().map(|s| s.to_string()).collect(),
            encode: identity,
            discovery: None,
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn vertical_label(mut self, label: impl Into<String>) -> Self {
        self.vertical_label = label.into();
        self
    }

    pub fn archive_types(mut self, types: Vec<ArchiveType>) -> Self {
        self.archive_types = ArchiveTypes::Fixed(types);
        self
    }

    pub fn per_identifier(mut self, types: fn(&str) -> Vec<ArchiveType>) -> Self {
        self.archive_types = ArchiveTypes::PerIdentifier(types);
        self
    }

    pub fn scanned(mut self, types: fn(&dyn FileSystem, &Path) -> io::Result<Vec<ArchiveType>>) -> Self {
        self.archive_types = ArchiveTypes::Scanned(types);
        self
    }

    /// Appends extra `CDEF`/`XPORT` lines (whitespace separated).
    pub fn extra(mut self, lines: &str) -> Self {
        self.extra
            .extend(lines.split_whitespace().map(|s| s.to_string()));
        self
    }

    pub fn aggregations(mut self, names: &[&str]) -> Self {
        self.aggregations = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn encode_with(mut self, encode: fn(&str) -> String) -> Self {
        self.encode = encode;
        self
    }

    pub fn discovery(mut self, discovery: impl Discovery + 'static) -> Self {
        self.discovery = Some(Box::new(discovery));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &str {
        &self.directory
    }

    /// Display title; may contain an `{identifier}` placeholder.
    pub fn title_template(&self) -> &str {
        &self.title
    }

    pub fn vertical_label_text(&self) -> &str {
        &self.vertical_label
    }

    pub fn extra_lines(&self) -> &[String] {
        &self.extra
    }

    pub fn aggregation_names(&self) -> &[String] {
        &self.aggregations
    }

    pub fn identifier_mode(&self) -> IdentifierMode {
        if self.discovery.is_some() {
            IdentifierMode::PerInstance
        } else {
            IdentifierMode::None
        }
    }

    /// Whether the identifier selects the archive directory.
    fn identifier_in_directory(&self) -> bool {
        matches!(self.archive_types, ArchiveTypes::Fixed(_))
    }

    /// On-disk form of an identifier.
    pub fn encode(&self, identifier: &str) -> String {
        (self.encode)(identifier)
    }

    /// Archive types for one identifier, in export order.
    ///
    /// Scanned plugins need the archive tree; use [`Plugin::archive_types_in`].
    pub fn archive_types_for(&self, identifier: Option<&str>) -> Result<Vec<ArchiveType>> {
        match (&self.archive_types, identifier) {
            (ArchiveTypes::Fixed(types), _) => Ok(types.clone()),
            (ArchiveTypes::PerIdentifier(types), Some(ident)) => Ok(types(ident)),
            (ArchiveTypes::PerIdentifier(_), None) => Err(ReportingError::Validation(format!(
                "graph {:?} requires an identifier",
                self.name
            ))),
            (ArchiveTypes::Scanned(_), _) => Err(ReportingError::Configuration(format!(
                "graph {:?} scans its archive types from the archive root",
                self.name
            ))),
        }
    }

    /// Archive types for one identifier under `root`.
    ///
    /// A scan that finds nothing fails with `NoData`.
    pub fn archive_types_in(
        &self,
        identifier: Option<&str>,
        fs: &dyn FileSystem,
        root: &Path,
    ) -> Result<Vec<ArchiveType>> {
        let ArchiveTypes::Scanned(scan) = &self.archive_types else {
            return self.archive_types_for(identifier);
        };
        let types = scan(fs, root)?;
        if types.is_empty() {
            return Err(ReportingError::NoData {
                plugin: self.name.clone(),
                identifier: identifier.map(str::to_string),
            });
        }
        Ok(types)
    }

    /// Directory name holding this identifier's archives.
    pub fn directory_for(&self, identifier: Option<&str>) -> String {
        match identifier {
            Some(ident) if self.identifier_in_directory() => {
                format!("{}-{}", self.directory, self.encode(ident))
            }
            _ => self.directory.clone(),
        }
    }

    /// `root/<directory>[-<identifier>]/<archive>.rrd`.
    pub fn archive_path(&self, root: &Path, identifier: Option<&str>, archive: &str) -> PathBuf {
        root.join(self.directory_for(identifier))
            .join(format!("{}.rrd", archive))
    }

    /// Archive file behind one archive type.
    pub fn type_path(&self, root: &Path, identifier: Option<&str>, archive_type: &ArchiveType) -> PathBuf {
        match &archive_type.directory {
            Some(dir) => root.join(dir).join(format!("{}.rrd", archive_type.archive)),
            None => self.archive_path(root, identifier, &archive_type.archive),
        }
    }

    /// Identifier part of this plugin's subscription keys.
    pub fn subscription_identifier(&self, identifier: Option<&str>) -> Option<String> {
        match identifier {
            Some(ident) if self.identifier_in_directory() => Some(self.encode(ident)),
            _ => None,
        }
    }

    fn validate(&self) -> Result<()> {
        if matches!(&self.archive_types, ArchiveTypes::Fixed(types) if types.is_empty()) {
            return Err(ReportingError::Configuration(format!(
                "plugin {:?} defines no archive types",
                self.name
            )));
        }
        Ok(())
    }
}

/// Registered plugins in registration order, indexed by name.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: Vec<Plugin>,
    index: HashMap<String, usize>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from a plugin list, failing on the first defect.
    pub fn with_plugins(plugins: Vec<Plugin>) -> Result<Self> {
        let mut registry = Self::new();
        for plugin in plugins {
            registry.register(plugin)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, plugin: Plugin) -> Result<()> {
        if self.index.contains_key(plugin.name()) {
            return Err(ReportingError::DuplicateName(plugin.name));
        }
        plugin.validate()?;
        self.index.insert(plugin.name.clone(), self.plugins.len());
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Plugin> {
        self.index
            .get(name)
            .map(|&i| &self.plugins[i])
            .ok_or_else(|| ReportingError::NotFound(name.to_string()))
    }

    /// Current identifiers of a plugin; `[None]` when it is not instance-scoped.
    pub fn identifiers(
        &self,
        plugin: &Plugin,
        ctx: &DiscoveryContext<'_>,
    ) -> Result<Vec<Option<String>>> {
        match &plugin.discovery {
            Some(discovery) => Ok(discovery.discover(ctx)?.into_iter().map(Some).collect()),
            None => Ok(vec![None]),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Plugin> {
        self.plugins.iter()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
