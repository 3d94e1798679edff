//! Identifier discovery for instance-scoped plugins.
//!
//! Each discovery strategy re-derives identifiers on every call: disks,
//! interfaces and mounts appear and disappear while the daemon runs.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use crate::fs::{FileSystem, read_dir_or_empty};

/// Everything a discovery strategy may consult.
pub struct DiscoveryContext<'a> {
    pub fs: &'a dyn FileSystem,
    /// Archive root (`.../rrd/localhost`).
    pub root: &'a Path,
    /// Device node directory, normally `/dev`.
    pub dev_root: &'a Path,
    /// procfs mount point, normally `/proc`.
    pub proc_root: &'a Path,
    pub interfaces: &'a dyn InterfaceSource,
}

/// Produces the identifiers of one plugin.
pub trait Discovery: Send + Sync {
    fn discover(&self, ctx: &DiscoveryContext<'_>) -> io::Result<Vec<String>>;
}

/// Source of configured network interface names.
pub trait InterfaceSource: Send + Sync {
    fn interfaces(&self, fs: &dyn FileSystem) -> io::Result<Vec<String>>;
}

/// Interface names from `/sys/class/net`.
#[derive(Debug, Clone)]
pub struct SysfsInterfaces {
    path: PathBuf,
}

impl SysfsInterfaces {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for SysfsInterfaces {
    fn default() -> Self {
        Self::new("/sys/class/net")
    }
}

impl InterfaceSource for SysfsInterfaces {
    fn interfaces(&self, fs: &dyn FileSystem) -> io::Result<Vec<String>> {
        Ok(read_dir_or_empty(fs, &self.path)?
            .iter()
            .filter_map(|p| file_name(p))
            .collect())
    }
}

/// Fixed interface list, for tests and hosts without sysfs.
#[derive(Debug, Clone, Default)]
pub struct StaticInterfaces(pub Vec<String>);

impl InterfaceSource for StaticInterfaces {
    fn interfaces(&self, _fs: &dyn FileSystem) -> io::Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

// ============================================================
// Sort keys
// ============================================================

/// Splits `name` into a non-empty prefix and a trailing decimal number.
fn split_numeric_suffix(name: &str) -> Option<(&str, &str)> {
    let digits = name.len() - name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 || digits == name.len() {
        return None;
    }
    Some(name.split_at(name.len() - digits))
}

/// Disk ordering: by non-numeric prefix, then numeric suffix as an integer,
/// so `disk2 < disk10`. Names without a suffix sort before numbered ones
/// sharing the same prefix.
pub fn compare_disks(a: &str, b: &str) -> Ordering {
    disk_key(a).cmp(&disk_key(b))
}

fn disk_key(name: &str) -> (&str, Option<u128>) {
    match split_numeric_suffix(name) {
        Some((prefix, digits)) => match digits.parse() {
            Ok(n) => (prefix, Some(n)),
            Err(_) => (name, None),
        },
        None => (name, None),
    }
}

/// Target port ordering: `ha` first, then by the part before the last `:`,
/// then disk-style on the remainder (names without a number rank as -1).
pub fn compare_ports(a: &str, b: &str) -> Ordering {
    port_key(a).cmp(&port_key(b))
}

fn port_key(entry: &str) -> (&str, &str, i128) {
    let (prefix, body) = if entry == "ha" {
        ("0", entry)
    } else {
        match entry.rsplit_once(':') {
            Some((p, b)) if !p.is_empty() && !b.is_empty() => (p, b),
            _ => ("", entry),
        }
    };
    match split_numeric_suffix(body) {
        Some((name, digits)) => match digits.parse::<i128>() {
            Ok(n) => (prefix, name, n),
            Err(_) => (prefix, body, -1),
        },
        None => (prefix, body, -1),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Disk,
    Port,
    /// Keep discovery order.
    Unsorted,
}

/// Applies the ordering contract and removes duplicates.
pub fn order_identifiers(mut ids: Vec<String>, order: SortOrder) -> Vec<String> {
    match order {
        SortOrder::Disk => ids.sort_by(|a, b| compare_disks(a, b)),
        SortOrder::Port => ids.sort_by(|a, b| compare_ports(a, b)),
        SortOrder::Unsorted => {
            let mut seen = HashSet::new();
            ids.retain(|id| seen.insert(id.clone()));
            return ids;
        }
    }
    ids.dedup();
    ids
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|s| s.to_string())
}

// ============================================================
// Strategies
// ============================================================

/// Where the identifier starts inside a `<plugin>-<identifier>` directory name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    /// After the first `-` (identifiers may contain dashes).
    First,
    /// After the last `-`.
    Last,
}

/// Scans `root/<prefix>-*` directories that contain a marker archive.
#[derive(Debug, Clone)]
pub struct ArchiveDirs {
    pub prefix: &'static str,
    pub marker: &'static str,
    pub split: Split,
    /// Require `/dev/<identifier>` to exist.
    pub require_device: bool,
    pub skip_prefixes: &'static [&'static str],
    pub skip_suffixes: &'static [&'static str],
    pub order: SortOrder,
}

impl ArchiveDirs {
    pub fn new(prefix: &'static str, marker: &'static str) -> Self {
        Self {
            prefix,
            marker,
            split: Split::Last,
            require_device: false,
            skip_prefixes: &[],
            skip_suffixes: &[],
            order: SortOrder::Disk,
        }
    }

    pub fn split(mut self, split: Split) -> Self {
        self.split = split;
        self
    }

    pub fn require_device(mut self) -> Self {
        self.require_device = true;
        self
    }

    pub fn skip_prefixes(mut self, prefixes: &'static [&'static str]) -> Self {
        self.skip_prefixes = prefixes;
        self
    }

    pub fn skip_suffixes(mut self, suffixes: &'static [&'static str]) -> Self {
        self.skip_suffixes = suffixes;
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    fn identifier<'n>(&self, dir_name: &'n str) -> Option<&'n str> {
        let rest = dir_name.strip_prefix(self.prefix)?.strip_prefix('-')?;
        let ident = match self.split {
            Split::First => rest,
            Split::Last => rest.rsplit('-').next().unwrap_or(rest),
        };
        (!ident.is_empty()).then_some(ident)
    }
}

impl Discovery for ArchiveDirs {
    fn discover(&self, ctx: &DiscoveryContext<'_>) -> io::Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in read_dir_or_empty(ctx.fs, ctx.root)? {
            let Some(dir_name) = file_name(&entry) else {
                continue;
            };
            let Some(ident) = self.identifier(&dir_name) else {
                continue;
            };
            if self.skip_prefixes.iter().any(|p| ident.starts_with(p))
                || self.skip_suffixes.iter().any(|s| ident.ends_with(s))
            {
                continue;
            }
            if self.require_device && !ctx.fs.exists(&ctx.dev_root.join(ident)) {
                continue;
            }
            if ctx.fs.exists(&entry.join(self.marker)) {
                ids.push(ident.to_string());
            }
        }
        Ok(order_identifiers(ids, self.order))
    }
}

/// Interface archive directories, restricted to interfaces the host knows.
#[derive(Debug, Clone)]
pub struct InterfaceDirs;

impl Discovery for InterfaceDirs {
    fn discover(&self, ctx: &DiscoveryContext<'_>) -> io::Result<Vec<String>> {
        let known: HashSet<String> = ctx.interfaces.interfaces(ctx.fs)?.into_iter().collect();
        let dirs = ArchiveDirs::new("interface", "if_octets.rrd");
        Ok(dirs
            .discover(ctx)?
            .into_iter()
            .filter(|ident| known.contains(ident))
            .collect())
    }
}

/// ZFS mount points (`/` and `/mnt/...`) that have a free-space archive.
#[derive(Debug, Clone)]
pub struct ZfsMounts;

impl Discovery for ZfsMounts {
    fn discover(&self, ctx: &DiscoveryContext<'_>) -> io::Result<Vec<String>> {
        let mounts = ctx.fs.read_to_string(&ctx.proc_root.join("mounts"))?;
        let mut ids = Vec::new();
        for line in mounts.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let (Some(mount_point), Some(fs_type)) = (fields.get(1), fields.get(2)) else {
                continue;
            };
            if *fs_type != "zfs" {
                continue;
            }
            if *mount_point != "/" && !mount_point.starts_with("/mnt") {
                continue;
            }
            let dir = format!("df-{}", encode_mount_point(mount_point));
            if ctx
                .fs
                .exists(&ctx.root.join(dir).join("df_complex-free.rrd"))
            {
                ids.push(mount_point.to_string());
            }
        }
        Ok(order_identifiers(ids, SortOrder::Unsorted))
    }
}

/// Directory form of a mount point: `/` is `root`, `/mnt/tank` is `mnt-tank`.
pub fn encode_mount_point(path: &str) -> String {
    if path == "/" {
        return "root".to_string();
    }
    path.trim_matches('/').replace('/', "-")
}

/// Per-disk archives flattened into `root/geom_stat/<stat>-<disk>.rrd`.
#[derive(Debug, Clone)]
pub struct GeomStatFiles {
    pub stat: &'static str,
}

impl Discovery for GeomStatFiles {
    fn discover(&self, ctx: &DiscoveryContext<'_>) -> io::Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in read_dir_or_empty(ctx.fs, &ctx.root.join("geom_stat"))? {
            let Some(name) = file_name(&entry) else {
                continue;
            };
            let Some(ident) = name
                .strip_prefix(self.stat)
                .and_then(|s| s.strip_prefix('-'))
                .and_then(|s| s.strip_suffix(".rrd"))
            else {
                continue;
            };
            if !is_disk_name(ident) || ident.starts_with("pass") {
                continue;
            }
            if !ctx.fs.exists(&ctx.dev_root.join(ident)) {
                continue;
            }
            ids.push(ident.to_string());
        }
        Ok(order_identifiers(ids, SortOrder::Disk))
    }
}

/// `^[a-z]+[0-9]+$`
fn is_disk_name(name: &str) -> bool {
    match split_numeric_suffix(name) {
        Some((prefix, _)) => prefix.bytes().all(|b| b.is_ascii_lowercase()),
        None => false,
    }
}

/// A constant identifier list.
#[derive(Debug, Clone)]
pub struct FixedIdentifiers(pub &'static [&'static str]);

impl Discovery for FixedIdentifiers {
    fn discover(&self, _ctx: &DiscoveryContext<'_>) -> io::Result<Vec<String>> {
        Ok(self.0.iter().map(|s| s.to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockFs;

    fn ctx<'a>(fs: &'a MockFs, interfaces: &'a StaticInterfaces) -> DiscoveryContext<'a> {
        DiscoveryContext {
            fs,
            root: Path::new("/rrd"),
            dev_root: Path::new("/dev"),
            proc_root: Path::new("/proc"),
            interfaces,
        }
    }

    #[test]
    fn test_disk_order_is_numeric() {
        let ids = vec!["disk10".to_string(), "disk2".into(), "disk1".into()];
        assert_eq!(
            order_identifiers(ids, SortOrder::Disk),
            vec!["disk1", "disk2", "disk10"]
        );
    }

    #[test]
    fn test_disk_order_groups_by_prefix() {
        let ids = vec![
            "nvd0".to_string(),
            "ada10".into(),
            "ada".into(),
            "ada9".into(),
        ];
        assert_eq!(
            order_identifiers(ids, SortOrder::Disk),
            vec!["ada", "ada9", "ada10", "nvd0"]
        );
    }

    #[test]
    fn test_port_order() {
        let ids = vec![
            "iqn.2005:target2".to_string(),
            "iqn.2005:target10".into(),
            "ha".into(),
            "camsim".into(),
        ];
        assert_eq!(
            order_identifiers(ids, SortOrder::Port),
            vec!["camsim", "ha", "iqn.2005:target2", "iqn.2005:target10"]
        );
    }

    #[test]
    fn test_duplicates_removed() {
        let ids = vec!["ada1".to_string(), "ada1".into(), "ada0".into()];
        assert_eq!(order_identifiers(ids, SortOrder::Disk), vec!["ada0", "ada1"]);
    }

    #[test]
    fn test_archive_dirs_requires_marker_and_device() {
        let mut fs = MockFs::new();
        fs.add_archive("/rrd", "disk-ada10", "disk_octets");
        fs.add_archive("/rrd", "disk-ada2", "disk_octets");
        fs.add_archive("/rrd", "disk-pass0", "disk_octets");
        fs.add_archive("/rrd", "disk-ada3", "other");
        fs.add_archive("/rrd", "disk-gone0", "disk_octets");
        for dev in ["ada10", "ada2", "pass0", "ada3"] {
            fs.add_file(format!("/dev/{dev}"), "");
        }
        let interfaces = StaticInterfaces::default();

        let dirs = ArchiveDirs::new("disk", "disk_octets.rrd")
            .split(Split::First)
            .require_device()
            .skip_prefixes(&["pass"]);
        let ids = dirs.discover(&ctx(&fs, &interfaces)).unwrap();
        assert_eq!(ids, vec!["ada2", "ada10"]);
    }

    #[test]
    fn test_archive_dirs_missing_root_is_empty() {
        let fs = MockFs::new();
        let interfaces = StaticInterfaces::default();
        let dirs = ArchiveDirs::new("disktemp", "temperature.rrd");
        assert!(dirs.discover(&ctx(&fs, &interfaces)).unwrap().is_empty());
    }

    #[test]
    fn test_interface_dirs_filtered_by_known_interfaces() {
        let mut fs = MockFs::new();
        fs.add_archive("/rrd", "interface-em0", "if_octets");
        fs.add_archive("/rrd", "interface-em1", "if_octets");
        fs.add_archive("/rrd", "interface-lagg0", "if_octets");
        let interfaces = StaticInterfaces(vec!["em1".into(), "em0".into()]);

        let ids = InterfaceDirs.discover(&ctx(&fs, &interfaces)).unwrap();
        assert_eq!(ids, vec!["em0", "em1"]);
    }

    #[test]
    fn test_zfs_mounts() {
        let mut fs = MockFs::new();
        fs.add_file(
            "/proc/mounts",
            "boot-pool/ROOT/default / zfs rw 0 0\n\
             tank /mnt/tank zfs rw 0 0\n\
             tank/home /home zfs rw 0 0\n\
             tmpfs /mnt/scratch tmpfs rw 0 0\n\
             tank/media /mnt/tank/media zfs rw 0 0\n",
        );
        fs.add_archive("/rrd", "df-root", "df_complex-free");
        fs.add_archive("/rrd", "df-mnt-tank", "df_complex-free");
        let interfaces = StaticInterfaces::default();

        let ids = ZfsMounts.discover(&ctx(&fs, &interfaces)).unwrap();
        assert_eq!(ids, vec!["/", "/mnt/tank"]);
    }

    #[test]
    fn test_encode_mount_point() {
        assert_eq!(encode_mount_point("/"), "root");
        assert_eq!(encode_mount_point("/mnt/tank/media"), "mnt-tank-media");
    }

    #[test]
    fn test_geom_stat_files() {
        let mut fs = MockFs::new();
        fs.add_file("/rrd/geom_stat/geom_latency-ada1.rrd", "");
        fs.add_file("/rrd/geom_stat/geom_latency-ada0.rrd", "");
        fs.add_file("/rrd/geom_stat/geom_latency-ada0p2.rrd", "");
        fs.add_file("/rrd/geom_stat/geom_queue-ada0.rrd", "");
        fs.add_file("/dev/ada0", "");
        fs.add_file("/dev/ada1", "");
        fs.add_file("/dev/ada0p2", "");
        let interfaces = StaticInterfaces::default();

        let ids = GeomStatFiles {
            stat: "geom_latency",
        }
        .discover(&ctx(&fs, &interfaces))
        .unwrap();
        assert_eq!(ids, vec!["ada0", "ada1"]);
    }
}
