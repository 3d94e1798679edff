//! Startup registration table.
//!
//! Every graph the daemon serves is listed here explicitly, in the order
//! the discovery API reports them.

use std::io;
use std::path::Path;

use super::discovery::{
    ArchiveDirs, FixedIdentifiers, GeomStatFiles, InterfaceDirs, SortOrder, Split, ZfsMounts,
    encode_mount_point,
};
use super::{ArchiveType, Plugin};
use crate::config::ReportingConfig;
use crate::expression::{stacked, stacked_percent};
use crate::fs::{FileSystem, read_dir_or_empty};

/// Builds the full plugin list for a configuration.
pub fn all_plugins(config: &ReportingConfig) -> Vec<Plugin> {
    vec![
        cpu(config.cpu_in_percentage),
        cputemp(),
        disktemp(),
        interface(),
        memory(),
        load(),
        processes(),
        swap(),
        df(),
        uptime(),
        ctl(),
        disk(),
        geom("diskgeombusy", "geom_busy_percent", "Percent", "Disk Busy ({identifier})", busy_types),
        geom(
            "diskgeomlatency",
            "geom_latency",
            "Time,msec",
            "Disk Latency ({identifier})",
            latency_types,
        ),
        geom(
            "diskgeomopsrwd",
            "geom_ops_rwd",
            "Operations/s",
            "Disk Operations detailed ({identifier})",
            ops_rwd_types,
        ),
        geom(
            "diskgeomqueue",
            "geom_queue",
            "Requests",
            "Pending I/O requests on ({identifier})",
            queue_types,
        ),
        arcsize(),
        arcratio(),
        arcresult(),
        nfsstat(),
    ]
}

/// Archive types stacked bottom-up: each series is drawn on top of the
/// ones before it, unknowns counting as zero.
fn stacked_types(archives: &[&str]) -> Vec<ArchiveType> {
    archives
        .iter()
        .enumerate()
        .map(|(i, archive)| ArchiveType::new(*archive, "value").with_transform(stacked(i)))
        .collect()
}

const CPU_STATES: [&str; 5] = ["interrupt", "system", "user", "nice", "idle"];

fn cpu(in_percentage: bool) -> Plugin {
    let types = if in_percentage {
        let archives: Vec<String> = CPU_STATES.iter().map(|s| format!("percent-{s}")).collect();
        let archives: Vec<&str> = archives.iter().map(String::as_str).collect();
        stacked_types(&archives)
    } else {
        CPU_STATES
            .iter()
            .enumerate()
            .map(|(i, state)| {
                ArchiveType::new(format!("cpu-{state}"), "value")
                    .with_transform(stacked_percent(i, CPU_STATES.len()))
            })
            .collect()
    };
    Plugin::new("cpu", "aggregation-cpu-sum")
        .title("CPU Usage")
        .vertical_label("%CPU")
        .archive_types(types)
}

/// One graph holding every core.
fn cputemp() -> Plugin {
    Plugin::new("cputemp", "cputemp")
        .title("CPU Temperature")
        .vertical_label("\u{b0}C")
        .scanned(cputemp_types)
}

/// `cputemp-<n>/temperature.rrd` for cores `0..=max`. Empty as soon as one
/// core in that range has no archive.
fn cputemp_types(fs: &dyn FileSystem, root: &Path) -> io::Result<Vec<ArchiveType>> {
    let last = read_dir_or_empty(fs, root)?
        .iter()
        .filter_map(|p| p.file_name()?.to_str()?.strip_prefix("cputemp-")?.parse::<u32>().ok())
        .max();
    let Some(last) = last else {
        return Ok(Vec::new());
    };

    let mut types = Vec::new();
    for core in 0..=last {
        let dir = format!("cputemp-{core}");
        if !fs.exists(&root.join(&dir).join("temperature.rrd")) {
            return Ok(Vec::new());
        }
        types.push(
            ArchiveType::new("temperature", "value")
                .in_directory(dir)
                .with_transform("%name%,10,/,273.15,-"),
        );
    }
    Ok(types)
}

fn disktemp() -> Plugin {
    Plugin::new("disktemp", "disktemp")
        .title("Disk Temperature {identifier}")
        .vertical_label("\u{b0}C")
        .archive_types(vec![ArchiveType::new("temperature", "value")])
        .discovery(ArchiveDirs::new("disktemp", "temperature.rrd"))
}

fn interface() -> Plugin {
    Plugin::new("interface", "interface")
        .title("Interface Traffic ({identifier})")
        .vertical_label("Bits/s")
        .archive_types(vec![
            ArchiveType::new("if_octets", "rx").with_transform("%name%,8,*"),
            ArchiveType::new("if_octets", "tx").with_transform("%name%,8,*"),
        ])
        .extra(
            "CDEF:overlap=%name_0%,%name_1%,LT,%name_0%,%name_1%,IF
             XPORT:overlap:overlap",
        )
        .discovery(InterfaceDirs)
}

fn memory() -> Plugin {
    Plugin::new("memory", "memory")
        .title("Physical memory utilization")
        .vertical_label("Bytes")
        .archive_types(stacked_types(&[
            "memory-wired",
            "memory-inactive",
            "memory-laundry",
            "memory-active",
            "memory-free",
        ]))
}

fn load() -> Plugin {
    Plugin::new("load", "load")
        .title("System Load")
        .vertical_label("Processes")
        .archive_types(vec![
            ArchiveType::new("load", "shortterm"),
            ArchiveType::new("load", "midterm"),
            ArchiveType::new("load", "longterm"),
        ])
}

fn processes() -> Plugin {
    Plugin::new("processes", "processes")
        .title("Processes")
        .vertical_label("Processes")
        .archive_types(stacked_types(&[
            "ps_state-wait",
            "ps_state-idle",
            "ps_state-sleeping",
            "ps_state-running",
            "ps_state-stopped",
            "ps_state-zombies",
            "ps_state-blocked",
        ]))
}

fn swap() -> Plugin {
    Plugin::new("swap", "swap")
        .title("Swap Utilization")
        .vertical_label("Bytes")
        .archive_types(stacked_types(&["swap-used", "swap-free"]))
}

fn df() -> Plugin {
    Plugin::new("df", "df")
        .title("Disk space ({identifier})")
        .vertical_label("Bytes")
        .archive_types(vec![
            ArchiveType::new("df_complex-free", "value"),
            ArchiveType::new("df_complex-used", "value"),
        ])
        .extra(
            "CDEF:both=%name_0%,%name_1%,+
             XPORT:both:both",
        )
        .encode_with(encode_mount_point)
        .discovery(ZfsMounts)
}

fn uptime() -> Plugin {
    Plugin::new("uptime", "uptime")
        .title("Uptime")
        .vertical_label("Days")
        .archive_types(vec![
            ArchiveType::new("uptime", "value").with_transform("%name%,86400,/"),
        ])
}

fn ctl() -> Plugin {
    Plugin::new("ctl", "ctl")
        .title("SCSI target port ({identifier})")
        .vertical_label("Bytes/s")
        .archive_types(vec![
            ArchiveType::new("disk_octets", "read"),
            ArchiveType::new("disk_octets", "write"),
        ])
        .discovery(
            ArchiveDirs::new("ctl", "disk_octets.rrd")
                .split(Split::First)
                .skip_suffixes(&["ioctl"])
                .order(SortOrder::Port),
        )
}

fn disk() -> Plugin {
    Plugin::new("disk", "disk")
        .title("Disk I/O ({identifier})")
        .vertical_label("Bytes/s")
        .archive_types(vec![
            ArchiveType::new("disk_octets", "read"),
            ArchiveType::new("disk_octets", "write"),
        ])
        .discovery(
            ArchiveDirs::new("disk", "disk_octets.rrd")
                .split(Split::First)
                .require_device()
                .skip_prefixes(&["pass"]),
        )
}

fn geom(
    name: &str,
    stat: &'static str,
    label: &str,
    title: &str,
    types: fn(&str) -> Vec<ArchiveType>,
) -> Plugin {
    Plugin::new(name, "geom_stat")
        .title(title)
        .vertical_label(label)
        .per_identifier(types)
        .discovery(GeomStatFiles { stat })
}

fn busy_types(id: &str) -> Vec<ArchiveType> {
    vec![ArchiveType::new(format!("geom_busy_percent-{id}"), "value")]
}

fn latency_types(id: &str) -> Vec<ArchiveType> {
    ["read", "write", "delete"]
        .into_iter()
        .map(|field| ArchiveType::new(format!("geom_latency-{id}"), field))
        .collect()
}

fn ops_rwd_types(id: &str) -> Vec<ArchiveType> {
    ["read", "write", "delete"]
        .into_iter()
        .map(|field| ArchiveType::new(format!("geom_ops_rwd-{id}"), field))
        .collect()
}

fn queue_types(id: &str) -> Vec<ArchiveType> {
    vec![ArchiveType::new(format!("geom_queue-{id}"), "length")]
}

fn arcsize() -> Plugin {
    Plugin::new("arcsize", "zfs_arc")
        .title("ARC Size")
        .vertical_label("Bytes")
        .archive_types(vec![
            ArchiveType::new("cache_size-arc", "value"),
            ArchiveType::new("cache_size-L2", "value"),
        ])
}

fn arcratio() -> Plugin {
    Plugin::new("arcratio", "zfs_arc")
        .title("ARC Hit Ratio")
        .vertical_label("Hits (%)")
        .archive_types(vec![
            ArchiveType::new("cache_ratio-arc", "value").with_transform("%name%,100,*"),
            ArchiveType::new("cache_ratio-L2", "value").with_transform("%name%,100,*"),
        ])
}

fn arcresult_types(id: &str) -> Vec<ArchiveType> {
    vec![
        ArchiveType::new(format!("cache_result-{id}-hit"), "value").with_transform("%name%,100,*"),
        ArchiveType::new(format!("cache_result-{id}-miss"), "value")
            .with_transform("%name%,100,*"),
    ]
}

fn arcresult() -> Plugin {
    Plugin::new("arcresult", "zfs_arc")
        .title("ARC Requests ({identifier})")
        .vertical_label("Requests")
        .per_identifier(arcresult_types)
        .extra(
            "CDEF:total=%name_0%,%name_1%,+
             XPORT:total:total",
        )
        .discovery(FixedIdentifiers(&[
            "demand_data",
            "demand_metadata",
            "prefetch_data",
            "prefetch_metadata",
        ]))
}

fn nfsstat() -> Plugin {
    Plugin::new("nfsstat", "nfsstat-client")
        .title("NFS Stats")
        .vertical_label("Bytes")
        .archive_types(vec![
            ArchiveType::new("nfsstat-read", "value"),
            ArchiveType::new("nfsstat-write", "value"),
        ])
}
