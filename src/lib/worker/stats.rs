use serde::{Serialize, ser::SerializeStruct};
use serde_json::{Value, json};
use sysinfo::{Disks, System};

use crate::lib::process::types::TrackedCounts;
use crate::lib::worker::types::SystemStats;

const MB: u64 = 1024 * 1024;

impl Serialize for SystemStats {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("SystemStats", 6)?;
        state.serialize_field("hostname", &self.hostname)?;
        state.serialize_field("system_name", &self.system_name)?;
        state.serialize_field(
            "cpu",
            &json!({
                "count": self.total_cpus,
                "usage": percent(self.cpu_usage),
                "load_average": self.load_average,
            }),
        )?;
        state.serialize_field(
            "memory",
            &json!({
                "total": format!("{} MB", self.total_memory),
                "used": format!("{} MB", self.used_memory),
                "usage": percent(share(self.used_memory, self.total_memory)),
                "swap_total": format!("{} MB", self.total_swap),
                "swap_used": format!("{} MB", self.used_swap),
            }),
        )?;
        state.serialize_field("disk_usage", &percent(self.disk_usage))?;
        state.serialize_field(
            "containers",
            &json!({
                "tracked": self.containers.launched + self.containers.attached,
                "launched": self.containers.launched,
                "attached": self.containers.attached,
            }),
        )?;
        state.end()
    }
}

fn percent(value: f32) -> String {
    format!("{:.2}%", value)
}

fn share(used: u64, total: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64 * 100.0) as f32
}

/// Used share of every mounted disk taken together.
fn disk_usage(disks: &Disks) -> f32 {
    let (used, total) = disks.iter().fold((0u64, 0u64), |(used, total), disk| {
        let size = disk.total_space();
        (used + size.saturating_sub(disk.available_space()), total + size)
    });
    share(used, total)
}

pub fn get_stats(sysinfo: &System, containers: TrackedCounts) -> SystemStats {
    let load = System::load_average();
    SystemStats {
        hostname: System::host_name().unwrap_or_else(|| "Unknown".to_string()),
        system_name: System::name().unwrap_or_else(|| "Unknown".to_string()),
        total_cpus: sysinfo.cpus().len() as u64,
        cpu_usage: sysinfo.global_cpu_usage(),
        load_average: [load.one, load.five, load.fifteen],
        total_memory: sysinfo.total_memory() / MB,
        used_memory: sysinfo.used_memory() / MB,
        total_swap: sysinfo.total_swap() / MB,
        used_swap: sysinfo.used_swap() / MB,
        disk_usage: disk_usage(&Disks::new_with_refreshed_list()),
        containers,
    }
}

/// Static capacity advertised in the node's `tags.metadata.host`.
pub fn host_capacity(stats: &SystemStats) -> Value {
    json!({
        "cpus": stats.total_cpus,
        "memory": stats.total_memory,
        "hostname": stats.hostname,
        "system_name": stats.system_name,
    })
}
