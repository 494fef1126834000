use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::{Components, Disks, System};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HostMetrics {
    pub cpu_percent: f64,
    pub ram_percent: f64,
    pub swap_percent: f64,
    pub disk_percent: f64,
    pub uptime_seconds: u64,
    pub cpu_temp_c: Option<f64>,
    pub gpu_temp_c: Option<f64>,
}

pub trait HostMetricsSource: Send {
    fn collect(&mut self) -> HostMetrics;
}

/// Reads the flight computer's own load and temperatures.
pub struct SystemMetricsCollector {
    system: System,
    disks: Disks,
    components: Components,
}

impl SystemMetricsCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        // First CPU sample only establishes a baseline
        system.refresh_cpu();
        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
            components: Components::new_with_refreshed_list(),
        }
    }

    fn root_disk_percent(&self) -> f64 {
        let root = self
            .disks
            .list()
            .iter()
            .find(|disk| disk.mount_point() == Path::new("/"))
            .or_else(|| self.disks.list().first());

        root.map_or(0.0, |disk| {
            let total = disk.total_space();
            let used = total.saturating_sub(disk.available_space());
            percent(used, total)
        })
    }

    fn component_temp(&self, needles: &[&str]) -> Option<f64> {
        self.components
            .list()
            .iter()
            .find(|component| {
                let label = component.label().to_ascii_lowercase();
                needles.iter().any(|needle| label.contains(needle))
            })
            .map(|component| f64::from(component.temperature()))
            .filter(|temp| temp.is_finite())
    }
}

impl Default for SystemMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMetricsSource for SystemMetricsCollector {
    fn collect(&mut self) -> HostMetrics {
        self.system.refresh_cpu();
        self.system.refresh_memory();
        self.disks.refresh();
        self.components.refresh();

        HostMetrics {
            cpu_percent: f64::from(self.system.global_cpu_info().cpu_usage()),
            ram_percent: percent(self.system.used_memory(), self.system.total_memory()),
            swap_percent: percent(self.system.used_swap(), self.system.total_swap()),
            disk_percent: self.root_disk_percent(),
            uptime_seconds: System::uptime(),
            cpu_temp_c: self.component_temp(&["cpu", "package", "core", "soc"]),
            gpu_temp_c: self.component_temp(&["gpu"]),
        }
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 * 100.0 / total as f64
    }
}
