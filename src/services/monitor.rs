//! Background resource sampling.
//!
//! A [`ResourceMonitor`] owns a tokio task that samples CPU, memory and GPU
//! statistics on a fixed cadence and publishes each sample through a
//! `watch` channel. Readers only ever clone the latest snapshot.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::MonitorConfig;

const GPU_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const GPU_QUERY_COMMAND: &str = "nvidia-smi";
const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuStats {
    pub index: u32,
    pub name: String,
    pub utilization_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f32>,
}

impl GpuStats {
    pub fn memory_percent(&self) -> f32 {
        if self.memory_total_mb == 0 {
            return 0.0;
        }
        self.memory_used_mb as f32 / self.memory_total_mb as f32 * 100.0
    }

    pub fn memory_free_mb(&self) -> u64 {
        self.memory_total_mb.saturating_sub(self.memory_used_mb)
    }
}

/// One immutable resource sample.
///
/// The default value is the unsampled snapshot: it reports no pressure but
/// [`ResourceSnapshot::is_sampled`] is false, so it never justifies growing a
/// batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub sampled_at: Option<DateTime<Utc>>,
    pub cpu_percent: f32,
    pub process_rss_bytes: u64,
    pub system_memory_used_bytes: u64,
    pub system_memory_total_bytes: u64,
    pub gpus: Vec<GpuStats>,
}

impl ResourceSnapshot {
    pub fn is_sampled(&self) -> bool {
        self.sampled_at.is_some()
    }

    pub fn gpu_available(&self) -> bool {
        !self.gpus.is_empty()
    }

    pub fn system_memory_percent(&self) -> f32 {
        if self.system_memory_total_bytes == 0 {
            return 0.0;
        }
        self.system_memory_used_bytes as f32 / self.system_memory_total_bytes as f32 * 100.0
    }

    /// Highest memory utilization across all GPUs.
    pub fn gpu_memory_percent(&self) -> Option<f32> {
        self.gpus
            .iter()
            .map(GpuStats::memory_percent)
            .reduce(f32::max)
    }

    pub fn gpu_utilization_percent(&self) -> Option<f32> {
        self.gpus
            .iter()
            .map(|g| g.utilization_percent)
            .reduce(f32::max)
    }

    /// Memory utilization that drives batch sizing: the worse of system and GPU.
    pub fn memory_pressure_percent(&self) -> f32 {
        let system = self.system_memory_percent();
        match self.gpu_memory_percent() {
            Some(gpu) => system.max(gpu),
            None => system,
        }
    }

    pub fn process_rss_mb(&self) -> u64 {
        self.process_rss_bytes / BYTES_PER_MB
    }

    /// Compact one-line form for progress bars.
    pub fn short_summary(&self) -> String {
        if !self.is_sampled() {
            return "resources: pending".to_string();
        }
        let mut out = format!(
            "CPU {:.0}% | RAM {:.0}% | RSS {}MB",
            self.cpu_percent,
            self.system_memory_percent(),
            self.process_rss_mb()
        );
        if let (Some(util), Some(mem)) = (self.gpu_utilization_percent(), self.gpu_memory_percent())
        {
            out.push_str(&format!(" | GPU {util:.0}% mem {mem:.0}%"));
        }
        out
    }
}

/// Takes individual samples. Owned by the monitor task.
pub struct Sampler {
    system: System,
    pid: Option<Pid>,
    gpu_enabled: bool,
    gpu_command: String,
}

impl Sampler {
    pub fn new(gpu: bool) -> Self {
        let pid = sysinfo::get_current_pid()
            .inspect_err(|e| debug!("process id unavailable: {e}"))
            .ok();
        Self {
            system: System::new(),
            pid,
            gpu_enabled: gpu,
            gpu_command: GPU_QUERY_COMMAND.to_string(),
        }
    }

    /// Query GPUs with `command` instead of `nvidia-smi`. It must accept the
    /// same arguments and print the same CSV.
    #[must_use]
    pub fn with_gpu_command(mut self, command: impl Into<String>) -> Self {
        self.gpu_command = command.into();
        self
    }

    pub fn gpu_enabled(&self) -> bool {
        self.gpu_enabled
    }

    /// Take a baseline CPU reading so the next sample reports a real rate.
    pub async fn prime(&mut self) {
        self.system.refresh_cpu_usage();
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
    }

    pub async fn sample(&mut self) -> ResourceSnapshot {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let process_rss_bytes = match self.pid {
            Some(pid) => {
                self.system
                    .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                self.system.process(pid).map(|p| p.memory()).unwrap_or(0)
            }
            None => 0,
        };

        let gpus = if self.gpu_enabled {
            match query_gpus(&self.gpu_command).await {
                Ok(gpus) => gpus,
                Err(e) => {
                    debug!("GPU statistics unavailable, continuing CPU-only: {e}");
                    self.gpu_enabled = false;
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        ResourceSnapshot {
            sampled_at: Some(Utc::now()),
            cpu_percent: self.system.global_cpu_usage(),
            process_rss_bytes,
            system_memory_used_bytes: self.system.used_memory(),
            system_memory_total_bytes: self.system.total_memory(),
            gpus,
        }
    }
}

/// Handle to the background sampling task.
pub struct ResourceMonitor {
    rx: watch::Receiver<ResourceSnapshot>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ResourceMonitor {
    pub fn spawn(config: &MonitorConfig) -> Self {
        let (tx, rx) = watch::channel(ResourceSnapshot::default());
        let cancel = CancellationToken::new();
        let interval = Duration::from_millis(config.interval_ms.max(1));
        let mut sampler = Sampler::new(config.gpu);
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            sampler.prime().await;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = sampler.sample().await;
                        if tx.send(snapshot).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("resource monitor stopped");
        });

        Self { rx, cancel, handle }
    }

    /// Latest snapshot. Never blocks on the sampler.
    pub fn snapshot(&self) -> ResourceSnapshot {
        self.rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ResourceSnapshot> {
        self.rx.clone()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("resource monitor task failed: {e}");
        }
    }
}

async fn query_gpus(command: &str) -> Result<Vec<GpuStats>, String> {
    let output = tokio::time::timeout(
        GPU_QUERY_TIMEOUT,
        Command::new(command)
            .args([
                "--query-gpu=index,name,utilization.gpu,memory.used,memory.total,temperature.gpu",
                "--format=csv,noheader,nounits",
            ])
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| format!("{command} timed out"))?
    .map_err(|e| format!("failed to run {command}: {e}"))?;

    if !output.status.success() {
        return Err(format!("{command} exited with {}", output.status));
    }

    let gpus = parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout));
    if gpus.is_empty() {
        return Err(format!("{command} reported no devices"));
    }
    Ok(gpus)
}

/// Parse `nvidia-smi --format=csv,noheader,nounits` rows. Unparseable rows are dropped.
pub fn parse_nvidia_smi(output: &str) -> Vec<GpuStats> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 5 {
                return None;
            }
            Some(GpuStats {
                index: fields[0].parse().ok()?,
                name: fields[1].to_string(),
                utilization_percent: fields[2].parse().unwrap_or(0.0),
                memory_used_mb: fields[3].parse().ok()?,
                memory_total_mb: fields[4].parse().ok()?,
                temperature_c: fields.get(5).and_then(|t| t.parse().ok()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nvidia_smi() {
        let out = "0, NVIDIA A100-SXM4-40GB, 37, 10240, 40960, 54\n1, NVIDIA A100-SXM4-40GB, [N/A], 0, 40960, [N/A]\ngarbage\n";
        let gpus = parse_nvidia_smi(out);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].index, 0);
        assert_eq!(gpus[0].memory_free_mb(), 30720);
        assert_eq!(gpus[0].memory_percent(), 25.0);
        assert_eq!(gpus[0].temperature_c, Some(54.0));
        assert_eq!(gpus[1].utilization_percent, 0.0);
        assert_eq!(gpus[1].temperature_c, None);
    }

    #[test]
    fn test_unsampled_default_is_conservative() {
        let snapshot = ResourceSnapshot::default();
        assert!(!snapshot.is_sampled());
        assert_eq!(snapshot.memory_pressure_percent(), 0.0);
        assert!(!snapshot.gpu_available());
        assert_eq!(snapshot.short_summary(), "resources: pending");
    }

    #[test]
    fn test_memory_pressure_takes_worst_device() {
        let snapshot = ResourceSnapshot {
            sampled_at: Some(Utc::now()),
            system_memory_used_bytes: 40,
            system_memory_total_bytes: 100,
            gpus: vec![GpuStats {
                index: 0,
                name: "gpu".into(),
                utilization_percent: 90.0,
                memory_used_mb: 95,
                memory_total_mb: 100,
                temperature_c: None,
            }],
            ..Default::default()
        };
        assert_eq!(snapshot.system_memory_percent(), 40.0);
        assert_eq!(snapshot.memory_pressure_percent(), 95.0);
        assert!(snapshot.short_summary().contains("GPU 90%"));
    }

    #[tokio::test]
    async fn test_missing_gpu_tool_degrades_to_cpu_only() {
        let mut sampler = Sampler::new(true).with_gpu_command("chunkvec-no-such-gpu-tool");
        let snapshot = sampler.sample().await;
        assert!(snapshot.is_sampled());
        assert!(snapshot.gpus.is_empty());
        assert!(!snapshot.gpu_available());
        assert!(snapshot.system_memory_total_bytes > 0);
        assert!(!sampler.gpu_enabled());

        let next = sampler.sample().await;
        assert!(next.is_sampled());
        assert!(next.gpus.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_gpu_tool_degrades_to_cpu_only() {
        let mut sampler = Sampler::new(true).with_gpu_command("false");
        let snapshot = sampler.sample().await;
        assert!(snapshot.is_sampled());
        assert!(snapshot.gpus.is_empty());
        assert!(snapshot.system_memory_total_bytes > 0);
        assert!(!sampler.gpu_enabled());
    }

    #[tokio::test]
    async fn test_monitor_publishes_samples() {
        let config = MonitorConfig {
            interval_ms: 20,
            gpu: false,
        };
        let monitor = ResourceMonitor::spawn(&config);
        let mut rx = monitor.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("monitor produced no sample")
            .unwrap();
        let snapshot = monitor.snapshot();
        assert!(snapshot.is_sampled());
        assert!(snapshot.system_memory_total_bytes > 0);
        monitor.shutdown().await;
    }
}
