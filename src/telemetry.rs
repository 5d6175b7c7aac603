//! Background resource sampling for benchmark runs.
//!
//! A [`ResourceMonitor`] owns a worker thread that samples host CPU,
//! memory and disk counters (via `sysinfo`) and GPU utilization, memory,
//! power and temperature (via NVML) on a fixed cadence. The sample
//! buffer and the energy accumulators live on the worker thread; `stop`
//! flips an atomic flag, joins, and hands the finished trace back, so
//! no sample is appended after `stop` returns and no lock is needed.
//!
//! Telemetry is strictly best-effort: a missing NVML library, an absent
//! GPU, or a transient read failure degrades the affected fields to
//! zero. Sampling never fails a benchmark run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::Nvml;
use serde::{Deserialize, Serialize};
use sysinfo::{ProcessesToUpdate, System};
use tracing::debug;

/// Default sampling cadence.
pub const DEFAULT_INTERVAL_MS: u64 = 200;

/// Default CPU thermal design power used for the CPU energy estimate.
pub const DEFAULT_CPU_TDP_W: f64 = 65.0;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

// ============================================================================
// Sample types
// ============================================================================

/// One process visible to the GPU at sample time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuProcess {
    /// Host process id
    pub pid: u32,
    /// Device memory attributed to the process, MiB (0 when the driver
    /// cannot attribute it)
    pub used_mb: f64,
}

/// A single point-in-time reading of host and GPU resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Unix timestamp, fractional seconds
    pub timestamp: f64,
    /// Whole-host CPU utilization, percent
    pub cpu_percent: f64,
    /// Used host memory, MiB
    pub mem_used_mb: f64,
    /// Bytes read from disk since the previous sample (0 on the first)
    pub disk_read_bytes: u64,
    /// Bytes written to disk since the previous sample (0 on the first)
    pub disk_write_bytes: u64,
    /// GPU utilization, percent
    pub gpu_util: f64,
    /// Used device memory, MiB
    pub gpu_mem_mb: f64,
    /// Board power draw, watts
    pub gpu_power_w: f64,
    /// GPU temperature, Celsius
    pub gpu_temp_c: f64,
    /// Compute processes resident on the device
    pub gpu_processes: Vec<GpuProcess>,
}

/// Completed sampling trace returned by [`ResourceMonitor::stop`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryTrace {
    /// Samples in capture order
    pub samples: Vec<TelemetrySample>,
    /// GPU energy over the trace, joules (left-Riemann integral of
    /// board power)
    pub gpu_energy_j: f64,
    /// Estimated CPU energy over the trace, joules (utilization share
    /// of the configured TDP)
    pub cpu_energy_j: f64,
}

/// Aggregates over a [`TelemetryTrace`], persisted with each run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySummary {
    pub cpu_mean: f64,
    pub cpu_peak: f64,
    pub mem_peak_mb: f64,
    pub gpu_util_mean: f64,
    pub gpu_util_peak: f64,
    pub gpu_mem_peak_mb: f64,
    pub gpu_power_mean_w: f64,
    pub gpu_temp_peak_c: f64,
    pub gpu_energy_j: f64,
    pub cpu_energy_j: f64,
}

impl TelemetryTrace {
    /// Reduce the trace to the per-run summary.
    #[must_use]
    pub fn summarize(&self) -> TelemetrySummary {
        let cpu: Vec<f64> = self.samples.iter().map(|s| s.cpu_percent).collect();
        let util: Vec<f64> = self.samples.iter().map(|s| s.gpu_util).collect();
        let power: Vec<f64> = self.samples.iter().map(|s| s.gpu_power_w).collect();
        let peak = |it: &mut dyn Iterator<Item = f64>| it.fold(0.0f64, f64::max);
        TelemetrySummary {
            cpu_mean: crate::stats::mean(&cpu),
            cpu_peak: peak(&mut cpu.iter().copied()),
            mem_peak_mb: peak(&mut self.samples.iter().map(|s| s.mem_used_mb)),
            gpu_util_mean: crate::stats::mean(&util),
            gpu_util_peak: peak(&mut util.iter().copied()),
            gpu_mem_peak_mb: peak(&mut self.samples.iter().map(|s| s.gpu_mem_mb)),
            gpu_power_mean_w: crate::stats::mean(&power),
            gpu_temp_peak_c: peak(&mut self.samples.iter().map(|s| s.gpu_temp_c)),
            gpu_energy_j: self.gpu_energy_j,
            cpu_energy_j: self.cpu_energy_j,
        }
    }
}

// ============================================================================
// GPU probe
// ============================================================================

#[derive(Debug, Clone, Default)]
struct GpuReading {
    util: f64,
    mem_mb: f64,
    power_w: f64,
    temp_c: f64,
    processes: Vec<GpuProcess>,
}

/// NVML capability handle.
///
/// The library is initialized once when the probe is built; a host
/// without a usable driver gets a dead probe that reads all-zero for
/// the lifetime of the monitor.
struct GpuProbe {
    nvml: Option<Nvml>,
}

impl GpuProbe {
    fn new() -> Self {
        let nvml = match Nvml::init() {
            Ok(n) => Some(n),
            Err(e) => {
                debug!("NVML unavailable, GPU telemetry disabled: {e}");
                None
            }
        };
        Self { nvml }
    }

    fn read(&self) -> GpuReading {
        let Some(nvml) = &self.nvml else {
            return GpuReading::default();
        };
        let Ok(device) = nvml.device_by_index(0) else {
            return GpuReading::default();
        };
        let util = device
            .utilization_rates()
            .map(|u| f64::from(u.gpu))
            .unwrap_or(0.0);
        let mem_mb = device
            .memory_info()
            .map(|m| m.used as f64 / BYTES_PER_MIB)
            .unwrap_or(0.0);
        let power_w = device
            .power_usage()
            .map(|mw| f64::from(mw) / 1000.0)
            .unwrap_or(0.0);
        let temp_c = device
            .temperature(TemperatureSensor::Gpu)
            .map(f64::from)
            .unwrap_or(0.0);
        let processes = device
            .running_compute_processes()
            .map(|procs| {
                procs
                    .into_iter()
                    .map(|p| GpuProcess {
                        pid: p.pid,
                        used_mb: match p.used_gpu_memory {
                            UsedGpuMemory::Used(bytes) => bytes as f64 / BYTES_PER_MIB,
                            UsedGpuMemory::Unavailable => 0.0,
                        },
                    })
                    .collect()
            })
            .unwrap_or_default();
        GpuReading {
            util,
            mem_mb,
            power_w,
            temp_c,
            processes,
        }
    }
}

// ============================================================================
// Sampler worker
// ============================================================================

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Sampling cadence
    pub interval: Duration,
    /// CPU thermal design power for the energy estimate, watts
    pub cpu_tdp_w: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            cpu_tdp_w: DEFAULT_CPU_TDP_W,
        }
    }
}

struct SamplerState {
    sys: System,
    probe: GpuProbe,
    cpu_tdp_w: f64,
    // cumulative (read, write) totals from the previous sample
    prev_disk: Option<(u64, u64)>,
    // previous sample's (instant, gpu watts, cpu watts) for the
    // left-Riemann energy step
    prev_power: Option<(Instant, f64, f64)>,
    trace: TelemetryTrace,
}

impl SamplerState {
    fn new(config: &MonitorConfig) -> Self {
        Self {
            sys: System::new(),
            probe: GpuProbe::new(),
            cpu_tdp_w: config.cpu_tdp_w,
            prev_disk: None,
            prev_power: None,
            trace: TelemetryTrace::default(),
        }
    }

    fn cumulative_disk(&self) -> (u64, u64) {
        let mut read = 0u64;
        let mut write = 0u64;
        for process in self.sys.processes().values() {
            let usage = process.disk_usage();
            read = read.saturating_add(usage.total_read_bytes);
            write = write.saturating_add(usage.total_written_bytes);
        }
        (read, write)
    }

    fn take_sample(&mut self) {
        let now = Instant::now();
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        self.sys.refresh_processes(ProcessesToUpdate::All, true);

        let cpu_percent = f64::from(self.sys.global_cpu_usage());
        let mem_used_mb = self.sys.used_memory() as f64 / BYTES_PER_MIB;

        let disk = self.cumulative_disk();
        // First sample has no baseline; later deltas saturate at zero
        // when a counter regresses (process exit resets its total).
        let (disk_read_bytes, disk_write_bytes) = match self.prev_disk {
            Some((r, w)) => (disk.0.saturating_sub(r), disk.1.saturating_sub(w)),
            None => (0, 0),
        };
        self.prev_disk = Some(disk);

        let gpu = self.probe.read();
        let cpu_power_w = cpu_percent / 100.0 * self.cpu_tdp_w;

        // Left-Riemann step: the previous sample's power is held over
        // the elapsed interval.
        if let Some((prev_at, prev_gpu_w, prev_cpu_w)) = self.prev_power {
            let dt = now.duration_since(prev_at).as_secs_f64();
            self.trace.gpu_energy_j += prev_gpu_w * dt;
            self.trace.cpu_energy_j += prev_cpu_w * dt;
        }
        self.prev_power = Some((now, gpu.power_w, cpu_power_w));

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        self.trace.samples.push(TelemetrySample {
            timestamp,
            cpu_percent,
            mem_used_mb,
            disk_read_bytes,
            disk_write_bytes,
            gpu_util: gpu.util,
            gpu_mem_mb: gpu.mem_mb,
            gpu_power_w: gpu.power_w,
            gpu_temp_c: gpu.temp_c,
            gpu_processes: gpu.processes,
        });
    }
}

// ============================================================================
// Monitor handle
// ============================================================================

/// Handle to a running sampling thread.
pub struct ResourceMonitor {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<TelemetryTrace>,
}

impl ResourceMonitor {
    /// Spawn the sampling thread and begin capturing immediately.
    #[must_use]
    pub fn start(config: MonitorConfig) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let interval = config.interval;
        let handle = thread::spawn(move || {
            let mut state = SamplerState::new(&config);
            // The sample is taken after checking the flag, so even an
            // immediate stop yields one sample.
            loop {
                let stopping = stop_flag.load(Ordering::SeqCst);
                state.take_sample();
                if stopping {
                    break;
                }
                thread::sleep(interval);
            }
            state.trace
        });
        Self { stop, handle }
    }

    /// Stop sampling and return the completed trace.
    ///
    /// Consumes the handle: after this returns, the trace is final. A
    /// panicked worker yields an empty trace rather than an error.
    #[must_use]
    pub fn stop(self) -> TelemetryTrace {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.join().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu: f64, gpu_util: f64, gpu_mem: f64, power: f64) -> TelemetrySample {
        TelemetrySample {
            timestamp: 0.0,
            cpu_percent: cpu,
            mem_used_mb: 1024.0,
            disk_read_bytes: 0,
            disk_write_bytes: 0,
            gpu_util,
            gpu_mem_mb: gpu_mem,
            gpu_power_w: power,
            gpu_temp_c: 50.0,
            gpu_processes: Vec::new(),
        }
    }

    #[test]
    fn test_summary_peaks_at_least_means() {
        let trace = TelemetryTrace {
            samples: vec![
                sample(10.0, 20.0, 4000.0, 100.0),
                sample(90.0, 80.0, 6000.0, 250.0),
                sample(50.0, 40.0, 5000.0, 150.0),
            ],
            gpu_energy_j: 42.0,
            cpu_energy_j: 13.0,
        };
        let s = trace.summarize();
        assert!(s.cpu_peak >= s.cpu_mean);
        assert!(s.gpu_util_peak >= s.gpu_util_mean);
        assert_eq!(s.gpu_mem_peak_mb, 6000.0);
        assert_eq!(s.gpu_energy_j, 42.0);
        assert_eq!(s.cpu_energy_j, 13.0);
    }

    #[test]
    fn test_empty_trace_summary_is_zero() {
        let s = TelemetryTrace::default().summarize();
        assert_eq!(s.cpu_mean, 0.0);
        assert_eq!(s.gpu_mem_peak_mb, 0.0);
        assert_eq!(s.gpu_energy_j, 0.0);
    }

    #[test]
    fn test_monitor_immediate_stop_yields_samples() {
        let monitor = ResourceMonitor::start(MonitorConfig {
            interval: Duration::from_millis(10),
            ..MonitorConfig::default()
        });
        let trace = monitor.stop();
        assert!(!trace.samples.is_empty());
    }

    #[test]
    fn test_monitor_energy_nonnegative_and_disk_delta_contract() {
        let monitor = ResourceMonitor::start(MonitorConfig {
            interval: Duration::from_millis(20),
            ..MonitorConfig::default()
        });
        thread::sleep(Duration::from_millis(120));
        let trace = monitor.stop();
        assert!(trace.samples.len() >= 2);
        assert!(trace.gpu_energy_j >= 0.0);
        assert!(trace.cpu_energy_j >= 0.0);
        assert_eq!(trace.samples[0].disk_read_bytes, 0);
        assert_eq!(trace.samples[0].disk_write_bytes, 0);
    }

    #[test]
    fn test_left_riemann_uses_previous_power() {
        let config = MonitorConfig::default();
        let mut state = SamplerState::new(&config);
        // Manually drive the energy step with synthetic previous power.
        let t0 = Instant::now();
        state.prev_power = Some((t0, 200.0, 30.0));
        thread::sleep(Duration::from_millis(30));
        state.take_sample();
        // Energy reflects the 200 W held over the elapsed window, no
        // matter what the current reading is.
        assert!(state.trace.gpu_energy_j > 0.0);
        let dt = state.trace.gpu_energy_j / 200.0;
        assert!(dt > 0.02 && dt < 5.0, "dt {dt} out of range");
    }

    #[test]
    fn test_sample_serde_round_trip() {
        let s = sample(33.0, 44.0, 5555.0, 123.0);
        let json = serde_json::to_string(&s).unwrap();
        let back: TelemetrySample = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
    }
}
