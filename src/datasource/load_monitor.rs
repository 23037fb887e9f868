use std::{path::PathBuf, thread, time::Duration};

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};

use crate::{
    datasource::file_path::*,
    utils::{
        command::{find_in_path, run_with_timeout},
        constants::agent::CPU_PRIME_DELAY_MS,
        file_operate::{check_read_simple, read_file},
    },
};

/// 利用率采样来源，返回 (cpu_util_pct, gpu_util_pct)
pub trait MetricsSource {
    fn sample(&mut self) -> Result<(f64, f64)>;
}

/// /proc/stat 中 cpu 汇总行的累计节拍
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    total: u64,
    idle: u64,
}

fn parse_proc_stat(content: &str) -> Result<CpuTimes> {
    let line = content
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| anyhow!("No aggregate cpu line in {PROC_STAT}"))?;

    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|v| v.parse::<u64>())
        .collect::<Result<_, _>>()
        .with_context(|| format!("Failed to parse cpu line: {line}"))?;

    if values.len() < 4 {
        return Err(anyhow!("Truncated cpu line: {line}"));
    }

    // user nice system idle iowait irq softirq steal [guest guest_nice]
    // guest 时间已计入 user/nice，不能重复累加
    let total: u64 = values.iter().take(8).sum();
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Ok(CpuTimes { total, idle })
}

fn cpu_busy_pct(prev: CpuTimes, cur: CpuTimes) -> f64 {
    let total = cur.total.saturating_sub(prev.total);
    let idle = cur.idle.saturating_sub(prev.idle);
    if total == 0 {
        return 0.0;
    }
    let busy = total.saturating_sub(idle);
    (busy as f64 * 100.0 / total as f64).clamp(0.0, 100.0)
}

/// 解析 nvidia-smi 输出，多卡时取最高利用率
fn parse_gpu_util(output: &str) -> Result<f64> {
    let mut max: Option<f64> = None;
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let value = line
            .parse::<f64>()
            .with_context(|| format!("Failed to parse GPU utilization: {line}"))?;
        max = Some(max.map_or(value, |m: f64| m.max(value)));
    }
    max.map(|v| v.clamp(0.0, 100.0))
        .ok_or_else(|| anyhow!("{NVIDIA_SMI} reported no devices"))
}

/// 生产环境的采样来源：CPU 取自 /proc/stat，GPU 取自 nvidia-smi
pub struct SystemMetricsSource {
    proc_stat: PathBuf,
    gpu_tool: Option<PathBuf>,
    command_timeout: Duration,
    prev_cpu: Option<CpuTimes>,
}

impl SystemMetricsSource {
    pub fn new(command_timeout: Duration) -> Self {
        Self {
            proc_stat: PathBuf::from(PROC_STAT),
            gpu_tool: find_in_path(NVIDIA_SMI),
            command_timeout,
            prev_cpu: None,
        }
    }

    /// 检查各数据节点，CPU 数据不可用时无法工作
    pub fn utilization_init(&self) -> Result<()> {
        info!("Init LoadMonitor");

        if !check_read_simple(&self.proc_stat) {
            return Err(anyhow!(
                "Can't Monitor CPU Loading: {} not readable",
                self.proc_stat.display()
            ));
        }
        info!("{}: OK", self.proc_stat.display());

        match &self.gpu_tool {
            Some(tool) => info!("{}: OK", tool.display()),
            None => warn!("{NVIDIA_SMI} not found, GPU utilization will be reported as 0%"),
        }

        info!("Test Finished.");
        Ok(())
    }

    fn read_cpu_times(&self) -> Result<CpuTimes> {
        parse_proc_stat(&read_file(&self.proc_stat)?)
    }

    fn cpu_load(&mut self) -> Result<f64> {
        let prev = match self.prev_cpu {
            Some(prev) => prev,
            None => {
                let first = self.read_cpu_times()?;
                thread::sleep(Duration::from_millis(CPU_PRIME_DELAY_MS));
                first
            }
        };
        let cur = self.read_cpu_times()?;
        self.prev_cpu = Some(cur);
        Ok(cpu_busy_pct(prev, cur))
    }

    fn gpu_load(&self) -> Result<f64> {
        let Some(tool) = &self.gpu_tool else {
            return Ok(0.0);
        };
        let program = tool.to_string_lossy();
        let output = run_with_timeout(
            &program,
            &[
                "--query-gpu=utilization.gpu",
                "--format=csv,noheader,nounits",
            ],
            self.command_timeout,
        )?;
        if !output.success() {
            return Err(anyhow!(
                "{NVIDIA_SMI} failed ({}): {}",
                output.status,
                output.combined()
            ));
        }
        parse_gpu_util(&output.stdout)
    }
}

impl MetricsSource for SystemMetricsSource {
    fn sample(&mut self) -> Result<(f64, f64)> {
        let cpu = self.cpu_load()?;
        let gpu = self.gpu_load()?;
        debug!("sample cpu={cpu:.1}% gpu={gpu:.1}%");
        Ok((cpu, gpu))
    }
}
