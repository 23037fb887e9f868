use std::{
    collections::VecDeque,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use log::debug;

use crate::utils::clock::Clock;

/// 单次利用率采样，只存在于内存中
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_util_pct: f64,
    pub gpu_util_pct: f64,
}

/// 窗口统计结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub idle: bool,
    pub cpu_avg: f64,
    pub gpu_avg: f64,
}

#[derive(Debug, Default)]
struct WindowInner {
    samples: VecDeque<MetricSample>,
    /// 连续空闲的起点
    last_idle_time: Option<DateTime<Utc>>,
    /// 连续空闲的时长，只在当前窗口判定为空闲时非零
    idle_duration: Duration,
}

/// 有时间边界的采样窗口，附带“从何时开始连续空闲”的滞回跟踪
pub struct SlidingWindow {
    inner: RwLock<WindowInner>,
    window: chrono::Duration,
    min_samples_required: usize,
    clock: Arc<dyn Clock>,
}

impl SlidingWindow {
    pub fn new(window: Duration, min_samples_required: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(WindowInner::default()),
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX),
            min_samples_required,
            clock,
        }
    }

    // 锁内的操作都不会在中途 panic 留下不一致状态，所以中毒后直接取回数据
    fn read(&self) -> RwLockReadGuard<'_, WindowInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, WindowInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// 追加采样并丢弃窗口之外的旧数据
    pub fn add_sample(&self, sample: MetricSample) {
        let cutoff = self.clock.now().checked_sub_signed(self.window);
        let mut inner = self.write();
        inner.samples.push_back(sample);
        if let Some(cutoff) = cutoff {
            inner.samples.retain(|s| s.timestamp >= cutoff);
        }
    }

    fn stats_of(&self, inner: &WindowInner, cpu_threshold: f64, gpu_threshold: f64) -> WindowStats {
        let count = inner.samples.len();
        if count < self.min_samples_required || count == 0 {
            return WindowStats {
                idle: false,
                cpu_avg: 0.0,
                gpu_avg: 0.0,
            };
        }

        let (cpu_sum, gpu_sum) = inner
            .samples
            .iter()
            .fold((0.0, 0.0), |(c, g), s| (c + s.cpu_util_pct, g + s.gpu_util_pct));
        let cpu_avg = cpu_sum / count as f64;
        let gpu_avg = gpu_sum / count as f64;

        WindowStats {
            idle: cpu_avg < cpu_threshold && gpu_avg < gpu_threshold,
            cpu_avg,
            gpu_avg,
        }
    }

    /// 纯查询：当前窗口是否空闲以及两项平均值。不改变滞回状态
    pub fn is_idle(&self, cpu_threshold: f64, gpu_threshold: f64) -> WindowStats {
        let inner = self.read();
        self.stats_of(&inner, cpu_threshold, gpu_threshold)
    }

    /// 推进滞回时钟并返回连续空闲时长。
    /// 每个评估周期只能由引擎调用一次
    pub fn get_idle_duration(&self, cpu_threshold: f64, gpu_threshold: f64) -> Duration {
        let now = self.clock.now();
        let mut inner = self.write();
        let stats = self.stats_of(&inner, cpu_threshold, gpu_threshold);

        if !stats.idle {
            if inner.last_idle_time.is_some() {
                debug!(
                    "Idle tracking cleared (cpu_avg={:.1}%, gpu_avg={:.1}%)",
                    stats.cpu_avg, stats.gpu_avg
                );
            }
            inner.last_idle_time = None;
            inner.idle_duration = Duration::ZERO;
            return Duration::ZERO;
        }

        match inner.last_idle_time {
            None => {
                debug!("Idle tracking started at {now}");
                inner.last_idle_time = Some(now);
                inner.idle_duration = Duration::ZERO;
            }
            Some(since) => {
                // 时钟回拨时按 0 处理
                inner.idle_duration = (now - since).to_std().unwrap_or(Duration::ZERO);
            }
        }

        inner.idle_duration
    }

    pub fn reset(&self) {
        let mut inner = self.write();
        inner.samples.clear();
        inner.last_idle_time = None;
        inner.idle_duration = Duration::ZERO;
    }

    pub fn has_enough_samples(&self) -> bool {
        self.read().samples.len() >= self.min_samples_required
    }

    pub fn sample_count(&self) -> usize {
        self.read().samples.len()
    }

    pub fn min_samples_required(&self) -> usize {
        self.min_samples_required
    }
}
