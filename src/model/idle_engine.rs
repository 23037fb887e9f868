use std::sync::Arc;

use log::debug;

use crate::{
    datasource::config_parser::IdleConfig,
    model::{
        gating::{GatingReason, GatingReasons},
        idle_state::{IdleState, IdleStatus},
        sliding_window::{MetricSample, SlidingWindow},
    },
    utils::clock::Clock,
};

/// 空闲判定引擎 - 把窗口统计归类为 warming_up / active / idle，并给出阻止原因。
/// 引擎本身不关心抑制锁，inhibit 原因由控制循环合并
pub struct IdleEngine {
    window: SlidingWindow,
    cpu_threshold_pct: f64,
    gpu_threshold_pct: f64,
    idle_timeout_seconds: i64,
    clock: Arc<dyn Clock>,
}

impl IdleEngine {
    pub fn new(config: &IdleConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            window: SlidingWindow::new(
                config.window(),
                config.min_samples_required,
                clock.clone(),
            ),
            cpu_threshold_pct: config.cpu_threshold_pct,
            gpu_threshold_pct: config.gpu_threshold_pct,
            idle_timeout_seconds: i64::try_from(config.idle_timeout_seconds).unwrap_or(i64::MAX),
            clock,
        }
    }

    pub fn add_metrics(&self, cpu_util_pct: f64, gpu_util_pct: f64) {
        self.window.add_sample(MetricSample {
            timestamp: self.clock.now(),
            cpu_util_pct,
            gpu_util_pct,
        });
    }

    /// 计算当前状态。会推进窗口的滞回时钟，每个周期调用一次
    pub fn get_state(&self) -> IdleState {
        let now = self.clock.now();

        if !self.window.has_enough_samples() {
            debug!(
                "Warming up: {}/{} samples",
                self.window.sample_count(),
                self.window.min_samples_required()
            );
            return IdleState::warming_up(self.idle_timeout_seconds, now);
        }

        let stats = self
            .window
            .is_idle(self.cpu_threshold_pct, self.gpu_threshold_pct);
        let idle_for = self
            .window
            .get_idle_duration(self.cpu_threshold_pct, self.gpu_threshold_pct);
        let idle_for_seconds = i64::try_from(idle_for.as_secs()).unwrap_or(i64::MAX);

        let mut gating_reasons = GatingReasons::new();
        let status = if stats.idle {
            if idle_for_seconds < self.idle_timeout_seconds {
                gating_reasons.insert(GatingReason::BelowTimeout);
            }
            IdleStatus::Idle
        } else {
            if stats.cpu_avg >= self.cpu_threshold_pct {
                gating_reasons.insert(GatingReason::HighCpu);
            }
            if stats.gpu_avg >= self.gpu_threshold_pct {
                gating_reasons.insert(GatingReason::HighGpu);
            }
            IdleStatus::Active
        };

        IdleState {
            status,
            idle_for_seconds,
            threshold_seconds: self.idle_timeout_seconds,
            cpu_idle_pct: 100.0 - stats.cpu_avg,
            gpu_idle_pct: 100.0 - stats.gpu_avg,
            gating_reasons,
            last_update: now,
        }
    }

    pub fn should_suspend(state: &IdleState) -> bool {
        state.should_suspend()
    }

    pub fn reset(&self) {
        self.window.reset();
    }

    #[cfg(test)]
    pub fn window(&self) -> &SlidingWindow {
        &self.window
    }
}
