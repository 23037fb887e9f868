use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::gating::{GatingReason, GatingReasons};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleStatus {
    WarmingUp,
    Active,
    Idle,
}

impl fmt::Display for IdleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IdleStatus::WarmingUp => "warming_up",
            IdleStatus::Active => "active",
            IdleStatus::Idle => "idle",
        })
    }
}

/// 引擎最近一次判定结果，也是 idle_state.json 的内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdleState {
    pub status: IdleStatus,
    #[serde(rename = "idle_for_s")]
    pub idle_for_seconds: i64,
    #[serde(rename = "threshold_s")]
    pub threshold_seconds: i64,
    pub cpu_idle_pct: f64,
    pub gpu_idle_pct: f64,
    pub gating_reasons: GatingReasons,
    pub last_update: DateTime<Utc>,
}

impl IdleState {
    pub fn warming_up(threshold_seconds: i64, now: DateTime<Utc>) -> Self {
        Self {
            status: IdleStatus::WarmingUp,
            idle_for_seconds: 0,
            threshold_seconds,
            cpu_idle_pct: 0.0,
            gpu_idle_pct: 0.0,
            gating_reasons: GatingReasons::from([GatingReason::WarmingUp]),
            last_update: now,
        }
    }

    /// 状态为 idle、没有任何阻止原因且空闲时长达到阈值时才允许休眠。
    /// 前两个条件在引擎输出中互相蕴含，这里仍然都检查
    pub fn should_suspend(&self) -> bool {
        self.status == IdleStatus::Idle
            && self.gating_reasons.is_empty()
            && self.idle_for_seconds >= self.threshold_seconds
    }

    /// 距离满足休眠条件的剩余秒数。只有空闲且唯一的阻止原因是未达阈值时才有意义
    pub fn time_remaining(&self) -> Option<i64> {
        if self.status != IdleStatus::Idle {
            return None;
        }
        let only_timeout = self
            .gating_reasons
            .iter()
            .all(|r| r == GatingReason::BelowTimeout);
        if !only_timeout {
            return None;
        }
        Some((self.threshold_seconds - self.idle_for_seconds).max(0))
    }
}
