use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};

/// 阻止休眠的原因，封闭集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatingReason {
    WarmingUp,
    HighCpu,
    HighGpu,
    BelowTimeout,
    Inhibit,
}

impl GatingReason {
    pub const ALL: [GatingReason; 5] = [
        GatingReason::WarmingUp,
        GatingReason::HighCpu,
        GatingReason::HighGpu,
        GatingReason::BelowTimeout,
        GatingReason::Inhibit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GatingReason::WarmingUp => "warming_up",
            GatingReason::HighCpu => "high_cpu",
            GatingReason::HighGpu => "high_gpu",
            GatingReason::BelowTimeout => "below_timeout",
            GatingReason::Inhibit => "inhibit",
        }
    }
}

impl fmt::Display for GatingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 有序的原因集合，序列化为 JSON 数组（按枚举声明顺序）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GatingReasons(BTreeSet<GatingReason>);

impl GatingReasons {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回是否为新加入的原因
    pub fn insert(&mut self, reason: GatingReason) -> bool {
        self.0.insert(reason)
    }

    /// 返回原因是否曾经存在
    pub fn remove(&mut self, reason: GatingReason) -> bool {
        self.0.remove(&reason)
    }

    pub fn contains(&self, reason: GatingReason) -> bool {
        self.0.contains(&reason)
    }

    pub fn union(&self, other: &GatingReasons) -> GatingReasons {
        GatingReasons(self.0.union(&other.0).copied().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = GatingReason> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<GatingReason> for GatingReasons {
    fn from_iter<I: IntoIterator<Item = GatingReason>>(iter: I) -> Self {
        GatingReasons(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[GatingReason; N]> for GatingReasons {
    fn from(reasons: [GatingReason; N]) -> Self {
        reasons.into_iter().collect()
    }
}

impl fmt::Display for GatingReasons {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = self.iter().map(GatingReason::as_str).collect();
        f.write_str(&names.join(", "))
    }
}
