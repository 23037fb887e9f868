/// Idle Governor 常量定义
/// 将分散的常量集中管理，提高代码可维护性
pub const NOTES: &str = "Idle-Based Auto Suspend Governor";
pub const AUTHOR: &str = "Author: walika @CoolApk, Tools-cx-app @GitHub";
pub const VERSION: &str = "Version: v1.0.0";

/// 空闲判定默认值
pub mod defaults {
    pub const WINDOW_SECONDS: u64 = 60;
    pub const IDLE_TIMEOUT_SECONDS: u64 = 300;
    pub const IDLE_TIMEOUT_SECONDS_WORKSTATION: u64 = 1800;
    pub const CPU_THRESHOLD_PCT: f64 = 10.0;
    pub const GPU_THRESHOLD_PCT: f64 = 5.0;
    pub const MIN_SAMPLES_REQUIRED: usize = 6;
    pub const SAMPLE_INTERVAL_SECONDS: u64 = 10;
    pub const COMMAND_TIMEOUT_SECONDS: u64 = 15;
}

/// 控制循环常量
pub mod agent {
    /// 两次采样间隔超过此值视为主机刚从休眠恢复（秒）
    pub const MIN_RESUME_GAP_SECONDS: u64 = 30;
    pub const RESUME_GAP_FACTOR: u64 = 3;
    /// 首次读取 /proc/stat 后的等待时间（毫秒）
    pub const CPU_PRIME_DELAY_MS: u64 = 250;
    /// 等待取消信号时的轮询粒度（毫秒）
    pub const CANCEL_POLL_MS: u64 = 100;
}
