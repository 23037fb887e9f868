use std::path::Path;

use anyhow::{Result, anyhow};
use chrono::Local;
use log::{LevelFilter, Metadata, Record};
use once_cell::sync::Lazy;

// Custom logger implementation - 输出到标准错误，stdout 留给命令输出
struct CustomLogger;

impl log::Log for CustomLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        // 实际的过滤由log库根据设置的max_level完成
        true
    }

    fn log(&self, record: &Record) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        eprintln!("[{}][{}]: {}", timestamp, record.level(), record.args());
    }

    fn flush(&self) {}
}

// Global logger instance
static LOGGER: Lazy<CustomLogger> = Lazy::new(|| CustomLogger);

pub fn init_logger(log_level_path: &Path) -> Result<()> {
    let log_level = read_log_level_config(log_level_path);

    log::set_logger(&*LOGGER).map_err(|e| anyhow!("Failed to set logger: {e}"))?;
    log::set_max_level(log_level);

    log::debug!("Logger initialized with level: {}", log_level);
    log::debug!("Log level config path: {}", log_level_path.display());

    Ok(())
}

/// 读取日志等级配置文件，文件缺失或内容无法识别时使用 Info
pub fn read_log_level_config(log_level_path: &Path) -> LevelFilter {
    let default_level = LevelFilter::Info;

    let content = match std::fs::read_to_string(log_level_path) {
        Ok(content) => content,
        Err(_) => return default_level,
    };

    parse_log_level(&content).unwrap_or(default_level)
}

fn parse_log_level(content: &str) -> Option<LevelFilter> {
    match content.trim().to_lowercase().as_str() {
        "debug" => Some(LevelFilter::Debug),
        "info" => Some(LevelFilter::Info),
        "warn" => Some(LevelFilter::Warn),
        "error" => Some(LevelFilter::Error),
        _ => None,
    }
}

// 更新日志等级
pub fn update_log_level(log_level_path: &Path) {
    let new_level = read_log_level_config(log_level_path);
    if new_level != log::max_level() {
        log::set_max_level(new_level);
        log::info!("Log level updated to: {}", new_level);
    }
}
