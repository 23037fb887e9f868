use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    datasource::file_path::*,
    utils::{
        constants::defaults,
        file_operate::{check_read_simple, read_file, write_file_atomic},
    },
};

/// 部署场景，决定 idle_timeout_seconds 的默认值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    #[default]
    Standard,
    Workstation,
}

impl Profile {
    fn default_idle_timeout(self) -> u64 {
        match self {
            Profile::Standard => defaults::IDLE_TIMEOUT_SECONDS,
            Profile::Workstation => defaults::IDLE_TIMEOUT_SECONDS_WORKSTATION,
        }
    }
}

/// 空闲判定配置，启动时解析一次，之后只读
#[derive(Debug, Clone, PartialEq)]
pub struct IdleConfig {
    pub window_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub cpu_threshold_pct: f64,
    pub gpu_threshold_pct: f64,
    pub min_samples_required: usize,
    pub enable_suspend: bool,
    pub state_file_path: PathBuf,
    pub sample_interval_seconds: u64,
    pub command_timeout_seconds: u64,
    pub profile: Profile,
}

impl IdleConfig {
    /// 所有字段取默认值，状态文件位于 state_dir 中
    pub fn with_state_dir(state_dir: &Path) -> Self {
        RawIdleSection::default().resolve(state_dir)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_seconds)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_seconds == 0 {
            bail!("window_seconds must be greater than 0");
        }
        if self.sample_interval_seconds == 0 {
            bail!("sample_interval_seconds must be greater than 0");
        }
        if self.command_timeout_seconds == 0 {
            bail!("command_timeout_seconds must be greater than 0");
        }
        if !(self.cpu_threshold_pct > 0.0 && self.cpu_threshold_pct <= 100.0) {
            bail!(
                "cpu_threshold_pct must be in (0, 100], got {}",
                self.cpu_threshold_pct
            );
        }
        if !(self.gpu_threshold_pct > 0.0 && self.gpu_threshold_pct <= 100.0) {
            bail!(
                "gpu_threshold_pct must be in (0, 100], got {}",
                self.gpu_threshold_pct
            );
        }
        if self.min_samples_required == 0 {
            bail!("min_samples_required must be at least 1");
        }
        Ok(())
    }
}

/// 配置文件中的 [idle] 段，未给出的字段为 None
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawIdleSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    profile: Option<Profile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    window_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    idle_timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cpu_threshold_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gpu_threshold_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min_samples_required: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    enable_suspend: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state_file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sample_interval_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawConfigFile {
    #[serde(default)]
    idle: RawIdleSection,
}

impl RawIdleSection {
    fn resolve(self, state_dir: &Path) -> IdleConfig {
        let profile = self.profile.unwrap_or_default();
        IdleConfig {
            window_seconds: self.window_seconds.unwrap_or(defaults::WINDOW_SECONDS),
            idle_timeout_seconds: self
                .idle_timeout_seconds
                .unwrap_or_else(|| profile.default_idle_timeout()),
            cpu_threshold_pct: self
                .cpu_threshold_pct
                .unwrap_or(defaults::CPU_THRESHOLD_PCT),
            gpu_threshold_pct: self
                .gpu_threshold_pct
                .unwrap_or(defaults::GPU_THRESHOLD_PCT),
            min_samples_required: self
                .min_samples_required
                .unwrap_or(defaults::MIN_SAMPLES_REQUIRED),
            enable_suspend: self.enable_suspend.unwrap_or(true),
            state_file_path: self
                .state_file_path
                .unwrap_or_else(|| state_dir.join(STATE_FILE_NAME)),
            sample_interval_seconds: self
                .sample_interval_seconds
                .unwrap_or(defaults::SAMPLE_INTERVAL_SECONDS),
            command_timeout_seconds: self
                .command_timeout_seconds
                .unwrap_or(defaults::COMMAND_TIMEOUT_SECONDS),
            profile,
        }
    }
}

/// 启动时解析一次的路径集合
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub state_dir: PathBuf,
    pub config_file: PathBuf,
    pub log_level_file: PathBuf,
}

impl Paths {
    pub fn new(state_dir: PathBuf) -> Self {
        Self {
            config_file: state_dir.join(CONFIG_FILE_NAME),
            log_level_file: state_dir.join(LOG_LEVEL_FILE_NAME),
            state_dir,
        }
    }

    /// 从环境变量和有效用户解析状态目录
    pub fn resolve() -> Result<Self> {
        // SAFETY: geteuid 没有失败情况，也不访问内存
        let euid = unsafe { libc::geteuid() };
        let state_dir = resolve_state_dir(
            env::var_os(STATE_DIR_ENV).map(PathBuf::from),
            euid,
            env::var_os(XDG_STATE_HOME_ENV).map(PathBuf::from),
            env::var_os(HOME_ENV).map(PathBuf::from),
        )?;
        Ok(Self::new(state_dir))
    }
}

fn resolve_state_dir(
    override_dir: Option<PathBuf>,
    euid: u32,
    xdg_state_home: Option<PathBuf>,
    home: Option<PathBuf>,
) -> Result<PathBuf> {
    if let Some(dir) = override_dir.filter(|d| !d.as_os_str().is_empty()) {
        return Ok(dir);
    }
    if euid == 0 {
        return Ok(PathBuf::from(ROOT_STATE_DIR));
    }
    if let Some(xdg) = xdg_state_home.filter(|d| d.is_absolute()) {
        return Ok(xdg.join(APP_DIR_NAME));
    }
    if let Some(home) = home.filter(|d| !d.as_os_str().is_empty()) {
        return Ok(home.join(USER_STATE_SUBDIR).join(APP_DIR_NAME));
    }
    bail!("Cannot resolve state directory: set {STATE_DIR_ENV} or HOME")
}

fn read_raw_config(config_file: &Path) -> Result<RawConfigFile> {
    if !check_read_simple(config_file) {
        return Ok(RawConfigFile::default());
    }
    let content = read_file(config_file)?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", config_file.display()))
}

/// 读取配置文件，文件不存在时使用默认值
pub fn config_read(paths: &Paths) -> Result<IdleConfig> {
    if check_read_simple(&paths.config_file) {
        info!("Reading config file: {}", paths.config_file.display());
    } else {
        info!(
            "Config file not found, using defaults: {}",
            paths.config_file.display()
        );
    }

    let raw = read_raw_config(&paths.config_file)?;
    let config = raw.idle.resolve(&paths.state_dir);
    config
        .validate()
        .with_context(|| format!("Invalid config: {}", paths.config_file.display()))?;
    Ok(config)
}

/// 修改 enable_suspend 并原子写回，其它字段保持原样
pub fn config_set_enable_suspend(paths: &Paths, enable: bool) -> Result<()> {
    let mut raw = read_raw_config(&paths.config_file)?;
    raw.idle.enable_suspend = Some(enable);

    let content = toml::to_string_pretty(&raw).with_context(|| "Failed to serialize config")?;
    write_file_atomic(&paths.config_file, content)?;

    info!(
        "enable_suspend set to {} in {}",
        enable,
        paths.config_file.display()
    );
    Ok(())
}
