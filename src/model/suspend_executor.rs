use std::{io, sync::Arc};

use anyhow::{Context, Result, anyhow};
use log::{info, warn};
use thiserror::Error;

use crate::{
    datasource::{
        file_path::{SYS_POWER_STATE, SYSTEMCTL},
        inhibitor_monitor::InhibitorRegistry,
    },
    model::{
        gating::{GatingReason, GatingReasons},
        idle_state::IdleState,
    },
    utils::{
        command::{find_in_path, run},
        file_operate::read_file,
    },
};

/// 休眠未执行的原因。GatingBlocked / InhibitBlocked 是正常业务结果，不是故障
#[derive(Debug, Error)]
pub enum SuspendError {
    #[error("suspend blocked by gating reasons: {0}")]
    GatingBlocked(GatingReasons),
    #[error("suspend blocked by inhibitors: {}", .0.join(", "))]
    InhibitBlocked(Vec<String>),
    #[error("suspend command failed: {source}")]
    SuspendCommandFailed {
        #[source]
        source: io::Error,
        output: String,
    },
}

/// 休眠命令调用失败，附带命令输出
#[derive(Debug, Error)]
#[error("{error}")]
pub struct InvokeFailure {
    pub error: io::Error,
    pub output: String,
}

/// 外部休眠设施
pub trait SuspendInvoker {
    fn suspend(&self) -> Result<(), InvokeFailure>;

    /// 预检：设施存在且系统支持休眠
    fn check_available(&self) -> Result<()>;
}

/// 通过 systemctl suspend 请求休眠
#[derive(Debug, Default)]
pub struct SystemctlSuspendInvoker;

impl SuspendInvoker for SystemctlSuspendInvoker {
    fn suspend(&self) -> Result<(), InvokeFailure> {
        // 休眠命令不设超时，一旦发出就等它自然结束
        let output = run(SYSTEMCTL, &["suspend"]).map_err(|e| InvokeFailure {
            error: io::Error::other(format!("{e:#}")),
            output: String::new(),
        })?;

        if !output.success() {
            return Err(InvokeFailure {
                error: io::Error::other(format!("{SYSTEMCTL} suspend exited with {}", output.status)),
                output: output.combined(),
            });
        }
        Ok(())
    }

    fn check_available(&self) -> Result<()> {
        let tool = find_in_path(SYSTEMCTL).ok_or_else(|| anyhow!("{SYSTEMCTL} not found in PATH"))?;
        info!("Suspend facility: {}", tool.display());

        let states = read_file(SYS_POWER_STATE)
            .with_context(|| format!("Cannot read supported sleep states from {SYS_POWER_STATE}"))?;
        if !supports_suspend(&states) {
            return Err(anyhow!(
                "Kernel does not support suspend (available states: {})",
                states.trim()
            ));
        }
        Ok(())
    }
}

fn supports_suspend(power_states: &str) -> bool {
    power_states
        .split_whitespace()
        .any(|s| s == "mem" || s == "freeze")
}

/// 执行成功时的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendOutcome {
    /// enable_suspend = false，所有检查都通过但没有调用外部命令
    DryRun,
    Suspended,
}

/// 休眠执行器 - 检查阻止原因、重新查询抑制锁，然后调用外部休眠设施
pub struct SuspendExecutor {
    enable_suspend: bool,
    registry: Arc<dyn InhibitorRegistry + Send + Sync>,
    invoker: Arc<dyn SuspendInvoker + Send + Sync>,
}

impl SuspendExecutor {
    pub fn new(
        enable_suspend: bool,
        registry: Arc<dyn InhibitorRegistry + Send + Sync>,
        invoker: Arc<dyn SuspendInvoker + Send + Sync>,
    ) -> Self {
        Self {
            enable_suspend,
            registry,
            invoker,
        }
    }

    pub fn execute(&self, state: &mut IdleState) -> Result<SuspendOutcome, SuspendError> {
        self.execute_with_options(state, false)
    }

    /// 可能修改 state.gating_reasons（去掉或加入 inhibit），调用方据此回写状态
    pub fn execute_with_options(
        &self,
        state: &mut IdleState,
        ignore_inhibitors: bool,
    ) -> Result<SuspendOutcome, SuspendError> {
        if ignore_inhibitors && state.gating_reasons.remove(GatingReason::Inhibit) {
            info!("Ignoring inhibit gating reason on request");
        }

        if !state.gating_reasons.is_empty() {
            return Err(SuspendError::GatingBlocked(state.gating_reasons.clone()));
        }

        if !self.enable_suspend {
            info!("Dry-run: suspend conditions met, skipping suspend (enable_suspend = false)");
            return Ok(SuspendOutcome::DryRun);
        }

        if !ignore_inhibitors {
            match self.registry.active_inhibitors() {
                Ok(holders) if !holders.is_empty() => {
                    state.gating_reasons.insert(GatingReason::Inhibit);
                    return Err(SuspendError::InhibitBlocked(holders));
                }
                Ok(_) => {}
                // 查询失败按没有抑制锁处理，坏掉的检查不能永久阻止休眠
                Err(e) => warn!("Inhibitor query failed, assuming no inhibitors: {e:#}"),
            }
        }

        info!("Requesting system suspend");
        self.invoker
            .suspend()
            .map_err(|f| SuspendError::SuspendCommandFailed {
                source: f.error,
                output: f.output,
            })?;

        info!("Suspend command completed");
        Ok(SuspendOutcome::Suspended)
    }

    /// 原始的抑制锁查询，供只需要标注状态的调用方使用
    pub fn active_inhibitors(&self) -> Result<Vec<String>> {
        self.registry.active_inhibitors()
    }

    pub fn check_can_suspend(&self) -> Result<()> {
        self.invoker.check_available()
    }
}
