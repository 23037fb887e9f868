use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;

use crate::{
    model::{gating::GatingReason, idle_state::IdleState},
    utils::file_operate::{check_read_simple, read_file, remove_file_idempotent, write_file_atomic},
};

/// idle_state.json 的持久化。写入是原子的，读取永远不会看到半个文件
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, state: &IdleState) -> Result<()> {
        let json = serde_json::to_string_pretty(state).with_context(|| "Failed to serialize state")?;
        write_file_atomic(&self.path, json)
            .with_context(|| format!("Failed to persist state to {}", self.path.display()))?;
        debug!("State saved: {} ({})", state.status, state.gating_reasons);
        Ok(())
    }

    /// 读取状态。inhibit 只在当前进程内新查询的结果中才可信，所以读取时一律去掉
    pub fn load(&self) -> Result<IdleState> {
        let content = read_file(&self.path)?;
        let mut state: IdleState = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", self.path.display()))?;
        if state.gating_reasons.remove(GatingReason::Inhibit) {
            debug!("Dropped stale inhibit reason from persisted state");
        }
        Ok(state)
    }

    pub fn exists(&self) -> bool {
        check_read_simple(&self.path)
    }

    pub fn delete(&self) -> Result<()> {
        remove_file_idempotent(&self.path)
    }
}
