use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use log::info;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};

use crate::utils::constants::agent::CANCEL_POLL_MS;

/// 协作式取消令牌，控制循环每轮检查一次
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 等待 timeout，期间被取消则提前返回 true
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let slice = Duration::from_millis(CANCEL_POLL_MS);
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(slice.min(deadline - now));
        }
    }

    /// SIGINT / SIGTERM / SIGHUP 到达时取消令牌
    pub fn register_signals(&self) -> Result<()> {
        for signal in [SIGINT, SIGTERM, SIGHUP] {
            signal_hook::flag::register(signal, Arc::clone(&self.cancelled))
                .with_context(|| format!("Failed to register handler for signal {signal}"))?;
        }
        info!("Signal handlers registered (SIGINT, SIGTERM, SIGHUP)");
        Ok(())
    }
}
