use std::{sync::Arc, time::Instant};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::{
    datasource::{config_parser::IdleConfig, file_path::MAIN_THREAD, load_monitor::MetricsSource},
    model::{
        gating::{GatingReason, GatingReasons},
        idle_engine::IdleEngine,
        idle_state::{IdleState, IdleStatus},
        state_store::StateStore,
        suspend_executor::{SuspendError, SuspendExecutor, SuspendOutcome},
    },
    utils::{
        clock::Clock,
        constants::agent::{MIN_RESUME_GAP_SECONDS, RESUME_GAP_FACTOR},
        shutdown::CancellationToken,
    },
};

/// 单个周期内可恢复的错误，控制循环记录后继续运行
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("sample collection failed: {0:#}")]
    SampleCollectionFailed(anyhow::Error),
    #[error("inhibitor query failed: {0:#}")]
    InhibitorQueryFailed(anyhow::Error),
    #[error("failed to persist state: {0:#}")]
    PersistenceFailed(anyhow::Error),
}

/// 常驻控制循环 - 每个周期采样一次、评估一次、持久化一次
pub struct IdleAgent {
    config: IdleConfig,
    engine: IdleEngine,
    executor: SuspendExecutor,
    store: StateStore,
    source: Box<dyn MetricsSource + Send>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    last_tick_end: Option<DateTime<Utc>>,
    last_status: Option<IdleStatus>,
}

impl IdleAgent {
    pub fn new(
        config: IdleConfig,
        source: Box<dyn MetricsSource + Send>,
        executor: SuspendExecutor,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine: IdleEngine::new(&config, clock.clone()),
            store: StateStore::new(config.state_file_path.clone()),
            config,
            executor,
            source,
            clock,
            cancel,
            last_tick_end: None,
            last_status: None,
        }
    }

    /// 主循环，直到取消令牌被触发。单个周期的失败不会终止循环
    pub fn run(&mut self) -> Result<()> {
        info!("{MAIN_THREAD} Start");
        info!(
            "Window: {}s, Idle timeout: {}s, CPU threshold: {}%, GPU threshold: {}%, Min samples: {}",
            self.config.window_seconds,
            self.config.idle_timeout_seconds,
            self.config.cpu_threshold_pct,
            self.config.gpu_threshold_pct,
            self.config.min_samples_required
        );
        info!(
            "Profile: {:?}, Sample interval: {}s",
            self.config.profile, self.config.sample_interval_seconds
        );
        info!("State file: {}", self.store.path().display());
        if !self.config.enable_suspend {
            info!("Dry-run mode: suspend will never be requested");
        }

        let interval = self.config.sample_interval();
        while !self.cancel.is_cancelled() {
            let started = Instant::now();

            if let Err(e) = self.tick() {
                warn!("{e}");
            }

            // 超时的周期不补偿，下一个周期直接顺延
            let wait = interval.saturating_sub(started.elapsed());
            if self.cancel.wait_timeout(wait) {
                break;
            }
        }

        info!("{MAIN_THREAD} Stop");
        Ok(())
    }

    /// 执行一个周期：采样、评估、合并抑制锁、持久化
    pub fn tick(&mut self) -> Result<IdleState, AgentError> {
        self.detect_resume(self.clock.now());
        let result = self.evaluate();
        // 间隔从上个周期结束时算起，周期本身耗时再长也不算休眠
        self.last_tick_end = Some(self.clock.now());
        result
    }

    fn evaluate(&mut self) -> Result<IdleState, AgentError> {
        let (cpu, gpu) = self
            .source
            .sample()
            .map_err(AgentError::SampleCollectionFailed)?;
        self.engine.add_metrics(cpu, gpu);

        let mut state = self.engine.get_state();

        match self.executor.active_inhibitors() {
            Ok(holders) => merge_inhibitors(&mut state.gating_reasons, &holders),
            Err(e) => {
                warn!("{}", AgentError::InhibitorQueryFailed(e));
                state.gating_reasons.remove(GatingReason::Inhibit);
            }
        }

        self.log_transition(&state, cpu, gpu);

        self.store
            .save(&state)
            .map_err(AgentError::PersistenceFailed)?;

        Ok(state)
    }

    /// 两次采样间隔远大于采样周期说明主机刚从休眠恢复，旧的空闲计时不能再用
    fn detect_resume(&mut self, now: DateTime<Utc>) {
        let Some(last) = self.last_tick_end else {
            return;
        };
        let gap_limit = (self.config.sample_interval_seconds * RESUME_GAP_FACTOR)
            .max(MIN_RESUME_GAP_SECONDS);
        let gap = (now - last).num_seconds();
        if gap > i64::try_from(gap_limit).unwrap_or(i64::MAX) {
            info!("Host resumed after {gap}s gap, resetting idle engine");
            self.engine.reset();
        }
    }

    fn log_transition(&mut self, state: &IdleState, cpu: f64, gpu: f64) {
        if self.last_status != Some(state.status) {
            match self.last_status {
                Some(prev) => info!("Status changed: {} -> {}", prev, state.status),
                None => info!("Status: {}", state.status),
            }
            self.last_status = Some(state.status);
        }
        debug!(
            "tick cpu={:.1}% gpu={:.1}% status={} idle_for={}s gating=[{}]",
            cpu, gpu, state.status, state.idle_for_seconds, state.gating_reasons
        );
    }
}

/// 按本进程刚查询到的结果设置或清除 inhibit
fn merge_inhibitors(reasons: &mut GatingReasons, holders: &[String]) {
    if holders.is_empty() {
        reasons.remove(GatingReason::Inhibit);
    } else {
        debug!("Active inhibitors: {}", holders.join(", "));
        *reasons = reasons.union(&GatingReasons::from([GatingReason::Inhibit]));
    }
}

/// 短生命周期检查的结果
#[derive(Debug)]
pub enum CheckOutcome {
    /// 还没有状态文件
    NoState,
    NotReady(IdleState),
    Blocked(SuspendError),
    DryRun,
    Suspended,
}

/// 由外部调度器调用：读取最新快照，满足条件时请求休眠。
/// 执行失败时把（可能被修改过的）状态写回，方便之后查看原因
pub fn run_check(
    store: &StateStore,
    executor: &SuspendExecutor,
    ignore_inhibitors: bool,
) -> Result<CheckOutcome> {
    if !store.exists() {
        info!("No state recorded at {}, nothing to do", store.path().display());
        return Ok(CheckOutcome::NoState);
    }

    let mut state = store.load()?;
    if ignore_inhibitors {
        state.gating_reasons.remove(GatingReason::Inhibit);
    }

    if !IdleEngine::should_suspend(&state) {
        info!(
            "Suspend not warranted: status={}, idle_for={}s/{}s, gating=[{}]",
            state.status, state.idle_for_seconds, state.threshold_seconds, state.gating_reasons
        );
        return Ok(CheckOutcome::NotReady(state));
    }

    match executor.execute_with_options(&mut state, ignore_inhibitors) {
        Ok(SuspendOutcome::DryRun) => Ok(CheckOutcome::DryRun),
        Ok(SuspendOutcome::Suspended) => Ok(CheckOutcome::Suspended),
        Err(e) => {
            let cause = match &e {
                SuspendError::SuspendCommandFailed { source, output } => {
                    error!("Suspend command failed: {source}");
                    if output.is_empty() {
                        format!("suspend command failed: {source}")
                    } else {
                        error!("Command output: {output}");
                        format!("suspend command failed: {source}: {output}")
                    }
                }
                blocked => {
                    info!("{blocked}");
                    blocked.to_string()
                }
            };

            store.save(&state).with_context(|| {
                format!("Failed to record state after unsuccessful suspend ({cause})")
            })?;

            match e {
                SuspendError::SuspendCommandFailed { .. } => Err(anyhow!(cause)),
                blocked => Ok(CheckOutcome::Blocked(blocked)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::suspend_executor::fakes::{FakeInvoker, FakeRegistry};
    use crate::utils::clock::ManualClock;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    struct ScriptedSource {
        samples: VecDeque<Result<(f64, f64), String>>,
        cancel_when_empty: Option<CancellationToken>,
    }

    impl ScriptedSource {
        fn repeat(n: usize, cpu: f64, gpu: f64) -> Self {
            Self {
                samples: (0..n).map(|_| Ok((cpu, gpu))).collect(),
                cancel_when_empty: None,
            }
        }
    }

    impl MetricsSource for ScriptedSource {
        fn sample(&mut self) -> Result<(f64, f64)> {
            let next = self
                .samples
                .pop_front()
                .unwrap_or_else(|| Err("exhausted".to_string()));
            if self.samples.is_empty() {
                if let Some(token) = &self.cancel_when_empty {
                    token.cancel();
                }
            }
            next.map_err(|e| anyhow!(e))
        }
    }

    /// 每次采样都耗时 step 秒的数据源
    struct SlowSource {
        clock: Arc<ManualClock>,
        step: i64,
    }

    impl MetricsSource for SlowSource {
        fn sample(&mut self) -> Result<(f64, f64)> {
            self.clock.advance(chrono::Duration::seconds(self.step));
            Ok((1.0, 0.0))
        }
    }

    /// 休眠失败，同时状态文件的位置变成了目录，写回必然失败
    struct ClobberingInvoker {
        state_path: std::path::PathBuf,
    }

    impl crate::model::suspend_executor::SuspendInvoker for ClobberingInvoker {
        fn suspend(&self) -> Result<(), crate::model::suspend_executor::InvokeFailure> {
            std::fs::remove_file(&self.state_path).unwrap();
            std::fs::create_dir(&self.state_path).unwrap();
            Err(crate::model::suspend_executor::InvokeFailure {
                error: std::io::Error::other("exit status: 1"),
                output: "Interactive authentication required.".to_string(),
            })
        }

        fn check_available(&self) -> Result<()> {
            Ok(())
        }
    }

    struct Harness {
        dir: TempDir,
        clock: Arc<ManualClock>,
        registry: Arc<FakeRegistry>,
        invoker: Arc<FakeInvoker>,
        config: IdleConfig,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let mut config = IdleConfig::with_state_dir(dir.path());
        config.min_samples_required = 3;
        config.idle_timeout_seconds = 20;
        config.sample_interval_seconds = 10;
        Harness {
            dir,
            clock: Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2026, 10, 19, 22, 0, 0).unwrap(),
            )),
            registry: FakeRegistry::holding(&[]),
            invoker: FakeInvoker::ok(),
            config,
        }
    }

    impl Harness {
        fn executor(&self) -> SuspendExecutor {
            SuspendExecutor::new(
                self.config.enable_suspend,
                self.registry.clone(),
                self.invoker.clone(),
            )
        }

        fn agent(&self, source: ScriptedSource) -> IdleAgent {
            IdleAgent::new(
                self.config.clone(),
                Box::new(source),
                self.executor(),
                self.clock.clone(),
                CancellationToken::new(),
            )
        }

        fn store(&self) -> StateStore {
            StateStore::new(self.config.state_file_path.clone())
        }

        fn advance(&self, secs: i64) {
            self.clock.advance(chrono::Duration::seconds(secs));
        }
    }

    #[test]
    fn ticks_persist_engine_state() {
        let h = harness();
        let mut agent = h.agent(ScriptedSource::repeat(5, 1.0, 0.0));

        let first = agent.tick().unwrap();
        assert_eq!(first.status, IdleStatus::WarmingUp);
        assert_eq!(h.store().load().unwrap(), first);

        for _ in 0..2 {
            h.advance(10);
            agent.tick().unwrap();
        }
        let state = h.store().load().unwrap();
        assert_eq!(state.status, IdleStatus::Idle);
        assert_eq!(state.gating_reasons, GatingReasons::from([GatingReason::BelowTimeout]));

        h.advance(10);
        agent.tick().unwrap();
        h.advance(10);
        let state = agent.tick().unwrap();
        assert_eq!(state.idle_for_seconds, 20);
        assert!(state.should_suspend());
    }

    #[test]
    fn inhibitor_reason_follows_fresh_query() {
        let h = harness();
        let mut agent = h.agent(ScriptedSource::repeat(4, 1.0, 0.0));

        h.registry.set_holders(&["trainer"]);
        let state = agent.tick().unwrap();
        assert!(state.gating_reasons.contains(GatingReason::Inhibit));
        assert!(state.gating_reasons.contains(GatingReason::WarmingUp));

        // the file keeps the reason, but readers never trust it after load
        let raw = std::fs::read_to_string(h.store().path()).unwrap();
        assert!(raw.contains("\"inhibit\""));
        assert!(!h.store().load().unwrap().gating_reasons.contains(GatingReason::Inhibit));

        h.registry.set_holders(&[]);
        h.advance(10);
        let state = agent.tick().unwrap();
        assert!(!state.gating_reasons.contains(GatingReason::Inhibit));
    }

    #[test]
    fn inhibitor_query_failure_is_not_fatal() {
        let mut h = harness();
        h.registry = FakeRegistry::failing("systemd-inhibit missing");
        let mut agent = h.agent(ScriptedSource::repeat(1, 1.0, 0.0));

        let state = agent.tick().unwrap();
        assert!(!state.gating_reasons.contains(GatingReason::Inhibit));
        assert!(h.store().exists());
    }

    #[test]
    fn sample_failure_skips_tick_without_writing() {
        let h = harness();
        let mut agent = h.agent(ScriptedSource {
            samples: VecDeque::from([Err("nvidia-smi failed".to_string())]),
            cancel_when_empty: None,
        });

        assert!(matches!(
            agent.tick(),
            Err(AgentError::SampleCollectionFailed(_))
        ));
        assert!(!h.store().exists());
        assert_eq!(h.registry.calls(), 0);
    }

    #[test]
    fn persistence_failure_is_reported_and_loop_state_kept() {
        let mut h = harness();
        // a directory cannot be replaced by a regular file
        h.config.state_file_path = h.dir.path().to_path_buf();
        let mut agent = h.agent(ScriptedSource::repeat(2, 1.0, 0.0));

        assert!(matches!(agent.tick(), Err(AgentError::PersistenceFailed(_))));
        h.advance(10);
        assert!(matches!(agent.tick(), Err(AgentError::PersistenceFailed(_))));
        assert_eq!(agent.engine.window().sample_count(), 2);
    }

    #[test]
    fn long_gap_between_ticks_resets_engine() {
        let h = harness();
        let mut agent = h.agent(ScriptedSource::repeat(6, 1.0, 0.0));
        for _ in 0..4 {
            agent.tick().unwrap();
            h.advance(10);
        }
        assert_eq!(agent.engine.window().sample_count(), 4);

        // host was asleep for an hour
        h.advance(3600);
        let state = agent.tick().unwrap();
        assert_eq!(state.status, IdleStatus::WarmingUp);
        assert_eq!(agent.engine.window().sample_count(), 1);
    }

    #[test]
    fn slow_ticks_are_not_mistaken_for_resume() {
        let mut h = harness();
        h.config.window_seconds = 600;
        let source = SlowSource {
            clock: h.clock.clone(),
            step: 31,
        };
        let mut agent = IdleAgent::new(
            h.config.clone(),
            Box::new(source),
            h.executor(),
            h.clock.clone(),
            CancellationToken::new(),
        );

        let statuses: Vec<IdleStatus> = (0..5).map(|_| agent.tick().unwrap().status).collect();
        assert_eq!(
            statuses,
            vec![
                IdleStatus::WarmingUp,
                IdleStatus::WarmingUp,
                IdleStatus::Idle,
                IdleStatus::Idle,
                IdleStatus::Idle,
            ]
        );
        assert_eq!(agent.engine.window().sample_count(), 5);
    }

    #[test]
    fn run_stops_on_cancellation() {
        let h = harness();
        let token = CancellationToken::new();
        let source = ScriptedSource {
            samples: VecDeque::from([Ok((1.0, 0.0))]),
            cancel_when_empty: Some(token.clone()),
        };
        let mut agent = IdleAgent::new(
            h.config.clone(),
            Box::new(source),
            h.executor(),
            h.clock.clone(),
            token,
        );

        let started = Instant::now();
        agent.run().unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert!(h.store().exists());
    }

    #[test]
    fn run_with_cancelled_token_does_nothing() {
        let h = harness();
        let token = CancellationToken::new();
        token.cancel();
        let mut agent = IdleAgent::new(
            h.config.clone(),
            Box::new(ScriptedSource::repeat(1, 1.0, 0.0)),
            h.executor(),
            h.clock.clone(),
            token,
        );
        agent.run().unwrap();
        assert!(!h.store().exists());
    }

    fn ready_state(reasons: &[GatingReason]) -> IdleState {
        IdleState {
            status: IdleStatus::Idle,
            idle_for_seconds: 400,
            threshold_seconds: 300,
            cpu_idle_pct: 98.0,
            gpu_idle_pct: 100.0,
            gating_reasons: reasons.iter().copied().collect(),
            last_update: Utc.with_ymd_and_hms(2026, 10, 19, 22, 0, 0).unwrap(),
        }
    }

    #[test]
    fn check_without_state_is_a_no_op() {
        let h = harness();
        let outcome = run_check(&h.store(), &h.executor(), false).unwrap();
        assert!(matches!(outcome, CheckOutcome::NoState));
        assert_eq!(h.invoker.calls(), 0);
    }

    #[test]
    fn check_not_ready_does_not_call_executor() {
        let h = harness();
        h.store()
            .save(&ready_state(&[GatingReason::BelowTimeout]))
            .unwrap();
        let outcome = run_check(&h.store(), &h.executor(), false).unwrap();
        assert!(matches!(outcome, CheckOutcome::NotReady(_)));
        assert_eq!(h.registry.calls(), 0);
        assert_eq!(h.invoker.calls(), 0);
    }

    #[test]
    fn check_suspends_when_ready() {
        let h = harness();
        h.store().save(&ready_state(&[])).unwrap();
        let outcome = run_check(&h.store(), &h.executor(), false).unwrap();
        assert!(matches!(outcome, CheckOutcome::Suspended));
        assert_eq!(h.invoker.calls(), 1);
    }

    #[test]
    fn check_rechecks_stale_inhibit_fresh() {
        let h = harness();
        // persisted inhibit is dropped on load, so the decision rests on the live query
        h.store().save(&ready_state(&[GatingReason::Inhibit])).unwrap();
        let outcome = run_check(&h.store(), &h.executor(), false).unwrap();
        assert!(matches!(outcome, CheckOutcome::Suspended));
        assert_eq!(h.registry.calls(), 1);
    }

    #[test]
    fn check_blocked_by_inhibitor_writes_reason_back() {
        let h = harness();
        h.registry.set_holders(&["model-pull"]);
        h.store().save(&ready_state(&[])).unwrap();

        let outcome = run_check(&h.store(), &h.executor(), false).unwrap();
        assert!(matches!(
            outcome,
            CheckOutcome::Blocked(SuspendError::InhibitBlocked(_))
        ));
        let raw = std::fs::read_to_string(h.store().path()).unwrap();
        assert!(raw.contains("\"inhibit\""));
        assert_eq!(h.invoker.calls(), 0);
    }

    #[test]
    fn check_ignoring_inhibitors_skips_query() {
        let h = harness();
        h.registry.set_holders(&["model-pull"]);
        h.store().save(&ready_state(&[])).unwrap();

        let outcome = run_check(&h.store(), &h.executor(), true).unwrap();
        assert!(matches!(outcome, CheckOutcome::Suspended));
        assert_eq!(h.registry.calls(), 0);
    }

    #[test]
    fn check_dry_run() {
        let mut h = harness();
        h.config.enable_suspend = false;
        h.store().save(&ready_state(&[])).unwrap();

        let outcome = run_check(&h.store(), &h.executor(), false).unwrap();
        assert!(matches!(outcome, CheckOutcome::DryRun));
        assert_eq!(h.invoker.calls(), 0);
    }

    #[test]
    fn check_propagates_command_failure() {
        let mut h = harness();
        h.invoker = FakeInvoker::failing("Interactive authentication required.");
        h.store().save(&ready_state(&[])).unwrap();

        let err = run_check(&h.store(), &h.executor(), false).unwrap_err();
        assert!(err.to_string().contains("suspend command failed"));
        assert_eq!(h.invoker.calls(), 1);
        assert!(h.store().exists());
    }

    #[test]
    fn check_keeps_command_failure_when_write_back_fails() {
        let h = harness();
        h.store().save(&ready_state(&[])).unwrap();
        let executor = SuspendExecutor::new(
            true,
            h.registry.clone(),
            Arc::new(ClobberingInvoker {
                state_path: h.store().path().to_path_buf(),
            }),
        );

        let err = run_check(&h.store(), &executor, false).unwrap_err();
        let chain = format!("{err:#}");
        assert!(chain.contains("Failed to record state"), "{chain}");
        assert!(chain.contains("suspend command failed"), "{chain}");
        assert!(chain.contains("Interactive authentication required."), "{chain}");
    }

    #[test]
    fn check_corrupt_state_is_an_error() {
        let h = harness();
        std::fs::write(h.store().path(), "not json").unwrap();
        assert!(run_check(&h.store(), &h.executor(), false).is_err());
    }
}
