mod datasource;
mod model;
mod utils;

use std::{env, fs, sync::Arc, thread};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use log::{info, warn};

use crate::{
    datasource::{
        config_parser::{IdleConfig, Paths, config_read, config_set_enable_suspend},
        file_path::LOG_LEVEL_THREAD,
        inhibitor_monitor::SystemdInhibitorRegistry,
        load_monitor::SystemMetricsSource,
    },
    model::{
        agent::{CheckOutcome, IdleAgent, run_check},
        gating::GatingReason,
        state_store::StateStore,
        suspend_executor::{SuspendExecutor, SystemctlSuspendInvoker},
    },
    utils::{
        clock::SystemClock,
        constants::{AUTHOR, NOTES, VERSION},
        log_monitor::monitor_log_level,
        logger::init_logger,
        shutdown::CancellationToken,
    },
};

fn print_usage() {
    println!("{}", NOTES);
    println!("Usage:");
    println!("\tagent                       run the idle monitor loop");
    println!("\tcheck [--ignore-inhibitors] suspend now if the recorded state allows it");
    println!("\tstatus                      show the recorded idle state");
    println!("\tenable                      enable auto-suspend");
    println!("\tdisable                     disable auto-suspend (dry-run)");
    println!("\tpreflight                   check suspend support and inhibitors");
    println!("\tclear                       delete the recorded idle state");
    println!("\t-v                          show version");
    println!("\t-h                          show help");
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("-h");

    match command {
        "-h" | "--help" => {
            print_usage();
            return Ok(());
        }
        "-v" | "--version" => {
            println!("{}", NOTES);
            println!("{}", AUTHOR);
            println!("{}", VERSION);
            return Ok(());
        }
        _ => {}
    }

    let paths = Paths::resolve()?;
    init_logger(&paths.log_level_file)?;

    match command {
        "agent" => run_agent(&paths),
        "check" => {
            let mut ignore_inhibitors = false;
            for arg in &args[2..] {
                match arg.as_str() {
                    "--ignore-inhibitors" => ignore_inhibitors = true,
                    other => return Err(anyhow!("Unknown argument for check: {other}")),
                }
            }
            run_checker(&paths, ignore_inhibitors)
        }
        "status" => print_status(&paths),
        "enable" => config_set_enable_suspend(&paths, true),
        "disable" => config_set_enable_suspend(&paths, false),
        "preflight" => preflight(&paths),
        "clear" => clear_state(&paths),
        other => {
            println!("Unknown argument: {}", other);
            println!("Use -h for help");
            Err(anyhow!("Unknown argument: {other}"))
        }
    }
}

fn build_executor(config: &IdleConfig) -> SuspendExecutor {
    SuspendExecutor::new(
        config.enable_suspend,
        Arc::new(SystemdInhibitorRegistry::new(config.command_timeout())),
        Arc::new(SystemctlSuspendInvoker),
    )
}

fn run_agent(paths: &Paths) -> Result<()> {
    info!("{}", NOTES);
    info!("{}", VERSION);

    let config = config_read(paths)?;
    fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("Failed to create state dir: {}", paths.state_dir.display()))?;

    let cancel = CancellationToken::new();
    cancel.register_signals()?;

    let source = SystemMetricsSource::new(config.command_timeout());
    source.utilization_init()?;

    let executor = build_executor(&config);
    if let Err(e) = executor.check_can_suspend() {
        warn!("Suspend preflight failed, check will not be able to suspend: {e:#}");
    }

    // 启动日志等级监控线程
    let log_level_path = paths.log_level_file.clone();
    let spawned = thread::Builder::new()
        .name(LOG_LEVEL_THREAD.to_string())
        .spawn(move || {
            if let Err(e) = monitor_log_level(log_level_path) {
                warn!("Log level monitor error: {e:#}");
            }
        });
    if let Err(e) = spawned {
        warn!("Failed to start log level monitor: {e}");
    }

    let mut agent = IdleAgent::new(
        config,
        Box::new(source),
        executor,
        Arc::new(SystemClock),
        cancel,
    );
    agent.run()
}

fn run_checker(paths: &Paths, ignore_inhibitors: bool) -> Result<()> {
    let config = config_read(paths)?;
    let store = StateStore::new(config.state_file_path.clone());
    let executor = build_executor(&config);

    match run_check(&store, &executor, ignore_inhibitors)? {
        CheckOutcome::NoState => println!("No state recorded yet"),
        CheckOutcome::NotReady(state) => println!(
            "Not suspending: status={}, gating=[{}]",
            state.status, state.gating_reasons
        ),
        CheckOutcome::Blocked(reason) => println!("Not suspending: {reason}"),
        CheckOutcome::DryRun => println!("Dry-run: would suspend now"),
        CheckOutcome::Suspended => println!("Suspended and resumed"),
    }
    Ok(())
}

fn print_status(paths: &Paths) -> Result<()> {
    let config = config_read(paths)?;
    let store = StateStore::new(config.state_file_path.clone());

    println!(
        "Auto-suspend:   {}",
        if config.enable_suspend {
            "enabled"
        } else {
            "disabled (dry-run)"
        }
    );

    if !store.exists() {
        println!("No state recorded yet ({})", store.path().display());
        return Ok(());
    }

    let mut state = store.load()?;

    // 持久化的 inhibit 不可信，展示前重新查询
    let executor = build_executor(&config);
    let inhibitors = match executor.active_inhibitors() {
        Ok(holders) => {
            if !holders.is_empty() {
                state.gating_reasons.insert(GatingReason::Inhibit);
            }
            holders.join(", ")
        }
        Err(e) => format!("unknown ({e:#})"),
    };

    let age = (Utc::now() - state.last_update).num_seconds().max(0);
    println!("Status:         {}", state.status);
    println!(
        "Idle for:       {}s / {}s",
        state.idle_for_seconds, state.threshold_seconds
    );
    println!("CPU idle:       {:.1}%", state.cpu_idle_pct);
    println!("GPU idle:       {:.1}%", state.gpu_idle_pct);
    println!("Gating:         {}", state.gating_reasons);
    println!(
        "Inhibitors:     {}",
        if inhibitors.is_empty() {
            "none"
        } else {
            inhibitors.as_str()
        }
    );
    println!(
        "Time remaining: {}",
        state
            .time_remaining()
            .map_or_else(|| "n/a".to_string(), |s| format!("{s}s"))
    );
    println!(
        "Last update:    {} ({}s ago)",
        state.last_update.to_rfc3339(),
        age
    );
    Ok(())
}

fn preflight(paths: &Paths) -> Result<()> {
    let config = config_read(paths)?;
    let executor = build_executor(&config);

    match executor.active_inhibitors() {
        Ok(holders) if holders.is_empty() => println!("Inhibitors:       none"),
        Ok(holders) => println!("Inhibitors:       {}", holders.join(", ")),
        Err(e) => println!("Inhibitors:       query failed ({e:#})"),
    }

    match executor.check_can_suspend() {
        Ok(()) => {
            println!("Suspend support:  OK");
            Ok(())
        }
        Err(e) => {
            println!("Suspend support:  FAILED ({e:#})");
            Err(e)
        }
    }
}

fn clear_state(paths: &Paths) -> Result<()> {
    let config = config_read(paths)?;
    let store = StateStore::new(config.state_file_path);
    store.delete()?;
    println!("Cleared {}", store.path().display());
    Ok(())
}
