use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{debug, error, info};

use tunixd::actuator::LinuxControl;
use tunixd::config::Config;
use tunixd::events::EventBus;
use tunixd::memory::{MemoryConfig, MemoryController};
use tunixd::mode::{Mode, ModeController, ModeControllerConfig};
use tunixd::observer::{Observer, ObserverConfig};
use tunixd::safety::CriticalSet;
use tunixd::sched::{Scheduler, SchedulerConfig};
use tunixd::{collectors, SystemControl};

#[derive(Parser, Debug)]
#[command(
    name = "tunixd",
    about = "Adaptive resource scheduling daemon",
    version
)]
struct Args {
    /// Mode to apply at startup, or a one-shot query.
    #[arg(value_enum)]
    command: Option<CliCommand>,

    /// Path to a key=value configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum CliCommand {
    Gaming,
    Productivity,
    PowerSaving,
    Balanced,
    /// Print total CPU usage percent and exit.
    GetCpu,
    /// Print used memory percent and exit.
    GetMem,
}

impl CliCommand {
    fn startup_mode(self) -> Option<Mode> {
        match self {
            CliCommand::Gaming => Some(Mode::Gaming),
            CliCommand::Productivity => Some(Mode::Productivity),
            CliCommand::PowerSaving => Some(Mode::PowerSaving),
            CliCommand::Balanced => Some(Mode::Balanced),
            CliCommand::GetCpu | CliCommand::GetMem => None,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("tunixd: {e}");
                return ExitCode::from(2);
            }
        },
        None => Config::default(),
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.to_string()),
    )
    .init();

    match args.command {
        Some(CliCommand::GetCpu) => return query_cpu(Path::new("/proc")).await,
        Some(CliCommand::GetMem) => return query_mem(Path::new("/proc")),
        _ => {}
    }

    let startup_mode = args.command.and_then(CliCommand::startup_mode);
    run_daemon(config, startup_mode).await
}

/// One-shot `get-cpu`: two /proc/stat readings, a short gap apart.
async fn query_cpu(proc_root: &Path) -> ExitCode {
    let first = collectors::read_cpu_times(proc_root);
    tokio::time::sleep(Duration::from_millis(250)).await;
    let second = collectors::read_cpu_times(proc_root);
    match (first, second) {
        (Some(prev), Some(now)) => {
            let usage = now.usage_since(&prev).unwrap_or(0.0);
            println!("{usage:.1}");
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("tunixd: cannot read /proc/stat");
            ExitCode::from(1)
        }
    }
}

fn query_mem(proc_root: &Path) -> ExitCode {
    match collectors::read_meminfo(proc_root) {
        Some(info) if info.total_kb > 0 => {
            let used = 100.0 * info.used_kb() as f64 / info.total_kb as f64;
            println!("{used:.1}");
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("tunixd: cannot read /proc/meminfo");
            ExitCode::from(1)
        }
    }
}

async fn run_daemon(config: Config, startup_mode: Option<Mode>) -> ExitCode {
    let critical = Arc::new(CriticalSet::default());
    let bus = Arc::new(EventBus::new());
    bus.subscribe(|event| {
        if let Ok(json) = serde_json::to_string(event) {
            debug!("[event] {json}");
        }
    });

    let control: Arc<dyn SystemControl> = Arc::new(LinuxControl::new(critical.clone()));
    let observer = Arc::new(Observer::new(
        ObserverConfig {
            tick: Duration::from_millis(config.monitoring_interval_ms.max(1)),
            cpu_threshold_percent: config.cpu_threshold_percent,
        },
        critical.clone(),
        bus.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        SchedulerConfig {
            default_slice_ms: config.default_time_slice_ms,
            adaptive_cpu_threshold: config.cpu_threshold_percent,
            ..Default::default()
        },
        config.default_scheduling_algorithm,
        control.clone(),
        bus.clone(),
    ));
    let memory = Arc::new(MemoryController::new(
        MemoryConfig {
            low_threshold_percent: config.memory_threshold_percent,
            critical_threshold_percent: config.critical_memory_threshold_percent,
            auto_reclaim: config.enable_auto_optimization,
            ..Default::default()
        },
        control.clone(),
        bus.clone(),
    ));
    memory.attach(&observer);
    let mode = ModeController::new(
        ModeControllerConfig {
            cpu_cores: collectors::available_cores(Path::new("/proc")),
            ..Default::default()
        },
        scheduler.clone(),
        memory.clone(),
        observer.clone(),
        control.clone(),
        bus.clone(),
    );

    // First sample lands before any policy runs, so a startup mode switch
    // sees real processes.
    observer.sample_now();
    observer.start();
    scheduler.start(observer.clone());
    mode.start();
    mode.enable_auto_mode(config.enable_auto_mode);

    let target = startup_mode.or_else(|| {
        (config.default_mode != Mode::Balanced).then_some(config.default_mode)
    });
    if let Some(target) = target {
        match mode.switch_to(target).await {
            Ok(_) => info!("[main] startup mode {target} installed"),
            Err(e) if e.is_permission_denied() => {
                error!("[main] insufficient privilege to install {target}: {e}");
                return ExitCode::from(3);
            }
            Err(e) => {
                error!("[main] startup mode switch failed: {e}");
                return ExitCode::from(1);
            }
        }
    }

    info!("[main] tunixd running");
    if tokio::signal::ctrl_c().await.is_err() {
        error!("[main] cannot listen for shutdown signal");
        return ExitCode::from(1);
    }

    info!("[main] shutting down");
    mode.stop().await;
    scheduler.stop().await;
    observer.stop().await;
    mode.shutdown();
    ExitCode::SUCCESS
}
