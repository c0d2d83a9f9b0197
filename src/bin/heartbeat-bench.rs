use clap::Parser;
use heartbeat::MonitorOptions;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Debug, Parser)]
#[clap(name = "heartbeat-bench")]
struct CommandLineArguments {
    #[clap()]
    n_threads: u32,
    #[clap()]
    n_events: u64,
    #[clap(long, default_value_t = 20)]
    window: usize,
    #[clap(long, default_value_t = 1024)]
    depth: usize,
    /// Text log to write records to
    #[clap(long)]
    log: Option<PathBuf>,
    /// Discovery directory [default: $HEARTBEAT_ENABLED_DIR, else the temp dir]
    #[clap(long)]
    enabled_dir: Option<PathBuf>,
    /// Pause between events on each thread, e.g. "1ms"
    #[clap(long, value_parser = humantime::parse_duration)]
    pause: Option<Duration>,
}

fn main() -> anyhow::Result<()> {
    heartbeat::logging::init_logging(None)?;
    let opt = CommandLineArguments::parse();

    let enabled_dir = opt
        .enabled_dir
        .clone()
        .or_else(|| heartbeat::discovery::resolve_enabled_dir(None))
        .unwrap_or_else(std::env::temp_dir);
    let mut options = MonitorOptions::new(opt.window, opt.depth).enabled_dir(enabled_dir);
    if let Some(log) = opt.log.as_ref() {
        options = options.log_path(log);
    }
    let monitor = options.init()?;
    println!("monitor id = {}", monitor.id());

    let start = Instant::now();
    std::thread::scope(|scope| -> anyhow::Result<()> {
        let handles = (0..opt.n_threads)
            .map(|t| {
                let monitor = &monitor;
                scope.spawn(move || -> heartbeat::Result<()> {
                    for _ in 0..opt.n_events {
                        monitor.record_event(t as i32)?;
                        if let Some(p) = opt.pause {
                            std::thread::sleep(p);
                        }
                    }
                    Ok(())
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().map_err(|_| anyhow::anyhow!("bench thread panicked"))??;
        }
        Ok(())
    })?;
    let elapsed = start.elapsed();

    let total = monitor.state().counter();
    println!(
        "{} events in {} ({:.0} calls/s)",
        total,
        humantime::format_duration(elapsed),
        total as f64 / elapsed.as_secs_f64()
    );
    println!(
        "global = {:.3}/s window = {:.3}/s instant = {:.3}/s flushes = {}",
        monitor.global_rate(),
        monitor.window_rate(),
        monitor.instant_rate(),
        monitor.flushes()
    );
    monitor.finish();
    heartbeat::logging::flush_logging()?;
    Ok(())
}
