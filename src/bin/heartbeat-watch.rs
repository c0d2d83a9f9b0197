use clap::Parser;
use heartbeat::{BeatRecord, ShmAttachment};
use std::time::Duration;

#[derive(Debug, Parser)]
#[clap(name = "heartbeat-watch", about = "Follow a running heartbeat monitor through shared memory")]
struct CommandLineArguments {
    /// Identifier of the monitor (normally the pid of the process being watched)
    #[clap()]
    id: u32,

    /// How often to poll, e.g. "250ms" or "2s"
    #[clap(long, default_value = "1s", value_parser = humantime::parse_duration)]
    interval: Duration,

    /// Stop after printing this many records
    #[clap(long)]
    count: Option<u64>,

    /// Print each record as a JSON object instead of a table row
    #[clap(long)]
    json: bool,
}

fn print_record(r: &BeatRecord, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(r)?);
    } else {
        println!(
            "{}\t{}\t{}\t{:.6}\t{:.6}\t{:.6}",
            r.beat, r.tag, r.timestamp, r.global_rate, r.window_rate, r.instant_rate
        );
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    heartbeat::logging::init_logging(None)?;
    let opt = CommandLineArguments::parse();

    let marker_dir = heartbeat::discovery::resolve_enabled_dir(None);
    if let Some(dir) = marker_dir.as_ref() {
        if !dir.join(opt.id.to_string()).exists() {
            tracing::warn!("No marker file for {} in {}", opt.id, dir.display());
        }
    }

    let attachment = ShmAttachment::attach(opt.id)?;
    tracing::info!(
        "Attached to monitor {} (window {}, depth {}, targets {}..{})",
        opt.id,
        attachment.state().window_size(),
        attachment.depth(),
        attachment.state().min_target_rate(),
        attachment.state().max_target_rate()
    );

    let mut last_counter = 0;
    let mut printed = 0;
    loop {
        let records = attachment.records_since(last_counter);
        if let Some(newest) = records.last() {
            last_counter = newest.beat + 1;
        }
        for r in records {
            print_record(&r, opt.json)?;
            printed += 1;
            if opt.count.map(|c| printed >= c).unwrap_or(false) {
                break;
            }
        }
        if opt.count.map(|c| printed >= c).unwrap_or(false) {
            break;
        }
        // the monitor is gone once its marker file is
        if let Some(dir) = marker_dir.as_ref() {
            if !dir.join(opt.id.to_string()).exists() {
                tracing::info!("Monitor {} finished", opt.id);
                break;
            }
        }
        std::thread::sleep(opt.interval);
    }
    heartbeat::logging::flush_logging()?;
    Ok(())
}
