// Stress benchmark for CondBarrier.
// Each round:
// - holds every name open, then starts `--waiters` threads that wait on one
//   name, three names, or everything
// - runs `--producers` jobs on a thread pool, each joining a named barrier,
//   sleeping `--work-us`, and calling done
// - optionally cancels the manager `--cancel-after-ms` into the round
// Counters and histograms recorded by the library are dumped as JSON.
use clap::Parser;
use condbarrier_bench::common::{cli, utils, workload};
use log::info;
use serde_json::json;
use std::time::Instant;
use threadpool::ThreadPool;

fn main() -> anyhow::Result<()> {
    let args = cli::BenchmarkCli::parse();
    utils::init_logging(&args.log_level);
    args.validate()?;
    let recorder = utils::MetricsRecorder::install()?;

    info!(
        "producers={} names={} waiters={} threads={} rounds={}",
        args.producers, args.names, args.waiters, args.threads, args.rounds
    );
    let pool = ThreadPool::new(args.threads);
    let start = Instant::now();
    let reports: Vec<_> = (0..args.rounds)
        .map(|round| workload::run_round(&args, round, &pool))
        .collect();
    let duration = start.elapsed();
    metrics::gauge!("cond_barrier_bench.duration_s").set(duration.as_secs_f64());

    let created = recorder.total("cond_barrier.created");
    let joined = recorder.total("cond_barrier.joined");
    info!(
        "{} rounds in {:.1?}: created={} joined={} completed={} reopened={}",
        args.rounds,
        duration,
        created,
        joined,
        recorder.total("cond_barrier.completed"),
        recorder.total("cond_barrier.reopened"),
    );

    if !args.output.is_empty() {
        recorder.dump(&args.output)?;
        info!("metrics written to {}", args.output);
    } else {
        let summary = json!({
            "args": args,
            "rounds": reports,
            "metrics": recorder.snapshot(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    workload::check_reports(&reports)
}
