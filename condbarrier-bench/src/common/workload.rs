use super::cli::BenchmarkCli;
use condbarrier::{CondBarrier, Config, Context};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use threadpool::ThreadPool;

const SC: Ordering = Ordering::SeqCst;

#[derive(Serialize, Debug, Default, Clone)]
pub struct RoundReport {
    pub round: usize,
    pub elapsed_ms: f64,
    pub waits_ok: usize,
    pub waits_failed: usize,
    pub cancelled: bool,
}

pub fn barrier_name(idx: usize) -> String {
    format!("name_{}", idx)
}

/// Which names waiter `w` asks for in round `round`. An empty list means
/// "everything".
fn waiter_names(w: usize, round: usize, names: usize) -> Vec<String> {
    match w % 4 {
        0 => Vec::new(),
        1 => vec![barrier_name((w + round) % names)],
        _ => (0..3)
            .map(|k| barrier_name((w * 7 + round + k) % names))
            .collect(),
    }
}

/// Runs one round: every name is held open, waiter threads start, then every
/// producer job joins its barrier, works, and calls `done`. Returns once
/// every waiter has returned and the pool is idle.
pub fn run_round(args: &BenchmarkCli, round: usize, pool: &ThreadPool) -> RoundReport {
    let cb = CondBarrier::with_config(Config::new(&format!("round-{}", round)));
    let ok = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    // join every name up front so wait_all cannot slip through before the
    // producers are scheduled
    let holds: Vec<_> = (0..args.names)
        .map(|i| cb.create_barrier(&barrier_name(i)))
        .collect();

    let waiters: Vec<_> = (0..args.waiters)
        .map(|w| {
            let cb = cb.clone();
            let ok = ok.clone();
            let failed = failed.clone();
            let names = waiter_names(w, round, args.names);
            let timeout = Duration::from_millis(args.wait_timeout_ms);
            thread::spawn(move || {
                let (ctx, _) = Context::with_timeout(&Context::background(), timeout);
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                match cb.wait_context(&ctx, &names) {
                    Ok(()) => ok.fetch_add(1, SC),
                    Err(err) => {
                        warn!("waiter {} on {:?}: {}", w, names, err);
                        failed.fetch_add(1, SC)
                    }
                };
            })
        })
        .collect();

    let work = Duration::from_micros(args.work_us);
    for p in 0..args.producers {
        let cb = cb.clone();
        let name = barrier_name(p % args.names);
        pool.execute(move || {
            let barrier = cb.create_barrier(&name);
            if !work.is_zero() {
                thread::sleep(work);
            }
            barrier.done();
        });
    }
    for hold in holds {
        hold.done();
    }

    let canceller = (args.cancel_after_ms > 0).then(|| {
        let cb = cb.clone();
        let after = Duration::from_millis(args.cancel_after_ms);
        thread::spawn(move || {
            thread::sleep(after);
            debug!("cancelling {}", cb.label());
            cb.cancel();
        })
    });

    for w in waiters {
        if w.join().is_err() {
            failed.fetch_add(1, SC);
        }
    }
    let elapsed = start.elapsed();
    pool.join();
    if let Some(c) = canceller {
        let _ = c.join();
    }

    let report = RoundReport {
        round,
        elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        waits_ok: ok.load(SC),
        waits_failed: failed.load(SC),
        cancelled: cb.is_cancelled(),
    };
    metrics::histogram!("cond_barrier_bench.round_ms").record(report.elapsed_ms);
    info!(
        "round {} took {:.2}ms ok={} failed={} cancelled={}",
        round, report.elapsed_ms, report.waits_ok, report.waits_failed, report.cancelled
    );
    report
}

/// Fails if any waiter in any round gave up before its barriers completed.
pub fn check_reports(reports: &[RoundReport]) -> anyhow::Result<()> {
    if let Some(r) = reports.iter().find(|r| r.waits_failed > 0) {
        anyhow::bail!("round {} had {} failed waits", r.round, r.waits_failed);
    }
    Ok(())
}
