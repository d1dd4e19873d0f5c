use clap::Parser;
use serde::Serialize;

#[derive(Parser, Debug, Serialize, Clone)]
#[command(about = "Drives a CondBarrier from many threads and reports metrics")]
pub struct BenchmarkCli {
    /// Number of producer jobs per round; each joins one named barrier
    #[arg(long, default_value_t = 1024)]
    pub producers: usize,

    /// Number of distinct barrier names the producers spread over
    #[arg(long, default_value_t = 16)]
    pub names: usize,

    /// Number of waiter threads per round
    #[arg(long, default_value_t = 32)]
    pub waiters: usize,

    /// Threads in the producer pool
    #[arg(long, default_value_t = 8)]
    pub threads: usize,

    #[arg(long, default_value_t = 10)]
    pub rounds: usize,

    /// Simulated work per producer, in microseconds
    #[arg(long, default_value_t = 50)]
    pub work_us: u64,

    /// Cancel the manager this many milliseconds into each round (0 = never)
    #[arg(long, default_value_t = 0)]
    pub cancel_after_ms: u64,

    /// Upper bound for a single waiter, in milliseconds
    #[arg(long, default_value_t = 30_000)]
    pub wait_timeout_ms: u64,

    /// Output filename for metrics, stdout when empty
    #[arg(long, default_value = "")]
    pub output: String,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl BenchmarkCli {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.names == 0 {
            anyhow::bail!("--names must be at least 1");
        }
        if self.producers < self.names {
            anyhow::bail!(
                "--producers ({}) must cover every name (--names {})",
                self.producers,
                self.names
            );
        }
        if self.threads == 0 {
            anyhow::bail!("--threads must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let args = BenchmarkCli::parse_from(["condbarrier-bench"]);
        assert!(args.validate().is_ok());
        assert_eq!(args.cancel_after_ms, 0);
    }

    #[test]
    fn test_rejects_uncovered_names() {
        let args =
            BenchmarkCli::parse_from(["condbarrier-bench", "--producers", "4", "--names", "8"]);
        assert!(args.validate().is_err());
    }
}
