pub mod cli;
pub mod utils;
pub mod workload;
