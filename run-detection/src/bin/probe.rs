//! Liveness probe for orchestrators that exec a command instead of calling HTTP.
//!
//! Exits 0 when the worker's heartbeat is fresh and, if configured, the sample
//! data file is readable. Exits 1 otherwise.
use std::path::Path;
use std::process::ExitCode;

use envconfig::Envconfig;
use health::heartbeat_is_fresh;
use run_detection::config::ProbeConfig;

fn main() -> ExitCode {
    let config = match ProbeConfig::init_from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid probe configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if !heartbeat_is_fresh(Path::new(&config.heartbeat_path), config.probe_max_age.0) {
        eprintln!("heartbeat at {} is missing or stale", config.heartbeat_path);
        return ExitCode::FAILURE;
    }

    if let Some(sample) = &config.probe_sample_file {
        if let Err(e) = std::fs::File::open(sample) {
            eprintln!("sample file {sample} is not readable: {e}");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
