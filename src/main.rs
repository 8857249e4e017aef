use std::sync::{Arc, Mutex};

use clap::{CommandFactory, Parser};
use tracing::{error, trace};

use ws_loadtest::config::{CliArgs, Config};
use ws_loadtest::controller::WorkController;
use ws_loadtest::logging::{init_tracing, LogFormat};
use ws_loadtest::metrics::{gather_metrics_string, register_metrics, start_metrics_server};
use ws_loadtest::utils::normalize_long_flags;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = match CliArgs::try_parse_from(normalize_long_flags(std::env::args_os())) {
        Ok(args) => args,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    init_tracing(args.verbose, LogFormat::from_env())?;

    let config = match Config::from_args(args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}\n", e);
            eprintln!("{}", CliArgs::command().render_usage());
            std::process::exit(1);
        }
    };

    register_metrics()?;
    let registry_arc = Arc::new(Mutex::new(prometheus::default_registry().clone()));

    if let Some(port) = config.metrics_port {
        let registry = registry_arc.clone();
        tokio::spawn(async move {
            start_metrics_server(port, registry).await;
        });
    }

    let test_duration = config.test_duration;
    let controller = match WorkController::new(config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to set up the run");
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    controller.stop_after(test_duration);
    controller.stop_on_interrupt();

    controller.start().await;
    controller.print_report().await;

    trace!(metrics = %gather_metrics_string(&registry_arc), "Final metrics");
    Ok(())
}
