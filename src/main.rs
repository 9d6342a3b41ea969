use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use flexi_logger::{FileSpec, Logger, LoggerHandle};
use log::{error, info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use dmreval::{cinfo, param, run};

fn start_logger(param: &param::Param) -> Result<LoggerHandle, flexi_logger::FlexiLoggerError> {
    let logger = Logger::try_with_str(&param.general.log_level)?;
    if param.general.log_base.is_empty() {
        logger.start()
    } else {
        logger
            .log_to_file(
                FileSpec::default()
                    .basename(&param.general.log_base)
                    .suffix(&param.general.log_suffix),
            )
            .start()
    }
}

fn main() {
    let param_path = std::env::args().nth(1).unwrap_or_else(|| "param.yaml".to_string());

    let param = match param::get(param_path.clone()) {
        Ok(param) => param,
        Err(e) => {
            eprintln!("Cannot load parameters from {}: {}", param_path, e);
            std::process::exit(1);
        }
    };

    let _logger = match start_logger(&param) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Cannot start logger: {}", e);
            std::process::exit(1);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    match Signals::new([SIGINT, SIGTERM]) {
        Ok(mut signals) => {
            let flag = Arc::clone(&running);
            thread::spawn(move || {
                for signal in signals.forever() {
                    warn!("Signal {} received, stopping after the current clusters...", signal);
                    flag.store(false, Ordering::Relaxed);
                }
            });
        }
        Err(e) => warn!("Signal handlers not installed: {}", e),
    }

    info!("dmreval {} with parameters {}", dmreval::version(), param_path);

    let outcome = run(&param, running).and_then(|report| {
        cinfo!(param.general.display_colorful, "{}", report.display(param.general.display_colorful));
        report.write_tables()?;
        if !param.general.save_report.is_empty() {
            report.save(&param.general.save_report)?;
        }
        Ok(())
    });

    if let Err(e) = outcome {
        error!("{}", e);
        std::process::exit(1);
    }
}
