#[macro_use]
extern crate log;
extern crate ctrlc;
extern crate simplelog;
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};

use envoyd::config::{Config as EnvoydConfig, DEFAULT_CONFIG_FILE};
use envoyd::device::{EnvoyDevice, LogListener};
use envoyd::envoy::EnvoyClient;
use std::env;
use std::fs::OpenOptions;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Console logger plus, when configured, a file logger. An unusable log file
/// is reported back instead of aborting.
fn build_loggers(log_path: Option<&str>) -> (Vec<Box<dyn SharedLogger>>, Option<String>) {
    let conf = ConfigBuilder::new().set_time_format_rfc3339().build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        LevelFilter::Debug,
        conf.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];

    let mut logfile_error: Option<String> = None;
    if let Some(log_path) = log_path {
        let logfile = OpenOptions::new().create(true).append(true).open(log_path);
        match logfile {
            Ok(logfile) => {
                loggers.push(WriteLogger::new(LevelFilter::Info, conf, logfile));
            }
            Err(e) => {
                logfile_error = Some(format!(
                    "Error creating/opening log file: {:?}: {:?}",
                    log_path, e
                ));
            }
        }
    }
    (loggers, logfile_error)
}

fn logging_init(log_path: Option<&str>) {
    let (loggers, logfile_error) = build_loggers(log_path);
    CombinedLogger::init(loggers).expect("Cannot initialize logging subsystem");
    if let Some(e) = logfile_error {
        error!("{}", e);
        warn!("Will do console logging only...");
    }
}

fn main() {
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
    let config = match EnvoydConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            logging_init(None);
            error!("{}", e);
            std::process::exit(1);
        }
    };

    logging_init(config.log.as_deref());
    info!("Welcome to envoyd (Enphase Envoy monitoring daemon)");
    info!(
        "Using config file: {:?}, watermark storage: {:?}",
        config_path, config.storage_path
    );

    //Ctrl-C / SIGTERM support
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    //common thread stuff
    let mut threads = vec![];
    let cancel_flag = Arc::new(AtomicBool::new(false));

    //one thread with its own runtime per gateway
    for device_config in config.devices {
        let client = match EnvoyClient::new(&device_config) {
            Ok(client) => client,
            Err(e) => {
                error!("{}: cannot create http client: {}", device_config.name, e);
                continue;
            }
        };
        let thread_name = device_config.name.clone();
        let mut device = EnvoyDevice::new(device_config, client, &config.storage_path);
        device.add_listener(Box::new(LogListener));
        for service in device.services() {
            let metrics: Vec<&str> = service
                .kinds()
                .into_iter()
                .map(|kind| kind.descriptor().name)
                .collect();
            info!(
                "{}: service <b>{}</>: {}",
                device.name,
                service.display_name,
                metrics.join(", ")
            );
        }

        let worker_cancel_flag = cancel_flag.clone();
        let thread_builder = thread::Builder::new().name(thread_name); //thread name
        let thread_handler = thread_builder
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("{}: cannot create tokio runtime: {}", device.name, e);
                        return;
                    }
                };
                rt.block_on(device.worker(worker_cancel_flag));
            })
            .unwrap();
        threads.push(thread_handler);
    }

    if threads.is_empty() {
        error!("No device could be started, exiting");
        std::process::exit(1);
    }

    debug!("Entering main loop...");
    loop {
        if !running.load(Ordering::SeqCst) {
            info!("Ctrl-C or SIGTERM signal detected, exiting...");
            break;
        }

        thread::sleep(Duration::from_millis(50));
    }

    info!("Stopping all threads...");
    //inform all threads about termination
    cancel_flag.store(true, Ordering::SeqCst);
    //wait for termination
    for t in threads {
        let _ = t.join();
    }
    info!("Done, exiting");
}
