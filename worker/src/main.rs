//! deployd - Entry Point
//!
//! Queue-driven deployment worker: consumes deployment jobs from the broker and
//! runs each application's SSH and HTTP tasks in priority order.

use std::collections::HashMap;
use std::env;

use deployd::app::options::AppOptions;
use deployd::app::run::run;
use deployd::commands::{add_app::add_app, enqueue::enqueue, fingerprint::fingerprint};
use deployd::logs::{init_logging, LogOptions};
use deployd::storage::layout::StorageLayout;
use deployd::storage::settings::Settings;
use deployd::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to serialize version info: {}", e),
        }
        return;
    }

    let layout = match cli_args.get("home") {
        Some(home) => StorageLayout::new(home),
        None => StorageLayout::default(),
    };

    // Retrieve the settings file, defaults when absent
    let settings_file = layout.settings_file();
    let mut settings = if settings_file.exists().await {
        match settings_file.read_json::<Settings>().await {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Unable to read settings file: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Settings::default()
    };
    settings.apply_env_overrides();

    // Operator commands log to stdout only
    if cli_args.contains_key("fingerprint") {
        let _ = init_logging(LogOptions {
            log_level: settings.log_level.clone(),
            ..Default::default()
        });
        return fingerprint(&cli_args).await;
    }
    if cli_args.contains_key("enqueue") {
        let _ = init_logging(LogOptions {
            log_level: settings.log_level.clone(),
            ..Default::default()
        });
        let options = AppOptions::from_settings(layout, &settings);
        return enqueue(&cli_args, options.mqtt).await;
    }
    if cli_args.contains_key("add-app") {
        let _ = init_logging(LogOptions {
            log_level: settings.log_level.clone(),
            ..Default::default()
        });
        return add_app(&cli_args, &layout).await;
    }

    // Run the worker starting here

    // Initialize logging; the guard flushes file logs on exit
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: settings
            .log_to_file
            .then(|| layout.logs_dir().path().to_path_buf()),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    let options = AppOptions::from_settings(layout, &settings);

    info!(
        "Running deployd {} ({}) consuming '{}'",
        version.version, version.git_hash, options.consumer.queue
    );
    if let Err(e) = run(options, await_shutdown_signal()).await {
        error!("Failed to run the worker: {e}");
        std::process::exit(1);
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Failed to install signal handlers, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}
