use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nodelink::broker::Broker;
use nodelink::config::AppConfig;
use nodelink::events::{
    EventEmitter, CLIENT_DISCONNECTED_EVENT, CLIENT_REGISTERED_EVENT, NODE_DISCONNECTED_EVENT,
    NODE_REGISTERED_EVENT,
};
use nodelink::logging::{LogLevel, Logger, LoggerConfig};
use nodelink::shutdown::ShutdownHooks;
use nodelink::side_store::SideStores;
use nodelink::storage::StorageFacade;
use nodelink::transport::TcpTransport;
use serde_json::json;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const LISTENER_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

fn main() {
    print_startup_banner();

    let app_config = load_config_or_exit();
    let logger_config = LoggerConfig::from_app_config(&app_config.logging).unwrap_or_else(|| {
        eprintln!(
            "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
            app_config.logging.level
        );
        process::exit(2);
    });
    let logger = Arc::new(Logger::new(logger_config));

    let storage = StorageFacade::initialize(&app_config, &logger).unwrap_or_else(|error| {
        eprintln!("storage initialization error: {error}");
        process::exit(2);
    });
    let storage = Arc::new(storage);

    let side_stores = SideStores::from_config(&app_config.side_store).unwrap_or_else(|error| {
        eprintln!("side store configuration error: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::side_store"),
        "Side stores configured",
        Some(json!({ "schemes": side_stores.schemes() })),
    );

    let emitter = Arc::new(EventEmitter::new());
    register_notification_listeners(&emitter, &logger);

    let broker = Broker::new(
        Arc::clone(&storage),
        side_stores,
        Arc::clone(&emitter),
        Arc::clone(&logger),
    );

    let tcp = TcpTransport::from_app_config(&app_config, Arc::clone(&logger)).unwrap_or_else(|error| {
        eprintln!("transport startup error: {error}");
        process::exit(2);
    });
    let tcp = Arc::new(tcp);
    let bound_addr = tcp.local_addr().unwrap_or_else(|error| {
        eprintln!("transport startup error: failed to read local address: {error}");
        process::exit(2);
    });
    broker.attach_adapter(tcp.clone());
    logger.log(
        LogLevel::Info,
        Some("main::transport"),
        &format!(
            "{} v{} listening",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": bound_addr.to_string(),
            "protocol": app_config.server.protocol_id,
            "needs_queue": app_config.server.needs_queue,
            "max_envelope_size_bytes": app_config.wire.max_envelope_size_bytes,
        })),
    );

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    while !shutdown_hooks.is_triggered() {
        match tcp.poll_accept() {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(error) => {
                logger.log(
                    LogLevel::Error,
                    Some("main::transport"),
                    "Accept failed; shutting down",
                    Some(json!({ "error": error.to_string() })),
                );
                shutdown_hooks.trigger();
            }
        }
        thread::sleep(ACCEPT_POLL_INTERVAL);
    }

    logger.info(
        Some("main::shutdown"),
        "Shutdown signal received, starting graceful shutdown",
    );
    emitter.begin_shutdown();
    broker.detach_adapters();
    if let Err(error) = storage.flush() {
        logger.log(
            LogLevel::Error,
            Some("main::shutdown"),
            "Storage flush failed",
            Some(json!({ "error": error.to_string() })),
        );
    }

    if emitter.wait_for_idle(LISTENER_DRAIN_TIMEOUT) {
        logger.info(
            Some("main::shutdown"),
            "All running listeners completed before timeout",
        );
    } else {
        logger.warn(
            Some("main::shutdown"),
            "Listener drain timeout reached; continuing shutdown",
        );
    }
    logger.info(Some("main::shutdown"), "Shutdown completed");
}

fn load_config_or_exit() -> AppConfig {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

/// Lifecycle notifications are observed off the request path.
fn register_notification_listeners(emitter: &EventEmitter, logger: &Arc<Logger>) {
    for event_name in [
        NODE_REGISTERED_EVENT,
        CLIENT_REGISTERED_EVENT,
        NODE_DISCONNECTED_EVENT,
        CLIENT_DISCONNECTED_EVENT,
    ] {
        let logger = Arc::clone(logger);
        emitter.on_async(event_name, move |event| {
            logger.log(
                LogLevel::Verbose,
                Some("main::events"),
                &format!("Observed {}", event.name),
                event.payload,
            );
            Ok(())
        });
    }
}

fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;66m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
                 _      _ _       _
  _ __   ___   __| | ___| (_)_ __ | | __
 | '_ \ / _ \ / _` |/ _ \ | | '_ \| |/ /
 | | | | (_) | (_| |  __/ | | | | |   <
 |_| |_|\___/ \__,_|\___|_|_|_| |_|_|\_\
"#;
    const APP_DESCRIPTION: &str =
        "Directory and relay broker for decentralized-store nodes and their clients.";
    const LIABILITY_NOTICE: &str =
        "MIT License disclaimer: software is provided \"AS IS\", without warranty or liability.";

    println!("{BANNER_COLOR}");
    println!("{BANNER}{RESET}");
    println!(
        "{} v{} | build {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("NODELINK_BUILD_DATE_UTC")
    );
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}{LIABILITY_NOTICE}{RESET}");
    println!();
    println!("================================================================");
    println!();
}
