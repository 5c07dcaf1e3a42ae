mod api;
mod config;
mod error;
mod module;
mod threads;
mod types;

use std::sync::{Arc, Mutex};

use config::Config;
use error::BridgeError;
use indicatif::ProgressBar;
use module::WasmerLoader;
use threads::Outbox;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use types::{Command, WorkerStatus};

#[macro_use]
extern crate defer;

fn main() {
    init_tracing();

    if let Err(err) = run() {
        tracing::error!(%err, "wasm bridge stopped");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn run() -> Result<(), BridgeError> {
    let bar = ProgressBar::new_spinner();
    bar.set_message("Reading configuration");
    let config = Config::from_env()?;

    let _sentry = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    bar.set_message("Starting bridge worker");
    let status = Arc::new(Mutex::new(WorkerStatus::Idle));
    let loader = WasmerLoader::new(config.modules_path.clone());
    let (commands, responses, _worker) =
        threads::spawn_bridge_worker(loader, status.clone(), config.report_key_errors);

    let outbox = Outbox::default();
    threads::spawn_response_relay(responses, outbox.clone(), config.outbox_capacity);

    if let Some(module) = &config.startup_module {
        bar.set_message(format!("Queueing {module} for initialization"));
        commands
            .send(Command::Initialize {
                wasm_path: module.clone(),
            })
            .map_err(|_| BridgeError::WorkerGone)?;
    }

    bar.finish_with_message("Bridge worker running");

    api::create_server(
        config.listen_addr,
        api::AppState {
            commands,
            outbox,
            status,
        },
    )?;

    Ok(())
}
