use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        mpsc::{Receiver, Sender},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Instant,
};

use crate::{
    error::{BridgeError, Result},
    module::{LoadedModule, ModuleLoader, KEY_DOWN_EXPORT, RUN_PROGRAM_EXPORT},
    types::{Command, Response, WorkerStatus},
};

pub fn spawn_bridge_worker<L>(
    loader: L,
    status: Arc<Mutex<WorkerStatus>>,
    report_key_errors: bool,
) -> (Sender<Command>, Receiver<Response>, JoinHandle<()>)
where
    L: ModuleLoader + 'static,
{
    let (command_tx, command_rx) = std::sync::mpsc::channel();
    let (response_tx, response_rx) = std::sync::mpsc::channel();

    // Loaded modules are not Send, so the worker is built on its own thread.
    // WASIX instances need a tokio runtime entered for as long as they live.
    let handle = std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
        {
            Ok(val) => val,
            Err(err) => {
                tracing::error!(%err, "could not start worker runtime");
                if let Ok(mut current) = status.lock() {
                    *current = WorkerStatus::Faulted {
                        message: format!("could not start worker runtime: {err}"),
                    };
                }
                return;
            }
        };
        let _runtime_guard = runtime.enter();

        BridgeWorker::new(loader, response_tx, status, report_key_errors).run(command_rx)
    });

    (command_tx, response_rx, handle)
}

/// Owns the module handle. Commands are handled one at a time on the
/// worker thread, so calls into the module never overlap.
pub struct BridgeWorker<L> {
    loader: L,
    module: Option<Box<dyn LoadedModule>>,
    module_path: Option<String>,
    responses: Sender<Response>,
    status: Arc<Mutex<WorkerStatus>>,
    report_key_errors: bool,
}

impl<L: ModuleLoader> BridgeWorker<L> {
    pub fn new(
        loader: L,
        responses: Sender<Response>,
        status: Arc<Mutex<WorkerStatus>>,
        report_key_errors: bool,
    ) -> Self {
        BridgeWorker {
            loader,
            module: None,
            module_path: None,
            responses,
            status,
            report_key_errors,
        }
    }

    pub fn run(mut self, commands: Receiver<Command>) {
        tracing::info!("bridge worker started");
        while let Ok(command) = commands.recv() {
            self.handle(command);
        }
        tracing::info!("command channel closed, bridge worker stopping");
    }

    pub fn handle(&mut self, command: Command) {
        let name = command.name();
        let started = Instant::now();
        defer! {
            tracing::debug!(
                command = name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "command handled"
            )
        };

        match command {
            Command::Initialize { wasm_path } => self.initialize(wasm_path),
            Command::RunProgram => self.run_program(),
            Command::OnKeyDownMC { event } => self.on_key_down(&event),
        }
    }

    fn initialize(&mut self, wasm_path: String) {
        self.set_status(WorkerStatus::Loading {
            path: wasm_path.clone(),
        });

        match guard_panic("initialize", || self.loader.load(&wasm_path)) {
            Ok(module) => {
                if self.module.replace(module).is_some() {
                    tracing::info!(
                        previous = self.module_path.as_deref().unwrap_or_default(),
                        module = %wasm_path,
                        "replacing loaded module"
                    );
                }
                self.set_status(WorkerStatus::Ready {
                    path: wasm_path.clone(),
                });
                self.module_path = Some(wasm_path);
                self.respond(Response::Initialized);
            }
            Err(err) => {
                let message = err.to_string();
                tracing::error!(module = %wasm_path, %err, "could not load module");
                sentry::capture_message(&message, sentry::Level::Error);

                match &self.module_path {
                    Some(path) => self.set_status(WorkerStatus::Ready { path: path.clone() }),
                    None => self.set_status(WorkerStatus::Faulted {
                        message: message.clone(),
                    }),
                }
                self.respond(Response::Error { message });
            }
        }
    }

    fn run_program(&mut self) {
        let result = match self.module.as_mut() {
            Some(module) => guard_panic(RUN_PROGRAM_EXPORT, || module.try_run_program()),
            None => Err(BridgeError::ExportMissing(RUN_PROGRAM_EXPORT)),
        };

        match result {
            Ok(()) => self.respond(Response::Done),
            Err(err) => {
                if matches!(err, BridgeError::Panicked { .. }) {
                    self.discard_module(&err);
                }
                tracing::error!(command = RUN_PROGRAM_EXPORT, %err, "could not run program");
                self.respond(Response::Error {
                    message: err.to_string(),
                });
            }
        }
    }

    fn on_key_down(&mut self, event: &serde_json::Value) {
        let result = match self.module.as_mut() {
            Some(module) => guard_panic(KEY_DOWN_EXPORT, || module.try_on_key_down(event)),
            None => Err(BridgeError::ExportMissing(KEY_DOWN_EXPORT)),
        };

        if let Err(err) = result {
            if matches!(err, BridgeError::Panicked { .. }) {
                self.discard_module(&err);
            }
            tracing::error!(command = KEY_DOWN_EXPORT, %err, "could not forward key event");
            if self.report_key_errors {
                self.respond(Response::Error {
                    message: err.to_string(),
                });
            }
        }
    }

    // A module that panicked mid-call is in an unknown state.
    fn discard_module(&mut self, err: &BridgeError) {
        let message = err.to_string();
        tracing::error!(
            module = self.module_path.as_deref().unwrap_or_default(),
            %err,
            "discarding module after panic"
        );
        sentry::capture_message(&message, sentry::Level::Error);

        self.module = None;
        self.module_path = None;
        self.set_status(WorkerStatus::Faulted { message });
    }

    fn respond(&self, response: Response) {
        if self.responses.send(response).is_err() {
            tracing::warn!("response channel closed, dropping response");
        }
    }

    fn set_status(&self, status: WorkerStatus) {
        if let Ok(mut current) = self.status.lock() {
            *current = status;
        }
    }
}

fn guard_panic<T>(stage: &'static str, call: impl FnOnce() -> Result<T>) -> Result<T> {
    match std::panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(payload) => Err(BridgeError::Panicked {
            stage,
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
