use std::path::{Path, PathBuf};

use wasmer::{Instance, Memory, Module, Store, TypedFunction, WasmTypeList};
use wasmer_wasix::{WasiEnv, WasiError, WasiFunctionEnv};

use super::{fetch_module, LoadedModule, ModuleLoader, KEY_DOWN_EXPORT, RUN_PROGRAM_EXPORT};
use crate::error::{BridgeError, Result};

const ALLOC_EXPORT: &str = "bridge_alloc";
const FREE_EXPORT: &str = "bridge_free";
const MEMORY_EXPORT: &str = "memory";

pub struct WasmerLoader {
    modules_path: Option<PathBuf>,
}

impl WasmerLoader {
    pub fn new(modules_path: Option<PathBuf>) -> Self {
        WasmerLoader { modules_path }
    }
}

impl ModuleLoader for WasmerLoader {
    fn load(&self, wasm_path: &str) -> Result<Box<dyn LoadedModule>> {
        let bytes = fetch_module(wasm_path, self.modules_path.as_deref())?;
        let module = WasmModule::start(wasm_path, &bytes)?;
        Ok(Box::new(module))
    }
}

// The event goes in as JSON written to a guest buffer from `bridge_alloc`.
struct KeyHandler {
    call: TypedFunction<(i32, i32), ()>,
    alloc: TypedFunction<i32, i32>,
    free: Option<TypedFunction<(i32, i32), ()>>,
    memory: Memory,
}

pub struct WasmModule {
    store: Store,
    instance: Instance,
    _wasi_env: WasiFunctionEnv,
    run_program: Option<TypedFunction<(), ()>>,
    key_handler: Option<KeyHandler>,
}

impl WasmModule {
    pub fn start(wasm_path: &str, bytes: &[u8]) -> Result<Self> {
        let mut store = Store::default();
        let module = Module::new(&store, bytes).map_err(|err| BridgeError::Compile {
            path: wasm_path.to_string(),
            message: err.to_string(),
        })?;

        let (instance, wasi_env) = WasiEnv::builder(module_name(wasm_path))
            .engine(store.engine().clone())
            .instantiate(module, &mut store)
            .map_err(|err| BridgeError::Instantiate {
                path: wasm_path.to_string(),
                message: err.to_string(),
            })?;

        start_runtime(&mut store, &instance).map_err(|message| BridgeError::Start {
            path: wasm_path.to_string(),
            message,
        })?;

        let run_program = bind::<(), ()>(&store, &instance, RUN_PROGRAM_EXPORT);
        let key_handler = bind_key_handler(&store, &instance);

        tracing::info!(
            module = wasm_path,
            run_program = run_program.is_some(),
            on_key_down = key_handler.is_some(),
            "module started"
        );

        Ok(WasmModule {
            store,
            instance,
            _wasi_env: wasi_env,
            run_program,
            key_handler,
        })
    }
}

impl LoadedModule for WasmModule {
    fn try_run_program(&mut self) -> Result<()> {
        let run_program = self
            .run_program
            .as_ref()
            .ok_or(BridgeError::ExportMissing(RUN_PROGRAM_EXPORT))?;

        run_program
            .call(&mut self.store)
            .map_err(|err| BridgeError::Call {
                export: RUN_PROGRAM_EXPORT,
                message: err.to_string(),
            })
    }

    fn try_on_key_down(&mut self, event: &serde_json::Value) -> Result<()> {
        let handler = self
            .key_handler
            .as_ref()
            .ok_or(BridgeError::ExportMissing(KEY_DOWN_EXPORT))?;

        let payload = serde_json::to_vec(event)?;
        let len = i32::try_from(payload.len()).map_err(|_| {
            BridgeError::Memory(format!("event of {} bytes does not fit", payload.len()))
        })?;

        let ptr = handler
            .alloc
            .call(&mut self.store, len)
            .map_err(|err| BridgeError::Call {
                export: ALLOC_EXPORT,
                message: err.to_string(),
            })?;

        let result = match handler
            .memory
            .view(&self.store)
            .write(ptr as u32 as u64, &payload)
        {
            Ok(()) => handler
                .call
                .call(&mut self.store, ptr, len)
                .map_err(|err| BridgeError::Call {
                    export: KEY_DOWN_EXPORT,
                    message: err.to_string(),
                }),
            Err(err) => Err(BridgeError::Memory(err.to_string())),
        };

        if let Some(free) = &handler.free {
            if let Err(err) = free.call(&mut self.store, ptr, len) {
                tracing::warn!(%err, "could not release event buffer");
            }
        }

        result
    }
}

fn module_name(wasm_path: &str) -> String {
    Path::new(wasm_path)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("module")
        .to_string()
}

/// Reactors expose `_initialize`, commands expose `_start`. A command that
/// returns through `proc_exit(0)` has started cleanly.
///
/// Runs on the worker thread with no timeout: a `_start` that never returns
/// (a main that parks forever) blocks the worker for good.
fn start_runtime(store: &mut Store, instance: &Instance) -> std::result::Result<(), String> {
    for entry in ["_initialize", "_start"] {
        let Ok(func) = instance.exports.get_typed_function::<(), ()>(&*store, entry) else {
            continue;
        };

        tracing::debug!(entry, "calling runtime entry point");
        return match func.call(&mut *store) {
            Ok(()) => Ok(()),
            Err(err) => match err.downcast::<WasiError>() {
                Ok(WasiError::Exit(code)) if code.is_success() => Ok(()),
                Ok(wasi_err) => Err(wasi_err.to_string()),
                Err(err) => Err(err.to_string()),
            },
        };
    }
    Ok(())
}

fn bind<Args, Rets>(
    store: &Store,
    instance: &Instance,
    name: &str,
) -> Option<TypedFunction<Args, Rets>>
where
    Args: WasmTypeList,
    Rets: WasmTypeList,
{
    let func = instance.exports.get_function(name).ok()?;
    match func.typed::<Args, Rets>(store) {
        Ok(typed) => Some(typed),
        Err(err) => {
            tracing::warn!(export = name, %err, "export has an unexpected signature, ignoring it");
            None
        }
    }
}

fn bind_key_handler(store: &Store, instance: &Instance) -> Option<KeyHandler> {
    let call = bind::<(i32, i32), ()>(store, instance, KEY_DOWN_EXPORT)?;

    let Some(alloc) = bind::<i32, i32>(store, instance, ALLOC_EXPORT) else {
        tracing::warn!(
            export = KEY_DOWN_EXPORT,
            "module exports {KEY_DOWN_EXPORT} without {ALLOC_EXPORT}, ignoring it"
        );
        return None;
    };

    let memory = match instance.exports.get_memory(MEMORY_EXPORT) {
        Ok(memory) => memory.clone(),
        Err(err) => {
            tracing::warn!(export = KEY_DOWN_EXPORT, %err, "module exports no memory, ignoring it");
            return None;
        }
    };

    Some(KeyHandler {
        call,
        alloc,
        free: bind::<(i32, i32), ()>(store, instance, FREE_EXPORT),
        memory,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const FULL_MODULE: &str = r#"
        (module
          (memory (export "memory") 1)
          (global $calls (export "calls") (mut i32) (i32.const 0))
          (global $last_len (export "last_len") (mut i32) (i32.const 0))
          (global $first_byte (export "first_byte") (mut i32) (i32.const 0))
          (global $freed (export "freed") (mut i32) (i32.const 0))
          (func (export "runProgram")
            (global.set $calls (i32.add (global.get $calls) (i32.const 1))))
          (func (export "bridge_alloc") (param i32) (result i32)
            (i32.const 1024))
          (func (export "bridge_free") (param i32 i32)
            (global.set $freed (i32.add (global.get $freed) (i32.const 1))))
          (func (export "onKeyDownMC") (param $ptr i32) (param $len i32)
            (global.set $last_len (local.get $len))
            (global.set $first_byte (i32.load8_u (local.get $ptr)))))
    "#;

    const EMPTY_MODULE: &str = r#"
        (module
          (memory (export "memory") 1))
    "#;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    fn global(module: &mut WasmModule, name: &str) -> i32 {
        let global = module.instance.exports.get_global(name).unwrap().clone();
        global.get(&mut module.store).i32().unwrap()
    }

    #[test]
    fn runs_exported_program() {
        let rt = runtime();
        let _guard = rt.enter();

        let mut module = WasmModule::start("full.wasm", FULL_MODULE.as_bytes()).unwrap();

        module.try_run_program().unwrap();

        assert_eq!(global(&mut module, "calls"), 1);
    }

    #[test]
    fn forwards_key_event_as_json() {
        let rt = runtime();
        let _guard = rt.enter();

        let mut module = WasmModule::start("full.wasm", FULL_MODULE.as_bytes()).unwrap();
        let event = json!({"key": "w"});

        module.try_on_key_down(&event).unwrap();

        let expected_len = serde_json::to_vec(&event).unwrap().len() as i32;
        assert_eq!(global(&mut module, "last_len"), expected_len);
        assert_eq!(global(&mut module, "first_byte"), b'{' as i32);
        assert_eq!(global(&mut module, "freed"), 1);
        assert_eq!(global(&mut module, "calls"), 0);
    }

    #[test]
    fn missing_exports_are_reported() {
        let rt = runtime();
        let _guard = rt.enter();

        let mut module = WasmModule::start("empty.wasm", EMPTY_MODULE.as_bytes()).unwrap();

        assert!(matches!(
            module.try_run_program(),
            Err(BridgeError::ExportMissing("runProgram"))
        ));
        assert!(matches!(
            module.try_on_key_down(&json!({"key": "a"})),
            Err(BridgeError::ExportMissing("onKeyDownMC"))
        ));
    }

    #[test]
    fn key_export_without_allocator_is_ignored() {
        let rt = runtime();
        let _guard = rt.enter();

        let wat = r#"
            (module
              (memory (export "memory") 1)
              (func (export "onKeyDownMC") (param i32 i32)))
        "#;
        let mut module = WasmModule::start("noalloc.wasm", wat.as_bytes()).unwrap();

        assert!(matches!(
            module.try_on_key_down(&json!(null)),
            Err(BridgeError::ExportMissing("onKeyDownMC"))
        ));
    }

    #[test]
    fn wrong_signature_counts_as_missing() {
        let rt = runtime();
        let _guard = rt.enter();

        let wat = r#"
            (module
              (memory (export "memory") 1)
              (func (export "runProgram") (param i32)))
        "#;
        let mut module = WasmModule::start("sig.wasm", wat.as_bytes()).unwrap();

        assert!(matches!(
            module.try_run_program(),
            Err(BridgeError::ExportMissing("runProgram"))
        ));
    }

    #[test]
    fn trap_in_program_is_a_call_error() {
        let rt = runtime();
        let _guard = rt.enter();

        let wat = r#"
            (module
              (memory (export "memory") 1)
              (func (export "runProgram") unreachable))
        "#;
        let mut module = WasmModule::start("trap.wasm", wat.as_bytes()).unwrap();

        assert!(matches!(
            module.try_run_program(),
            Err(BridgeError::Call {
                export: "runProgram",
                ..
            })
        ));
    }

    #[test]
    fn start_entry_point_runs_before_exports() {
        let rt = runtime();
        let _guard = rt.enter();

        let wat = r#"
            (module
              (memory (export "memory") 1)
              (global $started (export "started") (mut i32) (i32.const 0))
              (func (export "_start")
                (global.set $started (i32.const 1))))
        "#;
        let mut module = WasmModule::start("cmd.wasm", wat.as_bytes()).unwrap();

        assert_eq!(global(&mut module, "started"), 1);
    }

    #[test]
    fn trapping_start_fails_the_load() {
        let rt = runtime();
        let _guard = rt.enter();

        let wat = r#"
            (module
              (memory (export "memory") 1)
              (func (export "_start") unreachable))
        "#;
        let result = WasmModule::start("bad.wasm", wat.as_bytes());

        assert!(matches!(result, Err(BridgeError::Start { .. })));
    }

    #[test]
    fn garbage_bytes_fail_to_compile() {
        let rt = runtime();
        let _guard = rt.enter();

        let result = WasmModule::start("junk.wasm", b"not a module");

        assert!(matches!(result, Err(BridgeError::Compile { .. })));
    }

    #[test]
    fn loader_reads_from_modules_dir() {
        let rt = runtime();
        let _guard = rt.enter();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("game.wat"), FULL_MODULE).unwrap();
        let loader = WasmerLoader::new(Some(dir.path().to_path_buf()));

        let mut module = loader.load("game.wat").unwrap();

        module.try_run_program().unwrap();
    }

    #[test]
    fn module_name_is_file_stem() {
        assert_eq!(module_name("/srv/wasm/main.wasm"), "main");
        assert_eq!(module_name("https://host/app.wasm"), "app");
        assert_eq!(module_name(""), "module");
    }

    #[test]
    fn clean_proc_exit_counts_as_started() {
        let rt = runtime();
        let _guard = rt.enter();
        let wat = r#"
            (module
              (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
              (memory (export "memory") 1)
              (func (export "runProgram"))
              (func (export "_start")
                (call $exit (i32.const 0))))
        "#;

        let mut module = WasmModule::start("exit0.wasm", wat.as_bytes()).unwrap();

        module.try_run_program().unwrap();
    }

    #[test]
    fn non_zero_exit_fails_the_load() {
        let rt = runtime();
        let _guard = rt.enter();
        let wat = r#"
            (module
              (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
              (memory (export "memory") 1)
              (func (export "_start")
                (call $exit (i32.const 3))))
        "#;

        let result = WasmModule::start("exit3.wasm", wat.as_bytes());

        match result {
            Err(BridgeError::Start { path, .. }) => assert_eq!(path, "exit3.wasm"),
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("module with exit code 3 should not start"),
        }
    }

    #[test]
    fn initialize_entry_wins_over_start() {
        let rt = runtime();
        let _guard = rt.enter();
        let wat = r#"
            (module
              (memory (export "memory") 1)
              (global $started (export "started") (mut i32) (i32.const 0))
              (func (export "_initialize")
                (global.set $started (i32.const 2)))
              (func (export "_start") unreachable))
        "#;

        let mut module = WasmModule::start("reactor.wasm", wat.as_bytes()).unwrap();

        assert_eq!(global(&mut module, "started"), 2);
    }

    #[test]
    fn out_of_bounds_event_buffer_is_a_memory_error() {
        let rt = runtime();
        let _guard = rt.enter();
        let wat = r#"
            (module
              (memory (export "memory") 1)
              (global $calls (export "calls") (mut i32) (i32.const 0))
              (func (export "bridge_alloc") (param i32) (result i32)
                (i32.const 65535))
              (func (export "onKeyDownMC") (param i32 i32)
                (global.set $calls (i32.const 1))))
        "#;
        let mut module = WasmModule::start("oob.wasm", wat.as_bytes()).unwrap();

        let result = module.try_on_key_down(&json!({"key": "Escape"}));

        assert!(matches!(result, Err(BridgeError::Memory(_))));
        assert_eq!(global(&mut module, "calls"), 0);
    }
}
