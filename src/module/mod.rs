mod fetch;
mod wasm;

pub use fetch::fetch_module;
pub use wasm::WasmerLoader;

use crate::error::Result;

pub const RUN_PROGRAM_EXPORT: &str = "runProgram";
pub const KEY_DOWN_EXPORT: &str = "onKeyDownMC";

/// A started module. Each call either reaches the export or reports
/// `BridgeError::ExportMissing`.
pub trait LoadedModule {
    fn try_run_program(&mut self) -> Result<()>;
    fn try_on_key_down(&mut self, event: &serde_json::Value) -> Result<()>;
}

/// Turns a module path into a started module.
pub trait ModuleLoader: Send {
    fn load(&self, wasm_path: &str) -> Result<Box<dyn LoadedModule>>;
}
