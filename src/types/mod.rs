use serde::{Deserialize, Serialize};

/// Messages from the controller to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    #[serde(rename = "initialize")]
    Initialize {
        #[serde(rename = "wasmPath")]
        wasm_path: String,
    },
    #[serde(rename = "runProgram")]
    RunProgram,
    #[serde(rename = "onKeyDownMC")]
    OnKeyDownMC {
        #[serde(default)]
        event: serde_json::Value,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Initialize { .. } => "initialize",
            Command::RunProgram => "runProgram",
            Command::OnKeyDownMC { .. } => "onKeyDownMC",
        }
    }
}

/// Messages from the worker back to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Response {
    Initialized,
    Done,
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Loading { path: String },
    Ready { path: String },
    Faulted { message: String },
}
