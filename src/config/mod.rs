use std::{net::SocketAddr, path::PathBuf};

use crate::error::{BridgeError, Result};

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_OUTBOX_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub modules_path: Option<PathBuf>,
    pub startup_module: Option<String>,
    pub report_key_errors: bool,
    pub outbox_capacity: usize,
    pub sentry_dsn: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = lookup("BRIDGE_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr = listen_addr.parse::<SocketAddr>().map_err(|err| {
            BridgeError::Config(format!("BRIDGE_LISTEN_ADDR {listen_addr:?}: {err}"))
        })?;

        let modules_path = non_empty(lookup("MODULES_PATH")).map(PathBuf::from);
        if let Some(path) = &modules_path {
            if !path.is_dir() {
                return Err(BridgeError::Config(format!(
                    "MODULES_PATH {} is not a directory",
                    path.display()
                )));
            }
        }

        let report_key_errors = match non_empty(lookup("BRIDGE_REPORT_KEY_ERRORS")) {
            Some(val) => parse_flag("BRIDGE_REPORT_KEY_ERRORS", &val)?,
            None => false,
        };

        let outbox_capacity = match non_empty(lookup("BRIDGE_OUTBOX_CAPACITY")) {
            Some(val) => match val.parse::<usize>() {
                Ok(0) | Err(_) => {
                    return Err(BridgeError::Config(format!(
                        "BRIDGE_OUTBOX_CAPACITY must be a positive integer, got {val:?}"
                    )))
                }
                Ok(capacity) => capacity,
            },
            None => DEFAULT_OUTBOX_CAPACITY,
        };

        Ok(Config {
            listen_addr,
            modules_path,
            startup_module: non_empty(lookup("BRIDGE_MODULE")),
            report_key_errors,
            outbox_capacity,
            sentry_dsn: non_empty(lookup("SENTRY_DSN")),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|val| val.trim().to_string())
        .filter(|val| !val.is_empty())
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(BridgeError::Config(format!(
            "{key} must be a boolean, got {value:?}"
        ))),
    }
}
