use std::path::{Path, PathBuf};

use crate::error::{BridgeError, Result};

/// Reads module bytes from an `http(s)://` URL or from disk. Relative disk
/// paths are taken from `modules_path` when one is configured.
pub fn fetch_module(wasm_path: &str, modules_path: Option<&Path>) -> Result<Vec<u8>> {
    if wasm_path.starts_with("http://") || wasm_path.starts_with("https://") {
        return download(wasm_path);
    }

    let path = resolve(wasm_path, modules_path);
    tracing::debug!(path = %path.display(), "reading module from disk");
    std::fs::read(&path).map_err(|source| BridgeError::Fetch {
        path: path.display().to_string(),
        source,
    })
}

fn resolve(wasm_path: &str, modules_path: Option<&Path>) -> PathBuf {
    let path = Path::new(wasm_path);
    match modules_path {
        Some(base) if path.is_relative() => base.join(path),
        _ => path.to_path_buf(),
    }
}

fn download(url: &str) -> Result<Vec<u8>> {
    tracing::debug!(url, "downloading module");
    let response = reqwest::blocking::get(url)?;
    let status = response.status();
    if !status.is_success() {
        return Err(BridgeError::HttpStatus {
            path: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(response.bytes()?.to_vec())
}
