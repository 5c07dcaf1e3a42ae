use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("could not read module {path}: {source}")]
    Fetch {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not download module: {0}")]
    Http(#[from] reqwest::Error),

    #[error("could not download module {path}: HTTP {status}")]
    HttpStatus { path: String, status: u16 },

    #[error("could not compile module {path}: {message}")]
    Compile { path: String, message: String },

    #[error("could not instantiate module {path}: {message}")]
    Instantiate { path: String, message: String },

    #[error("could not start module {path}: {message}")]
    Start { path: String, message: String },

    /// The module (or the worker) has no callable for this export.
    #[error("{0} is not defined.")]
    ExportMissing(&'static str),

    #[error("{export} failed: {message}")]
    Call {
        export: &'static str,
        message: String,
    },

    #[error("guest memory error: {0}")]
    Memory(String),

    #[error("could not encode event: {0}")]
    Event(#[from] serde_json::Error),

    #[error("{stage} panicked: {message}")]
    Panicked {
        stage: &'static str,
        message: String,
    },

    #[error("worker is not running")]
    WorkerGone,

    #[error("controller API failed: {0}")]
    Server(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
