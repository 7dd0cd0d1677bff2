/// Shared error type used across the session orchestrator crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("registry: {0}")]
    Registry(String),

    #[error("session: {0}")]
    Session(String),

    #[error("IPC: {0}")]
    Ipc(String),

    #[error("health: {0}")]
    Health(String),

    #[error("config: {0}")]
    Config(String),

    #[error("agent adapter: {0}")]
    Agent(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
