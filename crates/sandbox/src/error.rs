use thiserror::Error;

/// Failures of a resource query issued from a script.
///
/// These are surfaced to the script as the `err` half of a `(result, err)`
/// pair, so the `Display` text is what script authors see.
#[derive(Error, Debug, Clone)]
pub enum ResourceError {
    #[error("no resource type selected, call GVK(group, version, kind) first")]
    MissingGvk,

    #[error("Get() requires Name(name)")]
    MissingName,

    #[error("unknown cluster: {0}")]
    UnknownCluster(String),

    #[error("unknown resource kind {kind} in {api_version}")]
    UnknownKind { api_version: String, kind: String },

    #[error("{kind} \"{name}\" not found")]
    NotFound { kind: String, name: String },

    #[error("no documentation for {kind} field '{path}'")]
    NoDoc { kind: String, path: String },

    #[error("invalid label selector '{selector}': {message}")]
    InvalidSelector { selector: String, message: String },

    #[error("cluster configuration error: {0}")]
    Config(String),

    #[error("cluster API error: {0}")]
    Api(String),

    #[error("request failed: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for ResourceError {
    fn from(e: reqwest::Error) -> Self {
        ResourceError::Transport(e.to_string())
    }
}

/// Failures setting up the interpreter itself. Script-level errors are not
/// reported here; they end up in the invocation outcome.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Lua setup failed: {0}")]
    Lua(#[from] mlua::Error),

    #[error("no tokio runtime available for resource queries")]
    NoRuntime,
}
