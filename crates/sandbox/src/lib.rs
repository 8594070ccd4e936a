//! Sandboxed execution of inspection scripts.
//!
//! Scripts are Lua 5.4 chunks run in a fresh, stripped-down interpreter with
//! four host globals: `print`, `log`, `check_event` and the `kubectl`
//! resource-query handle bound to the target cluster.

pub mod error;
pub mod kubectl;
pub mod resource;
pub mod runtime;
pub mod value;

pub use error::{ResourceError, SandboxError};
pub use resource::{
    Gvk, KubeApiBackend, NamespaceScope, ResourceBackend, ResourceRequest, ResponseCache,
    StaticBackend,
};
pub use runtime::{CapturedEvent, Sandbox, ScriptOutcome};
pub use value::ScriptValue;
