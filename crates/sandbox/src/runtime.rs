use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use kinspect_core::{CheckEvent, CheckStatus, ClusterRef, RunId, ScriptDefinition, ScriptResult};
use mlua::{Lua, LuaOptions, StdLib, Value, Variadic};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::error::SandboxError;
use crate::kubectl::{KubectlQuery, QueryContext};
use crate::resource::{ResourceBackend, ResponseCache};
use crate::value::ScriptValue;

/// One finding reported through `check_event`.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedEvent {
    pub status: CheckStatus,
    pub message: String,
    pub extra: serde_json::Map<String, serde_json::Value>,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

/// What a single script invocation produced. Output and events captured
/// before a failure are kept.
#[derive(Debug, Clone)]
pub struct ScriptOutcome {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub output: String,
    pub events: Vec<CapturedEvent>,
    pub error: Option<String>,
}

impl ScriptOutcome {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    /// Turn the outcome into records tagged with the script's provenance.
    pub fn into_records(
        self,
        run_id: RunId,
        script: &ScriptDefinition,
    ) -> (ScriptResult, Vec<CheckEvent>) {
        let result = ScriptResult {
            id: 0,
            run_id,
            script_name: script.name.clone(),
            kind: script.kind.clone(),
            description: script.description.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            std_output: self.output,
            error_msg: self.error,
        };
        let events = self
            .events
            .into_iter()
            .map(|e| CheckEvent {
                id: 0,
                run_id,
                script_name: script.name.clone(),
                kind: script.kind.clone(),
                description: script.description.clone(),
                status: e.status,
                message: e.message,
                extra: e.extra,
                namespace: e.namespace,
                name: e.name,
            })
            .collect();
        (result, events)
    }
}

/// Executes inspection scripts against one cluster.
///
/// Each [`Sandbox::execute`] call gets a brand-new interpreter; nothing a
/// script defines survives into the next one. Only the `table`, `string`,
/// `math` and `utf8` libraries are loaded.
pub struct Sandbox {
    ctx: Arc<QueryContext>,
}

impl Sandbox {
    pub fn new(
        cluster: ClusterRef,
        backend: Arc<dyn ResourceBackend>,
        cache: Arc<ResponseCache>,
        runtime: Handle,
    ) -> Self {
        Self {
            ctx: Arc::new(QueryContext {
                cluster,
                backend,
                cache,
                runtime,
            }),
        }
    }

    /// Bind to the tokio runtime the caller is running on.
    pub fn for_current_runtime(
        cluster: ClusterRef,
        backend: Arc<dyn ResourceBackend>,
        cache: Arc<ResponseCache>,
    ) -> Result<Self, SandboxError> {
        let runtime = Handle::try_current().map_err(|_| SandboxError::NoRuntime)?;
        Ok(Self::new(cluster, backend, cache, runtime))
    }

    pub fn cluster(&self) -> &ClusterRef {
        &self.ctx.cluster
    }

    /// Run one script to completion. Blocks on resource queries, so call
    /// this from a blocking-pool thread.
    pub fn execute(&self, script: &ScriptDefinition) -> ScriptOutcome {
        let start_time = Utc::now();
        let sink = Arc::new(Mutex::new(String::new()));
        let events = Arc::new(Mutex::new(Vec::new()));

        let error = match self.prepare(&script.name, &sink, &events) {
            Ok(lua) => {
                let chunk = lua
                    .load(script.script_body.as_str())
                    .set_name(format!("={}", script.name));
                // A panic in a host callback is resumed here once Lua unwinds.
                match panic::catch_unwind(AssertUnwindSafe(|| chunk.exec())) {
                    Ok(result) => result.err().map(|e| e.to_string()),
                    Err(payload) => Some(format!("host panic: {}", panic_message(payload.as_ref()))),
                }
            }
            Err(e) => Some(e.to_string()),
        };

        if let Some(err) = &error {
            warn!(script = %script.name, cluster = %self.ctx.cluster, error = %err, "script failed");
        }

        let output = std::mem::take(&mut *sink.lock().unwrap_or_else(|e| e.into_inner()));
        let events = std::mem::take(&mut *events.lock().unwrap_or_else(|e| e.into_inner()));
        debug!(
            script = %script.name,
            events = events.len(),
            output_bytes = output.len(),
            "script finished"
        );

        ScriptOutcome {
            start_time,
            end_time: Utc::now(),
            output,
            events,
            error,
        }
    }

    fn prepare(
        &self,
        script_name: &str,
        sink: &Arc<Mutex<String>>,
        events: &Arc<Mutex<Vec<CapturedEvent>>>,
    ) -> Result<Lua, SandboxError> {
        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
            LuaOptions::default(),
        )?;
        let globals = lua.globals();
        globals.set("dofile", Value::Nil)?;
        globals.set("loadfile", Value::Nil)?;

        let print_sink = sink.clone();
        globals.set(
            "print",
            lua.create_function(move |_, args: Variadic<Value>| {
                let line = args.iter().map(render).collect::<Vec<_>>().join("\t");
                let mut out = print_sink.lock().unwrap_or_else(|e| e.into_inner());
                out.push_str(&line);
                out.push('\n');
                Ok(())
            })?,
        )?;

        let log_sink = sink.clone();
        let name = script_name.to_string();
        globals.set(
            "log",
            lua.create_function(move |_, value: Value| {
                let line = render(&value);
                debug!(script = %name, "{}", line);
                let mut out = log_sink.lock().unwrap_or_else(|e| e.into_inner());
                out.push_str(&line);
                out.push('\n');
                Ok(())
            })?,
        )?;

        let event_sink = events.clone();
        globals.set(
            "check_event",
            lua.create_function(
                move |_, (status, message, extra): (String, Option<String>, Option<Value>)| {
                    let event = build_event(&status, message.unwrap_or_default(), extra);
                    event_sink
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(event);
                    Ok(())
                },
            )?,
        )?;

        globals.set("kubectl", KubectlQuery::new(self.ctx.clone()))?;
        drop(globals);
        Ok(lua)
    }
}

fn build_event(status: &str, message: String, extra: Option<Value>) -> CapturedEvent {
    let extra = match extra.map(|v| ScriptValue::from_lua(&v)) {
        None | Some(ScriptValue::Nil) => serde_json::Map::new(),
        Some(ScriptValue::Map(map)) => map
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
        Some(other) => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other.to_json());
            map
        }
    };
    let lift = |key: &str| match extra.get(key) {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    CapturedEvent {
        status: CheckStatus::parse(status),
        message,
        namespace: lift("namespace"),
        name: lift("name"),
        extra,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

/// Text form of a value for `print` and `log`; tables render as JSON.
fn render(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => {
            if n.fract() == 0.0 && n.is_finite() {
                format!("{n:.1}")
            } else {
                n.to_string()
            }
        }
        Value::String(s) => s.to_string_lossy().to_string(),
        Value::Table(_) => ScriptValue::from_lua(value).to_json().to_string(),
        other => other.type_name().to_string(),
    }
}
