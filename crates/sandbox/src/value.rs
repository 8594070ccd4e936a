//! Values crossing the host/script boundary.
//!
//! Lua has a single table type for both sequences and records, so the
//! conversion from Lua follows a fixed rule:
//!
//! 1. a table carrying the array marker metatable is an array;
//! 2. a table whose keys are exactly the integers `1..=N` (N > 0) is an array;
//! 3. anything else is a map. Integer, float and boolean keys are stringified,
//!    other key types are dropped.
//!
//! An empty table without the marker is an empty map. Functions, userdata,
//! threads and non-finite floats become `Nil`, as does anything nested more
//! than [`MAX_DEPTH`] levels deep (which also breaks reference cycles).
//!
//! Host arrays handed to a script always carry the marker, so an empty list
//! returned by the cluster API comes back as an empty array.

use std::collections::BTreeMap;

use mlua::{Lua, Table, Value};

pub const MAX_DEPTH: usize = 64;

/// Holes tolerated in a marked array before trailing indices are dropped.
const MAX_ARRAY_GAP: i64 = 1024;

const ARRAY_MARKER_KEY: &str = "__kinspect";
const ARRAY_MARKER: &str = "array";
const ARRAY_MT_REGISTRY_KEY: &str = "kinspect.array_mt";

#[derive(Debug, Clone, PartialEq, Default)]
pub enum ScriptValue {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<ScriptValue>),
    Map(BTreeMap<String, ScriptValue>),
}

impl ScriptValue {
    pub fn is_nil(&self) -> bool {
        matches!(self, ScriptValue::Nil)
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, ScriptValue>> {
        match self {
            ScriptValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(s) => Some(s),
            _ => None,
        }
    }

    // ── JSON ──────────────────────────────────────────────────

    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ScriptValue::Nil,
            serde_json::Value::Bool(b) => ScriptValue::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => ScriptValue::Int(i),
                None => ScriptValue::Float(n.as_f64().unwrap_or(f64::NAN)).finite_or_nil(),
            },
            serde_json::Value::String(s) => ScriptValue::String(s.clone()),
            serde_json::Value::Array(items) => {
                ScriptValue::Array(items.iter().map(ScriptValue::from_json).collect())
            }
            serde_json::Value::Object(obj) => ScriptValue::Map(
                obj.iter()
                    .map(|(k, v)| (k.clone(), ScriptValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ScriptValue::Nil => serde_json::Value::Null,
            ScriptValue::Bool(b) => serde_json::Value::Bool(*b),
            ScriptValue::Int(i) => serde_json::Value::from(*i),
            ScriptValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ScriptValue::String(s) => serde_json::Value::String(s.clone()),
            ScriptValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(ScriptValue::to_json).collect())
            }
            ScriptValue::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    fn finite_or_nil(self) -> Self {
        match self {
            ScriptValue::Float(f) if !f.is_finite() => ScriptValue::Nil,
            other => other,
        }
    }

    // ── Lua ───────────────────────────────────────────────────

    /// Build a Lua value. Arrays are tagged with the marker metatable;
    /// `Nil` map entries are omitted since Lua tables cannot hold nil.
    pub fn to_lua(&self, lua: &Lua) -> mlua::Result<Value> {
        Ok(match self {
            ScriptValue::Nil => Value::Nil,
            ScriptValue::Bool(b) => Value::Boolean(*b),
            ScriptValue::Int(i) => Value::Integer(*i),
            ScriptValue::Float(f) => Value::Number(*f),
            ScriptValue::String(s) => Value::String(lua.create_string(s)?),
            ScriptValue::Array(items) => {
                let table = lua.create_table_with_capacity(items.len(), 0)?;
                for (i, item) in items.iter().enumerate() {
                    table.raw_set(i as i64 + 1, item.to_lua(lua)?)?;
                }
                let _ = table.set_metatable(Some(array_metatable(lua)?));
                Value::Table(table)
            }
            ScriptValue::Map(map) => {
                let table = lua.create_table_with_capacity(0, map.len())?;
                for (k, v) in map {
                    if !v.is_nil() {
                        table.raw_set(k.as_str(), v.to_lua(lua)?)?;
                    }
                }
                Value::Table(table)
            }
        })
    }

    pub fn from_lua(value: &Value) -> Self {
        from_lua_at(value, 0)
    }
}

impl From<serde_json::Value> for ScriptValue {
    fn from(value: serde_json::Value) -> Self {
        ScriptValue::from_json(&value)
    }
}

/// The shared marker metatable, created on first use per interpreter.
fn array_metatable(lua: &Lua) -> mlua::Result<Table> {
    if let Some(mt) = lua.named_registry_value::<Option<Table>>(ARRAY_MT_REGISTRY_KEY)? {
        return Ok(mt);
    }
    let mt = lua.create_table()?;
    mt.raw_set(ARRAY_MARKER_KEY, ARRAY_MARKER)?;
    lua.set_named_registry_value(ARRAY_MT_REGISTRY_KEY, mt.clone())?;
    Ok(mt)
}

fn has_array_marker(table: &Table) -> bool {
    match table.metatable() {
        Some(mt) => matches!(
            mt.raw_get::<Option<String>>(ARRAY_MARKER_KEY),
            Ok(Some(ref m)) if m == ARRAY_MARKER
        ),
        None => false,
    }
}

fn from_lua_at(value: &Value, depth: usize) -> ScriptValue {
    if depth > MAX_DEPTH {
        return ScriptValue::Nil;
    }
    match value {
        Value::Nil => ScriptValue::Nil,
        Value::Boolean(b) => ScriptValue::Bool(*b),
        Value::Integer(i) => ScriptValue::Int(*i),
        Value::Number(f) => ScriptValue::Float(*f).finite_or_nil(),
        Value::String(s) => ScriptValue::String(s.to_string_lossy().to_string()),
        Value::Table(t) => table_to_value(t, depth),
        _ => ScriptValue::Nil,
    }
}

fn integer_key(key: &Value) -> Option<i64> {
    match key {
        Value::Integer(i) => Some(*i),
        Value::Number(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
        _ => None,
    }
}

fn stringify_key(key: &Value) -> Option<String> {
    match key {
        Value::String(s) => Some(s.to_string_lossy().to_string()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Number(f) if f.fract() == 0.0 && f.is_finite() => Some((*f as i64).to_string()),
        Value::Number(f) => Some(f.to_string()),
        Value::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}

fn table_to_value(table: &Table, depth: usize) -> ScriptValue {
    let entries: Vec<(Value, Value)> = table.clone().pairs::<Value, Value>().flatten().collect();

    if has_array_marker(table) {
        let max = entries
            .iter()
            .filter_map(|(k, _)| integer_key(k))
            .filter(|i| *i >= 1)
            .max()
            .unwrap_or(0)
            .min(entries.len() as i64 + MAX_ARRAY_GAP) as usize;
        let mut items = vec![ScriptValue::Nil; max];
        for (k, v) in &entries {
            if let Some(i) = integer_key(k).filter(|i| *i >= 1 && *i as usize <= max) {
                items[i as usize - 1] = from_lua_at(v, depth + 1);
            }
        }
        return ScriptValue::Array(items);
    }

    if is_dense_sequence(&entries) {
        let mut items = vec![ScriptValue::Nil; entries.len()];
        for (k, v) in &entries {
            if let Some(i) = integer_key(k) {
                items[i as usize - 1] = from_lua_at(v, depth + 1);
            }
        }
        return ScriptValue::Array(items);
    }

    let mut map = BTreeMap::new();
    for (k, v) in &entries {
        if let Some(key) = stringify_key(k) {
            map.insert(key, from_lua_at(v, depth + 1));
        }
    }
    ScriptValue::Map(map)
}

fn is_dense_sequence(entries: &[(Value, Value)]) -> bool {
    if entries.is_empty() {
        return false;
    }
    let n = entries.len() as i64;
    let mut seen = vec![false; entries.len()];
    for (k, _) in entries {
        match integer_key(k) {
            Some(i) if (1..=n).contains(&i) && !seen[i as usize - 1] => seen[i as usize - 1] = true,
            _ => return false,
        }
    }
    true
}
