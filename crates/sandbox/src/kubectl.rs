//! The `kubectl` handle exposed to scripts.
//!
//! ```lua
//! local pods, err = kubectl:GVK("", "v1", "Pod"):Namespace("default")
//!     :WithLabelSelector("app=web"):Cache(30):List()
//! if err then
//!     check_event("failed", err)
//!     return
//! end
//! ```
//!
//! Every builder step returns a new handle, so a partially built query can
//! be stored in a local and reused. Terminators (`List`, `Get`, `Doc`) return
//! `(result, nil)` on success and `(nil, message)` on failure.

use std::sync::Arc;
use std::time::Duration;

use kinspect_core::ClusterRef;
use mlua::{Lua, UserData, UserDataMethods, Value};
use tokio::runtime::Handle;
use tracing::debug;

use crate::error::ResourceError;
use crate::resource::cache::CacheOp;
use crate::resource::{Gvk, NamespaceScope, ResourceBackend, ResourceRequest, ResponseCache};
use crate::value::ScriptValue;

/// Everything a query needs to reach its cluster.
pub struct QueryContext {
    pub cluster: ClusterRef,
    pub backend: Arc<dyn ResourceBackend>,
    pub cache: Arc<ResponseCache>,
    /// Runtime the async backend is driven on. Terminators call
    /// `Handle::block_on`, so scripts must run off the async worker threads.
    pub runtime: Handle,
}

#[derive(Clone)]
pub struct KubectlQuery {
    ctx: Arc<QueryContext>,
    request: ResourceRequest,
    cache_ttl: Option<Duration>,
}

impl KubectlQuery {
    pub fn new(ctx: Arc<QueryContext>) -> Self {
        Self {
            ctx,
            request: ResourceRequest::default(),
            cache_ttl: None,
        }
    }

    fn with(&self, f: impl FnOnce(&mut Self)) -> Self {
        let mut next = self.clone();
        f(&mut next);
        next
    }

    fn execute(&self, op: CacheOp) -> Result<serde_json::Value, ResourceError> {
        let gvk = self.request.gvk()?.clone();
        let ctx = &self.ctx;

        if self.cache_ttl.is_some() {
            if let Some(hit) = ctx.cache.get(&ctx.cluster, &op, &self.request) {
                return Ok(hit);
            }
        }

        debug!(cluster = %ctx.cluster, gvk = %gvk, ?op, "resource query");
        let value = ctx.runtime.block_on(async {
            match &op {
                CacheOp::List => ctx.backend.list(&ctx.cluster, &self.request).await,
                CacheOp::Get => ctx.backend.get(&ctx.cluster, &self.request).await,
                CacheOp::Doc(path) => ctx
                    .backend
                    .doc(&ctx.cluster, &gvk, path)
                    .await
                    .map(serde_json::Value::String),
            }
        })?;

        if let Some(ttl) = self.cache_ttl {
            ctx.cache.put(&ctx.cluster, op, &self.request, value.clone(), ttl);
        }
        Ok(value)
    }

    /// Convert a terminator result into the `(result, err)` pair.
    fn reply(lua: &Lua, result: Result<serde_json::Value, ResourceError>) -> mlua::Result<(Value, Value)> {
        match result {
            Ok(value) => Ok((ScriptValue::from_json(&value).to_lua(lua)?, Value::Nil)),
            Err(e) => Ok((Value::Nil, Value::String(lua.create_string(e.to_string())?))),
        }
    }
}

/// Longest TTL a script can ask for; larger values are clamped.
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// TTL for `Cache(seconds)`. Non-positive and NaN disable caching.
fn cache_ttl(ttl_secs: f64) -> Option<Duration> {
    if ttl_secs.is_nan() || ttl_secs <= 0.0 {
        return None;
    }
    let ttl = Duration::try_from_secs_f64(ttl_secs).unwrap_or(MAX_CACHE_TTL);
    Some(ttl.min(MAX_CACHE_TTL))
}

impl UserData for KubectlQuery {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method(
            "GVK",
            |_, this, (group, version, kind): (String, String, String)| {
                Ok(this.with(|q| q.request.gvk = Some(Gvk::new(group, version, kind))))
            },
        );
        methods.add_method("Namespace", |_, this, namespace: String| {
            Ok(this.with(|q| q.request.namespace = NamespaceScope::Namespace(namespace)))
        });
        methods.add_method("AllNamespace", |_, this, ()| {
            Ok(this.with(|q| q.request.namespace = NamespaceScope::All))
        });
        methods.add_method("WithLabelSelector", |_, this, selector: String| {
            Ok(this.with(|q| q.request.label_selector = Some(selector)))
        });
        methods.add_method("Name", |_, this, name: String| {
            Ok(this.with(|q| q.request.name = Some(name)))
        });
        methods.add_method("Cache", |_, this, ttl_secs: f64| {
            let ttl = cache_ttl(ttl_secs);
            Ok(this.with(|q| q.cache_ttl = ttl))
        });

        methods.add_method("List", |lua, this, ()| {
            KubectlQuery::reply(lua, this.execute(CacheOp::List))
        });
        methods.add_method("Get", |lua, this, ()| {
            let result = this.request.name().and_then(|_| this.execute(CacheOp::Get));
            KubectlQuery::reply(lua, result)
        });
        methods.add_method("Doc", |lua, this, field_path: String| {
            KubectlQuery::reply(lua, this.execute(CacheOp::Doc(field_path)))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_ttl_is_clamped() {
        assert_eq!(cache_ttl(30.0), Some(Duration::from_secs(30)));
        assert_eq!(cache_ttl(0.5), Some(Duration::from_millis(500)));
        assert_eq!(cache_ttl(1e20), Some(MAX_CACHE_TTL));
        assert_eq!(cache_ttl(f64::INFINITY), Some(MAX_CACHE_TTL));
        assert_eq!(cache_ttl(0.0), None);
        assert_eq!(cache_ttl(-5.0), None);
        assert_eq!(cache_ttl(f64::NAN), None);
    }
}
