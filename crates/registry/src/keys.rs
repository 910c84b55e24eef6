//! Key derivation for namespaced and cluster-scoped kinds.

use std::sync::Arc;

use keel_core::{ApiError, ApiResult, Context};

/// Prefix under which every object of a kind (in the context's scope) lives.
pub type KeyRootFn = Arc<dyn Fn(&Context) -> String + Send + Sync>;
/// Full key for one named object.
pub type KeyFn = Arc<dyn Fn(&Context, &str) -> ApiResult<String> + Send + Sync>;

/// Names become a single path segment; anything that could alias another key is refused.
pub fn check_name(name: &str) -> ApiResult<()> {
    if name.is_empty() {
        return Err(ApiError::BadRequest("name parameter required".into()));
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('%') {
        return Err(ApiError::BadRequest(format!("name {:?} may not be '.', '..' or contain '/' or '%'", name)));
    }
    Ok(())
}

/// `{prefix}/{ns}` when the context carries a namespace, `{prefix}` otherwise.
pub fn namespace_key_root(ctx: &Context, prefix: &str) -> String {
    match ctx.namespace() {
        Some(ns) => format!("{}/{}", prefix, ns),
        None => prefix.to_string(),
    }
}

/// `{prefix}/{ns}/{name}`; the context must carry a namespace.
pub fn namespace_key(ctx: &Context, prefix: &str, name: &str) -> ApiResult<String> {
    let ns = ctx.namespace().ok_or_else(|| ApiError::BadRequest("namespace parameter required".into()))?;
    check_name(ns)?;
    check_name(name)?;
    Ok(format!("{}/{}/{}", prefix, ns, name))
}

/// `{prefix}/{name}`; the context's namespace is ignored.
pub fn cluster_key(prefix: &str, name: &str) -> ApiResult<String> {
    check_name(name)?;
    Ok(format!("{}/{}", prefix, name))
}

pub fn namespace_key_root_fn(prefix: &str) -> KeyRootFn {
    let prefix = prefix.to_string();
    Arc::new(move |ctx: &Context| namespace_key_root(ctx, &prefix))
}

pub fn namespace_key_fn(prefix: &str) -> KeyFn {
    let prefix = prefix.to_string();
    Arc::new(move |ctx: &Context, name: &str| namespace_key(ctx, &prefix, name))
}

pub fn cluster_key_root_fn(prefix: &str) -> KeyRootFn {
    let prefix = prefix.to_string();
    Arc::new(move |_: &Context| prefix.clone())
}

pub fn cluster_key_fn(prefix: &str) -> KeyFn {
    let prefix = prefix.to_string();
    Arc::new(move |_: &Context, name: &str| cluster_key(&prefix, name))
}
