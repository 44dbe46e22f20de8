//! Maps service methods to handlers.
//!
//! Handlers are registered explicitly as `(path, async fn)` pairs, either on
//! the root router or on a subtree created with [`Router::sub_route`].
//! Plugins attached to a subtree are accumulated root to leaf at
//! registration time; dispatch only ever sees the flattened list.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use biplex_core::{Body, BoxFuture, Rerror};
use parking_lot::RwLock;

use crate::context::HandlerCtx;
use crate::plugin::Plugin;

pub(crate) type CallHandlerFn =
    Arc<dyn Fn(Arc<HandlerCtx>) -> BoxFuture<'static, Result<Body, Rerror>> + Send + Sync>;
pub(crate) type PushHandlerFn =
    Arc<dyn Fn(Arc<HandlerCtx>) -> BoxFuture<'static, Result<(), Rerror>> + Send + Sync>;

pub(crate) enum HandlerBody {
    Call(CallHandlerFn),
    Push(PushHandlerFn),
}

/// A registered handler: normalized path, function, and the plugins
/// accumulated from the subtree chain it was registered under.
pub struct Handler {
    name: String,
    pub(crate) body: HandlerBody,
    pub(crate) plugins: Vec<Arc<dyn Plugin>>,
}

impl Handler {
    /// The normalized service method path.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_call(&self) -> bool {
        matches!(self.body, HandlerBody::Call(_))
    }
}

/// Normalize a service method: lower-case, `.` and `/` both separate
/// components, exactly one leading slash.
pub fn normalize_service_method(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for part in path
        .to_ascii_lowercase()
        .split(['.', '/'])
        .filter(|p| !p.is_empty())
    {
        out.push('/');
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

#[derive(Default)]
struct RouterMaps {
    call: HashMap<String, Arc<Handler>>,
    push: HashMap<String, Arc<Handler>>,
    unknown_call: Option<Arc<Handler>>,
    unknown_push: Option<Arc<Handler>>,
}

/// The handler tree of one peer. Cheap to clone; clones share the tree.
#[derive(Clone, Default)]
pub struct Router {
    inner: Arc<RwLock<RouterMaps>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registration scope under `prefix`; its plugins apply to every
    /// handler registered through it (and through nested subtrees).
    pub fn sub_route(&self, prefix: &str, plugins: Vec<Arc<dyn Plugin>>) -> SubRouter {
        SubRouter {
            router: self.clone(),
            prefix: normalize_service_method(prefix),
            plugins,
        }
    }

    fn root(&self) -> SubRouter {
        SubRouter {
            router: self.clone(),
            prefix: String::new(),
            plugins: Vec::new(),
        }
    }

    /// Register a CALL handler at the root; returns the normalized path.
    pub fn route_call<F, Fut>(&self, path: &str, f: F) -> String
    where
        F: Fn(Arc<HandlerCtx>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Body, Rerror>> + Send + 'static,
    {
        self.root().route_call(path, f)
    }

    /// Register a PUSH handler at the root; returns the normalized path.
    pub fn route_push<F, Fut>(&self, path: &str, f: F) -> String
    where
        F: Fn(Arc<HandlerCtx>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Rerror>> + Send + 'static,
    {
        self.root().route_push(path, f)
    }

    /// Fallback for CALLs whose path has no handler.
    pub fn set_unknown_call<F, Fut>(&self, f: F, plugins: Vec<Arc<dyn Plugin>>)
    where
        F: Fn(Arc<HandlerCtx>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Body, Rerror>> + Send + 'static,
    {
        let handler = Arc::new(Handler {
            name: "/*".to_owned(),
            body: HandlerBody::Call(box_call(f)),
            plugins,
        });
        self.inner.write().unknown_call = Some(handler);
    }

    /// Fallback for PUSHes whose path has no handler.
    pub fn set_unknown_push<F, Fut>(&self, f: F, plugins: Vec<Arc<dyn Plugin>>)
    where
        F: Fn(Arc<HandlerCtx>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Rerror>> + Send + 'static,
    {
        let handler = Arc::new(Handler {
            name: "/*".to_owned(),
            body: HandlerBody::Push(box_push(f)),
            plugins,
        });
        self.inner.write().unknown_push = Some(handler);
    }

    /// Exact-match lookup, falling back to the unknown-CALL handler.
    pub(crate) fn get_call(&self, service_method: &str) -> Option<Arc<Handler>> {
        let path = normalize_service_method(service_method);
        let maps = self.inner.read();
        maps.call.get(&path).or(maps.unknown_call.as_ref()).cloned()
    }

    /// Exact-match lookup, falling back to the unknown-PUSH handler.
    pub(crate) fn get_push(&self, service_method: &str) -> Option<Arc<Handler>> {
        let path = normalize_service_method(service_method);
        let maps = self.inner.read();
        maps.push.get(&path).or(maps.unknown_push.as_ref()).cloned()
    }
}

/// A registration scope created by [`Router::sub_route`].
pub struct SubRouter {
    router: Router,
    prefix: String,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl SubRouter {
    /// A nested scope; plugins accumulate.
    pub fn sub_route(&self, prefix: &str, plugins: Vec<Arc<dyn Plugin>>) -> SubRouter {
        let mut accumulated = self.plugins.clone();
        accumulated.extend(plugins);
        SubRouter {
            router: self.router.clone(),
            prefix: join_prefix(&self.prefix, prefix),
            plugins: accumulated,
        }
    }

    pub fn route_call<F, Fut>(&self, path: &str, f: F) -> String
    where
        F: Fn(Arc<HandlerCtx>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Body, Rerror>> + Send + 'static,
    {
        let name = join_prefix(&self.prefix, path);
        let handler = Arc::new(Handler {
            name: name.clone(),
            body: HandlerBody::Call(box_call(f)),
            plugins: self.plugins.clone(),
        });
        let prev = self
            .router
            .inner
            .write()
            .call
            .insert(name.clone(), handler);
        assert!(prev.is_none(), "CALL handler {name} registered twice");
        name
    }

    pub fn route_push<F, Fut>(&self, path: &str, f: F) -> String
    where
        F: Fn(Arc<HandlerCtx>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Rerror>> + Send + 'static,
    {
        let name = join_prefix(&self.prefix, path);
        let handler = Arc::new(Handler {
            name: name.clone(),
            body: HandlerBody::Push(box_push(f)),
            plugins: self.plugins.clone(),
        });
        let prev = self
            .router
            .inner
            .write()
            .push
            .insert(name.clone(), handler);
        assert!(prev.is_none(), "PUSH handler {name} registered twice");
        name
    }
}

fn join_prefix(prefix: &str, path: &str) -> String {
    let tail = normalize_service_method(path);
    if prefix.is_empty() {
        tail
    } else if tail == "/" {
        prefix.to_owned()
    } else {
        format!("{prefix}{tail}")
    }
}

fn box_call<F, Fut>(f: F) -> CallHandlerFn
where
    F: Fn(Arc<HandlerCtx>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Body, Rerror>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

fn box_push<F, Fut>(f: F) -> PushHandlerFn
where
    F: Fn(Arc<HandlerCtx>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Rerror>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}
