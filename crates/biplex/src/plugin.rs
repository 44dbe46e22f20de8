//! Extension points around peer and message lifecycles.

use std::sync::Arc;

use biplex_core::Rerror;
use tracing::warn;

use crate::config::PeerConfig;
use crate::context::HandlerCtx;
use crate::peer::Peer;
use crate::session::Session;

/// A lifecycle hook set. Every method defaults to a no-op; implement the
/// ones the plugin cares about.
///
/// Fallible hooks abort what they guard: a failing `post_dial`/`post_accept`
/// closes the session before it is admitted, a failing `pre_handle` replies
/// the error to the caller (for CALLs) instead of running the handler.
pub trait Plugin: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn pre_new_peer(&self, _cfg: &mut PeerConfig) {}

    fn post_new_peer(&self, _peer: &Peer) {}

    fn post_dial(&self, _sess: &Arc<Session>) -> Result<(), Rerror> {
        Ok(())
    }

    fn post_accept(&self, _sess: &Arc<Session>) -> Result<(), Rerror> {
        Ok(())
    }

    fn post_listen(&self, _addr: &str) {}

    fn pre_handle(&self, _ctx: &HandlerCtx) -> Result<(), Rerror> {
        Ok(())
    }

    fn post_handle(&self, _ctx: &HandlerCtx) {}
}

/// An ordered collection of plugins, invoked front to back.
#[derive(Clone, Default)]
pub struct PluginContainer {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginContainer {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub fn append(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.plugins.iter()
    }

    pub(crate) fn pre_new_peer(&self, cfg: &mut PeerConfig) {
        for p in &self.plugins {
            p.pre_new_peer(cfg);
        }
    }

    pub(crate) fn post_new_peer(&self, peer: &Peer) {
        for p in &self.plugins {
            p.post_new_peer(peer);
        }
    }

    pub(crate) fn post_dial(&self, sess: &Arc<Session>) -> Result<(), Rerror> {
        for p in &self.plugins {
            if let Err(rerr) = p.post_dial(sess) {
                warn!(plugin = p.name(), error = %rerr, "post_dial rejected session");
                return Err(rerr);
            }
        }
        Ok(())
    }

    pub(crate) fn post_accept(&self, sess: &Arc<Session>) -> Result<(), Rerror> {
        for p in &self.plugins {
            if let Err(rerr) = p.post_accept(sess) {
                warn!(plugin = p.name(), error = %rerr, "post_accept rejected session");
                return Err(rerr);
            }
        }
        Ok(())
    }

    pub(crate) fn post_listen(&self, addr: &str) {
        for p in &self.plugins {
            p.post_listen(addr);
        }
    }

    pub(crate) fn pre_handle(&self, ctx: &HandlerCtx) -> Result<(), Rerror> {
        for p in &self.plugins {
            if let Err(rerr) = p.pre_handle(ctx) {
                warn!(plugin = p.name(), error = %rerr, "pre_handle rejected message");
                return Err(rerr);
            }
        }
        Ok(())
    }

    pub(crate) fn post_handle(&self, ctx: &HandlerCtx) {
        for p in &self.plugins {
            p.post_handle(ctx);
        }
    }
}
