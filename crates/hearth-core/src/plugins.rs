use crate::service::{HookError, ServiceContext};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// A module hosted by the service. Each hook succeeds or fails on its own;
/// the runtime never interprets plugin internals.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn register(&self, _ctx: &ServiceContext) -> Result<(), HookError> {
        Ok(())
    }

    fn create(&self, _ctx: &ServiceContext) -> Result<(), HookError> {
        Ok(())
    }

    fn destroy(&self, _ctx: &ServiceContext) -> Result<(), HookError> {
        Ok(())
    }

    fn unregister(&self, _ctx: &ServiceContext) -> Result<(), HookError> {
        Ok(())
    }
}

#[derive(Default)]
struct Progress {
    registered: Vec<usize>,
    created: Vec<usize>,
}

/// Ordered set of plugins driven by the lifecycle.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn Plugin>>,
    progress: Mutex<Progress>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, plugin: Box<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Register every plugin, then create the registered ones, in order.
    /// Returns how many were created.
    pub fn start_all(&self, ctx: &ServiceContext) -> usize {
        let mut progress = self.progress.lock();
        for (idx, plugin) in self.plugins.iter().enumerate() {
            match plugin.register(ctx) {
                Ok(()) => progress.registered.push(idx),
                Err(e) => warn!("plugin {}: register failed: {e}", plugin.name()),
            }
        }
        for idx in progress.registered.clone() {
            let plugin = &self.plugins[idx];
            match plugin.create(ctx) {
                Ok(()) => {
                    debug!("plugin {} created", plugin.name());
                    progress.created.push(idx);
                }
                Err(e) => warn!("plugin {}: create failed: {e}", plugin.name()),
            }
        }
        progress.created.len()
    }

    /// Destroy created plugins, then unregister registered ones, in reverse order.
    pub fn stop_all(&self, ctx: &ServiceContext) {
        let mut progress = self.progress.lock();
        for idx in std::mem::take(&mut progress.created).into_iter().rev() {
            let plugin = &self.plugins[idx];
            if let Err(e) = plugin.destroy(ctx) {
                warn!("plugin {}: destroy failed: {e}", plugin.name());
            }
        }
        for idx in std::mem::take(&mut progress.registered).into_iter().rev() {
            let plugin = &self.plugins[idx];
            if let Err(e) = plugin.unregister(ctx) {
                warn!("plugin {}: unregister failed: {e}", plugin.name());
            }
        }
    }
}
