//! The capability interface a product implements to run under hearth.

use hearth_schema::{CommandLine, ExecutionMode, ProductCard, ServiceIdentity};
use hearth_store::SettingsStore;
use parking_lot::{Mutex, RwLock};
use std::error::Error as StdError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::Span;

/// Error returned by service and plugin hooks.
pub type HookError = Box<dyn StdError + Send + Sync>;

/// Start, process and stop hooks of one product.
///
/// The runtime calls `start` and `stop` on engine workers, never
/// concurrently with each other. `process` receives the primary's own
/// command line once the service is started, and then every command line a
/// peer forwards, in arrival order.
pub trait Service: Send + Sync + 'static {
    fn start(&self, ctx: &ServiceContext) -> Result<(), HookError>;

    /// Handle non-reserved arguments. The returned text is passed back to
    /// the peer that sent them.
    fn process(&self, ctx: &ServiceContext, args: &CommandLine) -> Result<Option<String>, HookError> {
        let _ = (ctx, args);
        Ok(None)
    }

    fn stop(&self, ctx: &ServiceContext) -> Result<(), HookError>;
}

/// Switches set by the reserved `no-update`, `no-update-check` and `watch` words.
#[derive(Debug, Default)]
pub struct RuntimeFlags {
    no_update: AtomicBool,
    no_update_check: AtomicBool,
    watch: AtomicBool,
}

impl RuntimeFlags {
    pub fn no_update(&self) -> bool {
        self.no_update.load(Ordering::SeqCst)
    }

    pub fn set_no_update(&self, value: bool) {
        self.no_update.store(value, Ordering::SeqCst);
    }

    pub fn no_update_check(&self) -> bool {
        self.no_update_check.load(Ordering::SeqCst)
    }

    pub fn set_no_update_check(&self, value: bool) {
        self.no_update_check.store(value, Ordering::SeqCst);
    }

    pub fn watch(&self) -> bool {
        self.watch.load(Ordering::SeqCst)
    }

    pub fn set_watch(&self, value: bool) {
        self.watch.store(value, Ordering::SeqCst);
    }
}

struct ContextInner {
    card: ProductCard,
    mode: RwLock<ExecutionMode>,
    settings: Arc<Mutex<SettingsStore>>,
    flags: RuntimeFlags,
    span: Span,
}

/// What the hooks get to see of the runtime. Cheap to clone.
#[derive(Clone)]
pub struct ServiceContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("identity", &self.inner.card.identity)
            .field("mode", &*self.inner.mode.read())
            .finish_non_exhaustive()
    }
}

impl ServiceContext {
    pub fn new(card: ProductCard, settings: SettingsStore) -> Self {
        let span = tracing::info_span!("service", identity = %card.identity);
        Self {
            inner: Arc::new(ContextInner {
                card,
                mode: RwLock::new(ExecutionMode::default()),
                settings: Arc::new(Mutex::new(settings)),
                flags: RuntimeFlags::default(),
                span,
            }),
        }
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.inner.card.identity
    }

    pub fn card(&self) -> &ProductCard {
        &self.inner.card
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        *self.inner.mode.read()
    }

    pub fn set_execution_mode(&self, mode: ExecutionMode) {
        *self.inner.mode.write() = mode;
    }

    /// The settings store. Callers flush explicitly after mutating.
    pub fn settings(&self) -> &Arc<Mutex<SettingsStore>> {
        &self.inner.settings
    }

    pub fn flags(&self) -> &RuntimeFlags {
        &self.inner.flags
    }

    /// Span carrying the service identity, entered around every hook call.
    pub fn span(&self) -> &Span {
        &self.inner.span
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_schema::Version;

    fn context() -> (tempfile::TempDir, ServiceContext) {
        let dir = tempfile::tempdir().unwrap();
        let settings = SettingsStore::open(dir.path().join("settings.json")).unwrap();
        let card = ProductCard::new(
            ServiceIdentity::new("org.example", "heartbeat").unwrap(),
            "Heartbeat",
            Version::new(1, 0, 0),
        );
        (dir, ServiceContext::new(card, settings))
    }

    #[test]
    fn execution_mode_defaults_to_production() {
        let (_dir, ctx) = context();
        assert_eq!(ctx.execution_mode(), ExecutionMode::Production);
        ctx.set_execution_mode(ExecutionMode::Test);
        assert_eq!(ctx.clone().execution_mode(), ExecutionMode::Test);
    }

    #[test]
    fn clones_share_settings_and_flags() {
        let (_dir, ctx) = context();
        let other = ctx.clone();
        ctx.settings().lock().set("a/b", "1").unwrap();
        ctx.flags().set_watch(true);
        assert_eq!(other.settings().lock().get("a/b"), Some("1"));
        assert!(other.flags().watch());
        assert!(!other.flags().no_update());
    }
}
