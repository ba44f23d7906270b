//! Browser seam.
//!
//! [`BrowsingContext`] is one isolated tab (own cookies, own storage) driven by
//! the orchestrator and the candidate source. [`ContextFactory`] opens them.
//! [`ContextPool`] bounds how many are open at once across the whole run.
//!
//! Every context handed out is wrapped in a guard that closes it when dropped,
//! so cancelled or timed-out phases never leak a tab.

pub mod chrome;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use placecrawl_common::file_config::ResourceKind;

pub use chrome::{BrowserBackend, ChromeBrowser};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BrowsingContext: Send + Sync {
    /// Abort requests of these kinds. Must be called before `navigate`.
    async fn block_resources(&self, kinds: &[ResourceKind]) -> Result<()>;

    async fn navigate(&self, url: &str) -> Result<()>;

    /// Poll until `selector` matches. `false` when `timeout` elapses first.
    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<bool>;

    /// Number of elements currently matching `selector`.
    async fn count(&self, selector: &str) -> Result<usize>;

    /// Scroll `container` (the document when `None`) to its end and return
    /// its scroll extent afterwards.
    async fn scroll_to_end(&self, container: Option<&str>) -> Result<u64>;

    /// Click the first match. `false` when nothing matches.
    async fn click(&self, selector: &str) -> Result<bool>;

    /// Serialized DOM of the current document.
    async fn html(&self) -> Result<String>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait ContextFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn BrowsingContext>>;
}

// ---------------------------------------------------------------------------
// ContextGuard
// ---------------------------------------------------------------------------

/// Owns an open context. `close()` awaits the shutdown; dropping without
/// closing schedules it on the runtime the guard was created on. A pool lease
/// attached to the guard is held until the close has finished.
pub struct ContextGuard {
    context: Arc<dyn BrowsingContext>,
    closed: bool,
    runtime: Option<tokio::runtime::Handle>,
    lease: Option<Lease>,
}

impl ContextGuard {
    pub fn new(context: Box<dyn BrowsingContext>) -> Self {
        Self {
            context: Arc::from(context),
            closed: false,
            runtime: tokio::runtime::Handle::try_current().ok(),
            lease: None,
        }
    }

    fn leased(context: Box<dyn BrowsingContext>, lease: Lease) -> Self {
        Self {
            context: Arc::from(context),
            closed: false,
            runtime: tokio::runtime::Handle::try_current().ok(),
            lease: Some(lease),
        }
    }

    pub fn context(&self) -> &dyn BrowsingContext {
        self.context.as_ref()
    }

    pub async fn close(mut self) {
        self.closed = true;
        if let Err(e) = self.context.close().await {
            warn!(error = %e, "Failed to close browsing context");
        }
        drop(self.lease.take());
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let context = self.context.clone();
        let lease = self.lease.take();
        match &self.runtime {
            Some(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = context.close().await {
                        debug!(error = %e, "Deferred context close failed");
                    }
                    drop(lease);
                });
            }
            None => warn!("Browsing context dropped outside a runtime; not closed"),
        }
    }
}

// ---------------------------------------------------------------------------
// ContextPool
// ---------------------------------------------------------------------------

/// Counting pool over browsing contexts. Cloning shares the same permits.
#[derive(Clone)]
pub struct ContextPool {
    factory: Arc<dyn ContextFactory>,
    permits: Arc<Semaphore>,
    limit: usize,
    open: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ContextPool {
    pub fn new(factory: Arc<dyn ContextFactory>, limit: usize) -> Self {
        Self {
            factory,
            permits: Arc::new(Semaphore::new(limit)),
            limit,
            open: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Pooled contexts currently checked out.
    pub fn in_use(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Highest number of pooled contexts held at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Wait for a free permit, then open a fresh context.
    pub async fn acquire(&self) -> Result<PooledContext> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow::anyhow!("Context pool closed"))?;

        let context = self.factory.open().await?;
        let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let lease = Lease {
            _checkout: Checkout(self.open.clone()),
            _permit: permit,
        };
        Ok(PooledContext {
            guard: ContextGuard::leased(context, lease),
        })
    }
}

/// A context checked out of the pool. Its permit returns to the pool only
/// once the tab is closed, including closes deferred by cancellation.
pub struct PooledContext {
    guard: ContextGuard,
}

impl PooledContext {
    pub fn context(&self) -> &dyn BrowsingContext {
        self.guard.context()
    }

    pub async fn close(self) {
        self.guard.close().await;
    }
}

struct Lease {
    _checkout: Checkout,
    _permit: OwnedSemaphorePermit,
}

struct Checkout(Arc<AtomicUsize>);

impl Drop for Checkout {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
