//! A live engine instance and its busy accounting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use lmn_domain::model::{DeviceClass, ModelEntry, ModelType};
use lmn_domain::options::RecipeOptions;
use lmn_engines::Engine;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Busy tracking
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Active-request count plus a notify for waiters. "Busy" means at least
/// one in-flight call; eviction waits for the count to reach zero. The
/// count (rather than a flag) is what lets concurrent inference on one
/// instance coexist with the eviction guarantee.
#[derive(Default)]
struct BusyState {
    active: Mutex<u32>,
    idle: Notify,
}

/// Guard for one in-flight call. Dropping it decrements the count and
/// wakes eviction waiters, including on panic or error return.
pub struct BusyGuard {
    state: Arc<BusyState>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut active = self.state.active.lock();
        *active -= 1;
        if *active == 0 {
            self.state.idle.notify_waiters();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Instance
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Telemetry from the most recent requests, served by `/stats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstanceStats {
    pub requests: u64,
    pub failures: u64,
    pub last_latency_ms: u64,
}

/// One resident adapter and the metadata the scheduler tracks for it.
pub struct EngineInstance {
    name: String,
    checkpoint: String,
    model_type: ModelType,
    device_class: DeviceClass,
    options: RecipeOptions,
    engine: Box<dyn Engine>,
    started_at: Instant,
    last_access: Mutex<Instant>,
    stats: Mutex<InstanceStats>,
    busy: Arc<BusyState>,
}

impl EngineInstance {
    pub fn new(entry: &ModelEntry, options: RecipeOptions, engine: Box<dyn Engine>) -> Self {
        Self {
            name: entry.name.clone(),
            checkpoint: entry.main_checkpoint().to_string(),
            model_type: entry.model_type,
            device_class: entry.device_class,
            options,
            engine,
            started_at: Instant::now(),
            last_access: Mutex::new(Instant::now()),
            stats: Mutex::new(InstanceStats::default()),
            busy: Arc::new(BusyState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn checkpoint(&self) -> &str {
        &self.checkpoint
    }

    pub fn model_type(&self) -> ModelType {
        self.model_type
    }

    pub fn device_class(&self) -> DeviceClass {
        self.device_class
    }

    pub fn options(&self) -> &RecipeOptions {
        &self.options
    }

    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Update `last_access`. Called at load start/completion and around
    /// every inference.
    pub fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    pub fn last_access(&self) -> Instant {
        *self.last_access.lock()
    }

    /// Mark one in-flight call. The returned guard must live for the
    /// duration of the call.
    pub fn begin_work(&self) -> BusyGuard {
        *self.busy.active.lock() += 1;
        BusyGuard {
            state: self.busy.clone(),
        }
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.active.lock() > 0
    }

    /// Wait until no call is in flight. The caller must have removed the
    /// instance from dispatch first, or new work can slip in behind the
    /// wait.
    pub async fn wait_idle(&self) {
        loop {
            let waiter = self.busy.idle.notified();
            if !self.is_busy() {
                return;
            }
            waiter.await;
        }
    }

    pub fn record_request(&self, latency: Duration, ok: bool) {
        let mut stats = self.stats.lock();
        stats.requests += 1;
        if !ok {
            stats.failures += 1;
        }
        stats.last_latency_ms = latency.as_millis() as u64;
    }

    pub fn stats(&self) -> InstanceStats {
        *self.stats.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmn_domain::model::Recipe;
    use lmn_domain::Result;
    use serde_json::Value;

    struct NoopEngine;

    #[async_trait::async_trait]
    impl Engine for NoopEngine {
        fn recipe(&self) -> Recipe {
            Recipe::LlamaCpp
        }
        fn capabilities(&self) -> &'static [lmn_engines::Operation] {
            &[]
        }
        async fn load(&self, _ctx: &lmn_engines::LoadContext) -> Result<()> {
            Ok(())
        }
        async fn unload(&self) -> Result<()> {
            Ok(())
        }
        async fn forward_json(
            &self,
            _op: lmn_engines::Operation,
            _body: Value,
        ) -> Result<Value> {
            Ok(Value::Null)
        }
        async fn forward_stream(
            &self,
            _op: lmn_engines::Operation,
            _body: Vec<u8>,
        ) -> Result<lmn_engines::ByteStream> {
            unimplemented!("not exercised")
        }
    }

    fn instance() -> EngineInstance {
        let entry = ModelEntry::new("m", Recipe::LlamaCpp, "org/repo");
        EngineInstance::new(&entry, RecipeOptions::default(), Box::new(NoopEngine))
    }

    #[test]
    fn busy_counts_nest() {
        let inst = instance();
        assert!(!inst.is_busy());
        let g1 = inst.begin_work();
        let g2 = inst.begin_work();
        assert!(inst.is_busy());
        drop(g1);
        assert!(inst.is_busy());
        drop(g2);
        assert!(!inst.is_busy());
    }

    #[tokio::test]
    async fn wait_idle_returns_immediately_when_free() {
        let inst = instance();
        inst.wait_idle().await;
    }

    #[tokio::test]
    async fn wait_idle_blocks_until_guard_drops() {
        let inst = Arc::new(instance());
        let guard = inst.begin_work();

        let waiter = {
            let inst = inst.clone();
            tokio::spawn(async move {
                inst.wait_idle().await;
                42
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        assert_eq!(waiter.await.unwrap(), 42);
    }

    #[test]
    fn touch_advances_last_access() {
        let inst = instance();
        let before = inst.last_access();
        std::thread::sleep(Duration::from_millis(5));
        inst.touch();
        assert!(inst.last_access() > before);
    }

    #[test]
    fn stats_accumulate() {
        let inst = instance();
        inst.record_request(Duration::from_millis(12), true);
        inst.record_request(Duration::from_millis(20), false);
        let stats = inst.stats();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.last_latency_ms, 20);
    }
}
