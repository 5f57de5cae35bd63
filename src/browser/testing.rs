//! In-process browser doubles for pool and service tests.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{BrowserEngine, BrowserLauncher, ExecutionContext};

#[derive(Default)]
struct Counters {
    launched: AtomicUsize,
    engines_closed: AtomicUsize,
    contexts_created: AtomicUsize,
    open_contexts: AtomicUsize,
    next_pid: AtomicU32,
    memory_bytes: AtomicU64,
}

pub(crate) struct FakeLauncher {
    counters: Arc<Counters>,
    launch_delay: Duration,
    page: Arc<Mutex<Value>>,
    engines: Mutex<Vec<Arc<FakeEngine>>>,
}

impl FakeLauncher {
    pub(crate) fn new() -> Self {
        Self::with_launch_delay(Duration::ZERO)
    }

    pub(crate) fn with_launch_delay(launch_delay: Duration) -> Self {
        let counters = Counters::default();
        counters.next_pid.store(40_000, Ordering::SeqCst);
        FakeLauncher {
            counters: Arc::new(counters),
            launch_delay,
            page: Arc::new(Mutex::new(json!({"title": "Fake page", "text": "", "status": null}))),
            engines: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn engines_launched(&self) -> usize {
        self.counters.launched.load(Ordering::SeqCst)
    }

    pub(crate) fn engines_closed(&self) -> usize {
        self.counters.engines_closed.load(Ordering::SeqCst)
    }

    pub(crate) fn contexts_created(&self) -> usize {
        self.counters.contexts_created.load(Ordering::SeqCst)
    }

    pub(crate) fn open_contexts(&self) -> usize {
        self.counters.open_contexts.load(Ordering::SeqCst)
    }

    /// Heap size every context reports from now on.
    pub(crate) fn set_memory_usage(&self, bytes: u64) {
        self.counters.memory_bytes.store(bytes, Ordering::SeqCst);
    }

    /// Value returned by `evaluate` on every context.
    pub(crate) fn set_page(&self, page: Value) {
        *self.page.lock().unwrap() = page;
    }

    pub(crate) fn kill_all(&self) {
        for engine in self.engines.lock().unwrap().iter() {
            engine.alive.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Arc<dyn BrowserEngine>> {
        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }
        self.counters.launched.fetch_add(1, Ordering::SeqCst);
        let engine = Arc::new(FakeEngine {
            pid: self.counters.next_pid.fetch_add(1, Ordering::SeqCst),
            alive: AtomicBool::new(true),
            counters: Arc::clone(&self.counters),
            page: Arc::clone(&self.page),
        });
        self.engines.lock().unwrap().push(Arc::clone(&engine));
        Ok(engine)
    }
}

pub(crate) struct FakeEngine {
    pid: u32,
    alive: AtomicBool,
    counters: Arc<Counters>,
    page: Arc<Mutex<Value>>,
}

#[async_trait]
impl BrowserEngine for FakeEngine {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn new_context(&self) -> Result<Box<dyn ExecutionContext>> {
        if !self.is_alive() {
            bail!("engine {} is dead", self.pid);
        }
        let n = self.counters.contexts_created.fetch_add(1, Ordering::SeqCst);
        self.counters.open_contexts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeContext {
            id: format!("ctx-{}-{}", self.pid, n),
            counters: Arc::clone(&self.counters),
            page: Arc::clone(&self.page),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        self.counters.engines_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct FakeContext {
    id: String,
    counters: Arc<Counters>,
    page: Arc<Mutex<Value>>,
    closed: AtomicBool,
}

#[async_trait]
impl ExecutionContext for FakeContext {
    fn id(&self) -> &str {
        &self.id
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        if url.contains("fail") {
            bail!("net::ERR_NAME_NOT_RESOLVED at {}", url);
        }
        Ok(())
    }

    async fn evaluate(&self, _expression: &str) -> Result<Value> {
        Ok(self.page.lock().unwrap().clone())
    }

    async fn memory_usage(&self) -> Result<u64> {
        Ok(self.counters.memory_bytes.load(Ordering::SeqCst))
    }

    async fn reset(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.counters.open_contexts.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
