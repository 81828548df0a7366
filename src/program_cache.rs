//! Process-wide cache of contexts and compiled programs, keyed by
//! (platform, device).
//!
//! Two-level locking: the cache mutex only guards slot existence, each slot
//! carries its own mutex that serializes production. The producer closure
//! runs while the slot mutex is held, so concurrent requests for the same
//! key trigger at most one compile; everyone else blocks on the slot and
//! then observes the cached value. A failed producer leaves the slot empty
//! and later callers retry.
//!
//! The cache is never torn down in steady state: releasing driver objects
//! from process shutdown hooks crashes some vendor runtimes, so `flush` is
//! only for tests.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::error::{DriverError, DriverResult};
use crate::gpu::GpuContext;

/// Cache key: one platform/device pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub backend: wgpu::Backend,
    pub device_index: u32,
}

/// A compiled translation unit: the shader module plus its named kernels.
pub struct CompiledProgram {
    pub name: String,
    pub module: wgpu::ShaderModule,
    pub pipelines: HashMap<String, wgpu::ComputePipeline>,
    pub pipeline_cache: Option<wgpu::PipelineCache>,
}

impl CompiledProgram {
    pub fn kernel(&self, entry: &str) -> DriverResult<&wgpu::ComputePipeline> {
        self.pipelines.get(entry).ok_or_else(|| {
            DriverError::KernelLaunch(format!("kernel {entry} missing from program {}", self.name))
        })
    }
}

/// Generic single-flight slot store.
pub struct SingleFlightCache<K, V> {
    slots: Mutex<HashMap<K, Arc<Mutex<Option<Arc<V>>>>>>,
}

impl<K: Eq + Hash + Clone, V> SingleFlightCache<K, V> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &K) -> Arc<Mutex<Option<Arc<V>>>> {
        let mut slots = self.slots.lock().unwrap();
        slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
        // cache lock drops here, before anyone waits on the slot
    }

    /// Return the cached value for `key`, or run `produce` to fill it.
    /// `produce` executes under the slot lock (single-flight); on failure
    /// the slot stays empty so the next caller retries.
    pub fn get_or_produce<F>(&self, key: &K, produce: F) -> DriverResult<Arc<V>>
    where
        F: FnOnce() -> DriverResult<Arc<V>>,
    {
        let slot = self.slot(key);
        let mut contents = slot.lock().unwrap();
        if let Some(value) = contents.as_ref() {
            return Ok(value.clone());
        }
        let value = produce()?;
        *contents = Some(value.clone());
        Ok(value)
    }

    /// Peek without producing.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let slot = self.slot(key);
        let contents = slot.lock().unwrap();
        contents.clone()
    }

    pub fn flush(&self) {
        self.slots.lock().unwrap().clear();
    }
}

impl<K: Eq + Hash + Clone, V> Default for SingleFlightCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

static CONTEXTS: Lazy<SingleFlightCache<SlotKey, GpuContext>> = Lazy::new(SingleFlightCache::new);
static PROGRAMS: Lazy<SingleFlightCache<(SlotKey, String), CompiledProgram>> =
    Lazy::new(SingleFlightCache::new);

/// Fetch or produce the shared context for a device.
pub fn with_context<F>(key: SlotKey, produce: F) -> DriverResult<Arc<GpuContext>>
where
    F: FnOnce() -> DriverResult<Arc<GpuContext>>,
{
    CONTEXTS.get_or_produce(&key, produce)
}

/// Fetch or produce a named compiled program for a device.
pub fn with_program<F>(key: SlotKey, name: &str, produce: F) -> DriverResult<Arc<CompiledProgram>>
where
    F: FnOnce() -> DriverResult<Arc<CompiledProgram>>,
{
    PROGRAMS.get_or_produce(&(key, name.to_string()), produce)
}

/// Drop every cached context and program. Not called in steady state.
pub fn flush() {
    PROGRAMS.flush();
    CONTEXTS.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn produces_once_and_caches() {
        let cache: SingleFlightCache<u32, String> = SingleFlightCache::new();
        let calls = AtomicUsize::new(0);

        let first = cache
            .get_or_produce(&7, || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new("value".to_string()))
            })
            .unwrap();
        let second = cache
            .get_or_produce(&7, || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new("other".to_string()))
            })
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn failed_producer_leaves_slot_empty() {
        let cache: SingleFlightCache<u32, String> = SingleFlightCache::new();

        let err = cache.get_or_produce(&1, || {
            Err(DriverError::ContextCreation("boom".into()))
        });
        assert!(err.is_err());
        assert!(cache.get(&1).is_none());

        let ok = cache
            .get_or_produce(&1, || Ok(Arc::new("second try".to_string())))
            .unwrap();
        assert_eq!(ok.as_str(), "second try");
    }

    #[test]
    fn concurrent_requests_are_single_flight() {
        let cache: Arc<SingleFlightCache<u32, u64>> = Arc::new(SingleFlightCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(std::thread::spawn(move || {
                cache
                    .get_or_produce(&42, || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        // widen the race window while the slot lock is held
                        std::thread::sleep(Duration::from_millis(20));
                        Ok(Arc::new(99u64))
                    })
                    .unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(*handle.join().unwrap(), 99);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn distinct_keys_use_distinct_slots() {
        let cache: SingleFlightCache<(u32, String), u32> = SingleFlightCache::new();
        let a = cache
            .get_or_produce(&(0, "base".into()), || Ok(Arc::new(1)))
            .unwrap();
        let b = cache
            .get_or_produce(&(0, "megakernel".into()), || Ok(Arc::new(2)))
            .unwrap();
        assert_eq!((*a, *b), (1, 2));

        cache.flush();
        assert!(cache.get(&(0, "base".into())).is_none());
    }
}
