use dfs_lib::ByteArrayManagerConfig;
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub fresh: u64,
    pub reused: u64,
    pub recycled: u64,
}

struct SizeClass {
    window_start: Instant,
    allocations: u32,
    free: Vec<Vec<u8>>,
}

impl SizeClass {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            allocations: 0,
            free: Vec::new(),
        }
    }

    fn roll_window(&mut self, now: Instant, period: Duration) {
        if now.duration_since(self.window_start) >= period {
            self.window_start = now;
            self.allocations = 0;
        }
    }
}

/// Packet buffer allocator with power-of-two size classes.
///
/// A class starts recycling released buffers once it has seen
/// `count_threshold` allocations in the current window, and stops (dropping
/// what it holds) once the window count passes `count_limit`.
pub struct BufferPool {
    enabled: bool,
    count_threshold: u32,
    count_limit: u32,
    reset_period: Duration,
    classes: Mutex<HashMap<u32, SizeClass>>,
    fresh: AtomicU64,
    reused: AtomicU64,
    recycled: AtomicU64,
}

fn class_of(capacity: usize) -> u32 {
    capacity.trailing_zeros()
}

impl BufferPool {
    pub fn new(config: &ByteArrayManagerConfig) -> Self {
        Self {
            enabled: config.enabled,
            count_threshold: config.count_threshold,
            count_limit: config.count_limit,
            reset_period: Duration::from_millis(config.count_reset_time_period_ms),
            classes: Mutex::new(HashMap::new()),
            fresh: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self::new(&ByteArrayManagerConfig::default())
    }

    /// Returns an empty buffer with capacity for at least `size` bytes.
    pub fn allocate(&self, size: usize) -> Vec<u8> {
        if !self.enabled || size == 0 {
            self.fresh.fetch_add(1, Ordering::Relaxed);
            return Vec::with_capacity(size);
        }

        let capacity = size.next_power_of_two();
        let now = Instant::now();
        {
            let mut classes = match self.classes.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let class = classes
                .entry(class_of(capacity))
                .or_insert_with(|| SizeClass::new(now));
            class.roll_window(now, self.reset_period);
            class.allocations = class.allocations.saturating_add(1);

            if class.allocations > self.count_limit {
                if !class.free.is_empty() {
                    debug!(
                        "buffer class {} over limit {}, dropping {} pooled buffers",
                        capacity,
                        self.count_limit,
                        class.free.len()
                    );
                    class.free.clear();
                }
            } else if let Some(buf) = class.free.pop() {
                self.reused.fetch_add(1, Ordering::Relaxed);
                return buf;
            }
        }

        self.fresh.fetch_add(1, Ordering::Relaxed);
        Vec::with_capacity(capacity)
    }

    pub fn release(&self, mut buf: Vec<u8>) {
        let capacity = buf.capacity();
        if !self.enabled || capacity == 0 || !capacity.is_power_of_two() {
            return;
        }

        let now = Instant::now();
        let mut classes = match self.classes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let class = classes
            .entry(class_of(capacity))
            .or_insert_with(|| SizeClass::new(now));
        class.roll_window(now, self.reset_period);

        if class.allocations >= self.count_threshold
            && class.allocations <= self.count_limit
            && class.free.len() < self.count_limit as usize
        {
            buf.clear();
            class.free.push(buf);
            self.recycled.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            fresh: self.fresh.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
        }
    }
}
