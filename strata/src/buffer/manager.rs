//! Pin accounting, residency and eviction
//!
//! Bookkeeping (pins, resident set, LRU) lives under one state lock that is
//! never held across I/O. Each node additionally has an I/O lock guarding its
//! `loaded` flag; load and unload run under it so concurrent pinners of the
//! same node wait for a single load. Lock order is I/O lock, then state lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::lru::LruList;
use super::stats::{BufferStats, BufferStatsSnapshot};
use super::{BufferNode, NodeKey};
use crate::{Result, StrataError};

struct Entry {
    node: Arc<dyn BufferNode>,
    pins: u32,
    /// Charged against the budget; may run ahead of `loaded` while a load is in flight
    resident: bool,
    charged: u64,
    /// true once the data is in memory
    io: Arc<Mutex<bool>>,
}

#[derive(Default)]
struct ManagerState {
    nodes: HashMap<NodeKey, Entry>,
    /// Resident nodes with no pins
    lru: LruList<NodeKey>,
    resident_bytes: u64,
}

/// A node taken off the resident set, to be unloaded outside the state lock
struct Victim {
    key: NodeKey,
    node: Arc<dyn BufferNode>,
    io: Arc<Mutex<bool>>,
}

struct Inner {
    budget: u64,
    state: Mutex<ManagerState>,
    stats: BufferStats,
}

/// Bounded pool of block data; cheap to clone
#[derive(Clone)]
pub struct NodeManager {
    inner: Arc<Inner>,
}

impl NodeManager {
    pub fn new(budget: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                budget,
                state: Mutex::new(ManagerState::default()),
                stats: BufferStats::new(),
            }),
        }
    }

    pub fn budget(&self) -> u64 {
        self.inner.budget
    }

    /// Track a node; it starts out not resident
    pub fn register(&self, node: Arc<dyn BufferNode>) -> Result<()> {
        let key = node.key();
        let mut state = self.inner.state.lock();
        if state.nodes.contains_key(&key) {
            return Err(StrataError::InvalidState(format!("node {} already registered", key)));
        }
        state.nodes.insert(
            key,
            Entry { node, pins: 0, resident: false, charged: 0, io: Arc::new(Mutex::new(false)) },
        );
        Ok(())
    }

    /// Stop tracking a node without persisting it
    pub fn unregister(&self, key: NodeKey) -> Result<()> {
        let mut state = self.inner.state.lock();
        match state.nodes.get(&key) {
            None => return Err(StrataError::NotFound(format!("node {}", key))),
            Some(e) if e.pins > 0 => {
                return Err(StrataError::InvalidState(format!(
                    "node {} is pinned ({} pins)",
                    key, e.pins
                )))
            }
            Some(_) => {}
        }
        if let Some(entry) = state.nodes.remove(&key) {
            if entry.resident {
                state.resident_bytes -= entry.charged;
            }
        }
        state.lru.remove(&key);
        Ok(())
    }

    /// Pin `key`, loading it first if it is not in memory
    pub fn pin(&self, key: NodeKey) -> Result<NodeHandle> {
        let (node, io, victims) = self.reserve(key)?;

        if let Err(e) = self.unload_victims(victims) {
            self.unpin_failed(key, &io);
            return Err(e);
        }

        let mut loaded = io.lock();
        if !*loaded {
            if let Err(e) = node.load() {
                log::error!("failed to load node {}: {}", key, e);
                drop(loaded);
                self.unpin_failed(key, &io);
                return Err(e);
            }
            *loaded = true;
            self.inner.stats.record_load();
            log::debug!("loaded node {} ({} bytes)", key, node.size());
        }
        drop(loaded);

        self.inner.stats.record_pin();
        Ok(NodeHandle { inner: Arc::clone(&self.inner), key, node, closed: false })
    }

    /// Take a pin and, for a non-resident node, charge it and pick victims
    fn reserve(
        &self,
        key: NodeKey,
    ) -> Result<(Arc<dyn BufferNode>, Arc<Mutex<bool>>, Vec<Victim>)> {
        let budget = self.inner.budget;
        let mut guard = self.inner.state.lock();
        let ManagerState { nodes, lru, resident_bytes } = &mut *guard;

        let entry = nodes
            .get_mut(&key)
            .ok_or_else(|| StrataError::NotFound(format!("node {}", key)))?;
        entry.pins += 1;
        lru.remove(&key);
        let node = Arc::clone(&entry.node);
        let io = Arc::clone(&entry.io);
        if entry.resident {
            return Ok((node, io, Vec::new()));
        }

        let need = node.size();
        let mut victims = Vec::new();
        while *resident_bytes + need > budget {
            let Some(victim_key) = lru.pop_lru() else { break };
            let Some(victim) = nodes.get_mut(&victim_key) else { continue };
            victim.resident = false;
            *resident_bytes -= victim.charged;
            victims.push(Victim {
                key: victim_key,
                node: Arc::clone(&victim.node),
                io: Arc::clone(&victim.io),
            });
        }

        if *resident_bytes + need > budget {
            // give everything back
            for v in victims {
                if let Some(e) = nodes.get_mut(&v.key) {
                    e.resident = true;
                    *resident_bytes += e.charged;
                    lru.touch(v.key);
                }
            }
            if let Some(e) = nodes.get_mut(&key) {
                e.pins -= 1;
            }
            self.inner.stats.record_exhausted();
            log::warn!("buffer exhausted pinning node {}: {} bytes, budget {}", key, need, budget);
            return Err(StrataError::BufferExhausted { requested: need, budget });
        }

        if let Some(e) = nodes.get_mut(&key) {
            e.resident = true;
            e.charged = need;
        }
        *resident_bytes += need;
        self.inner.stats.record_resident(*resident_bytes);
        Ok((node, io, victims))
    }

    fn unload_victims(&self, victims: Vec<Victim>) -> Result<()> {
        let mut result = Ok(());
        for v in victims {
            let mut loaded = v.io.lock();
            if self.was_reclaimed(v.key) {
                // pinned again before we got here
                continue;
            }
            if result.is_err() {
                if *loaded {
                    self.restore_victim(&v);
                }
                continue;
            }
            if !*loaded {
                continue;
            }
            match v.node.unload() {
                Ok(()) => {
                    *loaded = false;
                    self.inner.stats.record_unload(true);
                    log::debug!("evicted node {}", v.key);
                }
                Err(e) => {
                    log::error!("failed to unload node {}: {}", v.key, e);
                    self.restore_victim(&v);
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Whether a victim went back into the resident set (or away) after being picked
    fn was_reclaimed(&self, key: NodeKey) -> bool {
        self.inner.state.lock().nodes.get(&key).map(|e| e.resident).unwrap_or(true)
    }

    /// Put a victim whose data is still in memory back into the resident set
    fn restore_victim(&self, victim: &Victim) {
        let mut state = self.inner.state.lock();
        let ManagerState { nodes, lru, resident_bytes } = &mut *state;
        if let Some(e) = nodes.get_mut(&victim.key) {
            if !e.resident {
                e.resident = true;
                e.charged = victim.node.size();
                *resident_bytes += e.charged;
            }
            if e.pins == 0 {
                lru.touch(victim.key);
            }
        }
    }

    /// Undo a pin whose load or eviction failed
    fn unpin_failed(&self, key: NodeKey, io: &Mutex<bool>) {
        let loaded = *io.lock();
        let mut state = self.inner.state.lock();
        let ManagerState { nodes, lru, resident_bytes } = &mut *state;
        if let Some(e) = nodes.get_mut(&key) {
            e.pins -= 1;
            if e.resident && !loaded {
                e.resident = false;
                *resident_bytes -= e.charged;
            }
            if e.pins == 0 && e.resident {
                lru.touch(key);
            }
        }
    }

    /// Unload an unpinned node now
    ///
    /// # Panics
    /// If the node is pinned.
    pub fn unload(&self, key: NodeKey) -> Result<()> {
        let victim = {
            let mut state = self.inner.state.lock();
            let ManagerState { nodes, lru, resident_bytes } = &mut *state;
            let e = nodes
                .get_mut(&key)
                .ok_or_else(|| StrataError::NotFound(format!("node {}", key)))?;
            assert!(e.pins == 0, "unloading pinned node {} ({} pins)", key, e.pins);
            if !e.resident {
                return Ok(());
            }
            e.resident = false;
            *resident_bytes -= e.charged;
            lru.remove(&key);
            Victim { key, node: Arc::clone(&e.node), io: Arc::clone(&e.io) }
        };

        let mut loaded = victim.io.lock();
        if self.was_reclaimed(key) || !*loaded {
            return Ok(());
        }
        match victim.node.unload() {
            Ok(()) => {
                *loaded = false;
                self.inner.stats.record_unload(false);
                log::debug!("unloaded node {}", key);
                Ok(())
            }
            Err(e) => {
                self.restore_victim(&victim);
                Err(e)
            }
        }
    }

    /// Unload unpinned nodes until resident bytes fit the budget
    pub fn evict_to_budget(&self) -> Result<usize> {
        let victims = {
            let mut state = self.inner.state.lock();
            let ManagerState { nodes, lru, resident_bytes } = &mut *state;
            let mut victims = Vec::new();
            while *resident_bytes > self.inner.budget {
                let Some(key) = lru.pop_lru() else { break };
                let Some(e) = nodes.get_mut(&key) else { continue };
                e.resident = false;
                *resident_bytes -= e.charged;
                victims.push(Victim { key, node: Arc::clone(&e.node), io: Arc::clone(&e.io) });
            }
            victims
        };
        let count = victims.len();
        self.unload_victims(victims)?;
        Ok(count)
    }

    pub fn pin_count(&self, key: NodeKey) -> u32 {
        self.inner.state.lock().nodes.get(&key).map(|e| e.pins).unwrap_or(0)
    }

    pub fn is_resident(&self, key: NodeKey) -> bool {
        self.inner.state.lock().nodes.get(&key).map(|e| e.resident).unwrap_or(false)
    }

    pub fn resident_bytes(&self) -> u64 {
        self.inner.state.lock().resident_bytes
    }

    pub fn node_count(&self) -> usize {
        self.inner.state.lock().nodes.len()
    }

    pub fn stats(&self) -> BufferStatsSnapshot {
        self.inner.stats.snapshot()
    }
}

impl Inner {
    fn unpin(&self, key: NodeKey) {
        let mut state = self.state.lock();
        let ManagerState { nodes, lru, resident_bytes } = &mut *state;
        let Some(e) = nodes.get_mut(&key) else { return };
        debug_assert!(e.pins > 0, "unpin of unpinned node {}", key);
        e.pins = e.pins.saturating_sub(1);
        if e.pins == 0 && e.resident {
            // appends may have grown the node while it was pinned
            let size = e.node.size();
            *resident_bytes = *resident_bytes - e.charged + size;
            e.charged = size;
            lru.touch(key);
        }
    }
}

/// A pin on a node; unpins on `close` or drop
pub struct NodeHandle {
    inner: Arc<Inner>,
    key: NodeKey,
    node: Arc<dyn BufferNode>,
    closed: bool,
}

impl NodeHandle {
    pub fn key(&self) -> NodeKey {
        self.key
    }

    pub fn node(&self) -> &Arc<dyn BufferNode> {
        &self.node
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.inner.unpin(self.key);
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle").field("key", &self.key).finish()
    }
}
