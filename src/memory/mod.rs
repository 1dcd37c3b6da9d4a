// # Memory Contexts
//
// Hierarchical allocation scopes. Every transient allocation is charged
// to a context; resetting a context releases everything charged to it
// and, recursively, to its children. This is the recovery mechanism on
// error: aborting a transaction resets the transaction context subtree
// instead of hunting down individual allocations.
//
// Contexts form a tree rooted at the top context created by process
// startup:
//
// ```text
// top
// └── transaction
//     └── query
//         └── per-operator scratch
// ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::error::{DbError, Result};

/// Statistics snapshot for one context (not including children).
#[derive(Debug, Clone, Default)]
pub struct MemoryContextStats {
    pub name: String,
    pub bytes_allocated: usize,
    pub peak_bytes: usize,
    pub allocation_count: u64,
    pub reset_count: u64,
    pub children: usize,
}

/// One node of the context tree.
///
/// A context owns retained scratch buffers and tracks accounting for
/// allocations made "in" it. `reset` drops the buffers and zeroes the
/// accounting for this context and its children; `delete` additionally
/// detaches the context from its parent.
pub struct MemoryContext {
    name: String,
    parent: Weak<MemoryContext>,
    children: RwLock<Vec<Arc<MemoryContext>>>,
    buffers: Mutex<Vec<Box<[u8]>>>,
    bytes_allocated: AtomicUsize,
    peak_bytes: AtomicUsize,
    allocation_count: AtomicU64,
    reset_count: AtomicU64,
    active: AtomicBool,
}

impl MemoryContext {
    /// Create a root context.
    pub fn new_root(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            parent: Weak::new(),
            children: RwLock::new(Vec::new()),
            buffers: Mutex::new(Vec::new()),
            bytes_allocated: AtomicUsize::new(0),
            peak_bytes: AtomicUsize::new(0),
            allocation_count: AtomicU64::new(0),
            reset_count: AtomicU64::new(0),
            active: AtomicBool::new(true),
        })
    }

    /// Create a child of `self`.
    pub fn child(self: &Arc<Self>, name: impl Into<String>) -> Arc<Self> {
        let child = Arc::new(Self {
            name: name.into(),
            parent: Arc::downgrade(self),
            children: RwLock::new(Vec::new()),
            buffers: Mutex::new(Vec::new()),
            bytes_allocated: AtomicUsize::new(0),
            peak_bytes: AtomicUsize::new(0),
            allocation_count: AtomicU64::new(0),
            reset_count: AtomicU64::new(0),
            active: AtomicBool::new(true),
        });
        self.children.write().push(child.clone());
        child
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Allocate a zeroed scratch buffer retained by this context. The
    /// buffer lives until the context is reset or deleted.
    pub fn alloc(&self, size: usize) -> Result<ContextBuffer<'_>> {
        if !self.is_active() {
            return Err(DbError::Memory(format!(
                "allocation in deleted context '{}'",
                self.name
            )));
        }
        self.charge(size);
        let mut buffers = self.buffers.lock();
        buffers.push(vec![0u8; size].into_boxed_slice());
        Ok(ContextBuffer {
            context: self,
            index: buffers.len() - 1,
        })
    }

    /// Record `size` bytes of caller-owned allocation against this
    /// context. Pure accounting; pairs with [`MemoryContext::uncharge`].
    pub fn charge(&self, size: usize) {
        let now = self.bytes_allocated.fetch_add(size, Ordering::AcqRel) + size;
        self.allocation_count.fetch_add(1, Ordering::Relaxed);
        self.peak_bytes.fetch_max(now, Ordering::AcqRel);
    }

    pub fn uncharge(&self, size: usize) {
        self.bytes_allocated.fetch_sub(size, Ordering::AcqRel);
    }

    /// Release everything charged to this context and its children.
    /// The contexts themselves stay usable.
    pub fn reset(&self) {
        self.buffers.lock().clear();
        self.bytes_allocated.store(0, Ordering::Release);
        self.reset_count.fetch_add(1, Ordering::Relaxed);
        for child in self.children.read().iter() {
            child.reset();
        }
    }

    /// Reset, mark inactive, and detach from the parent. Children are
    /// deleted recursively.
    pub fn delete(self: &Arc<Self>) {
        for child in self.children.write().drain(..) {
            child.delete_detached();
        }
        self.buffers.lock().clear();
        self.bytes_allocated.store(0, Ordering::Release);
        self.active.store(false, Ordering::Release);
        if let Some(parent) = self.parent.upgrade() {
            parent
                .children
                .write()
                .retain(|c| !Arc::ptr_eq(c, self));
        }
    }

    fn delete_detached(self: Arc<Self>) {
        for child in self.children.write().drain(..) {
            child.delete_detached();
        }
        self.buffers.lock().clear();
        self.bytes_allocated.store(0, Ordering::Release);
        self.active.store(false, Ordering::Release);
    }

    /// Bytes currently charged to this context alone.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.load(Ordering::Acquire)
    }

    /// Bytes charged to this context and all descendants.
    pub fn bytes_allocated_recursive(&self) -> usize {
        let mut total = self.bytes_allocated();
        for child in self.children.read().iter() {
            total += child.bytes_allocated_recursive();
        }
        total
    }

    pub fn stats(&self) -> MemoryContextStats {
        MemoryContextStats {
            name: self.name.clone(),
            bytes_allocated: self.bytes_allocated(),
            peak_bytes: self.peak_bytes.load(Ordering::Acquire),
            allocation_count: self.allocation_count.load(Ordering::Relaxed),
            reset_count: self.reset_count.load(Ordering::Relaxed),
            children: self.children.read().len(),
        }
    }
}

impl std::fmt::Debug for MemoryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryContext")
            .field("name", &self.name)
            .field("bytes", &self.bytes_allocated())
            .field("active", &self.is_active())
            .finish()
    }
}

/// Handle to a buffer retained inside a context. Indexes are stable
/// until the context is reset.
pub struct ContextBuffer<'a> {
    context: &'a MemoryContext,
    index: usize,
}

impl ContextBuffer<'_> {
    /// Run `f` over the buffer contents.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut buffers = self.context.buffers.lock();
        f(&mut buffers[self.index])
    }

    pub fn len(&self) -> usize {
        self.context.buffers.lock()[self.index].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
