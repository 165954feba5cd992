//! Minimal reactive cell with microtask-batched notification.
//!
//! This is the crate's only reactive primitive — deliberately not bound to
//! any UI framework's signal graph (that binding is explicitly out of scope,
//! spec.md §1). It exists purely to drive [`crate::observer::QueryObserver`]
//! and friends off of [`crate::storage::Storage`] writes.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Handle returned by [`Signal::subscribe`], used to later [`Signal::unsubscribe`].
    pub struct ListenerKey;
}

trait Flush {
    fn flush(&self);
}

#[derive(Default)]
struct Scheduler {
    queue: Vec<Rc<dyn Flush>>,
    flush_pending: bool,
}

thread_local! {
    static SCHEDULER: RefCell<Scheduler> = RefCell::new(Scheduler::default());
}

fn schedule(entry: Rc<dyn Flush>) {
    SCHEDULER.with(|scheduler| {
        let mut scheduler = scheduler.borrow_mut();
        scheduler.queue.push(entry);
        if !scheduler.flush_pending {
            scheduler.flush_pending = true;
            tokio::task::spawn_local(async {
                run_flush_cycle();
            });
        }
    });
}

fn run_flush_cycle() {
    loop {
        let batch = SCHEDULER.with(|scheduler| {
            let mut scheduler = scheduler.borrow_mut();
            if scheduler.queue.is_empty() {
                scheduler.flush_pending = false;
                return Vec::new();
            }
            std::mem::take(&mut scheduler.queue)
        });
        if batch.is_empty() {
            break;
        }
        for entry in batch {
            entry.flush();
        }
    }
}

/// Yields control back to the local task set a few times so that any
/// pending signal flushes run before this returns.
///
/// The microtask flush is scheduled via `spawn_local`; ordinary `.await`
/// points in caller code usually let it run anyway, but tests that want a
/// deterministic checkpoint can `.await` this directly.
pub async fn settle() {
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
}

struct SignalInner<T> {
    value: RefCell<T>,
    listeners: RefCell<SlotMap<ListenerKey, Box<dyn Fn(&T)>>>,
    order: RefCell<Vec<ListenerKey>>,
    scheduled: Cell<bool>,
    on_active: RefCell<Option<Box<dyn Fn()>>>,
    on_inactive: RefCell<Option<Box<dyn Fn()>>>,
}

impl<T: 'static> Flush for SignalInner<T> {
    fn flush(&self) {
        self.scheduled.set(false);
        let value = self.value.borrow();
        let order = self.order.borrow();
        let listeners = self.listeners.borrow();
        for key in order.iter() {
            if let Some(listener) = listeners.get(*key) {
                listener(&value);
            }
        }
    }
}

/// A single-value reactive cell.
///
/// `set` is a no-op when the new value structurally equals the current one
/// (the Rust analogue of the spec's same-reference skip: freshly constructed
/// values are compared by `PartialEq` rather than by pointer identity, since
/// ownership makes pointer identity a weaker signal here than in a GC'd
/// language). Multiple `set` calls within one synchronous stretch of code
/// coalesce into a single notification carrying the final value, flushed on
/// the next turn of the local task set.
pub struct Signal<T> {
    inner: Rc<SignalInner<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Signal {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Signal<T> {
    pub fn new(value: T) -> Self {
        Signal {
            inner: Rc::new(SignalInner {
                value: RefCell::new(value),
                listeners: RefCell::new(SlotMap::with_key()),
                order: RefCell::new(Vec::new()),
                scheduled: Cell::new(false),
                on_active: RefCell::new(None),
                on_inactive: RefCell::new(None),
            }),
        }
    }

    /// Registers hooks fired at the size-0↔size-1 listener transitions.
    pub fn on_lifecycle(&self, on_active: impl Fn() + 'static, on_inactive: impl Fn() + 'static) {
        *self.inner.on_active.borrow_mut() = Some(Box::new(on_active));
        *self.inner.on_inactive.borrow_mut() = Some(Box::new(on_inactive));
    }

    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.inner.value.borrow().clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.value.borrow())
    }

    pub fn set(&self, value: T)
    where
        T: PartialEq,
    {
        {
            let current = self.inner.value.borrow();
            if *current == value {
                return;
            }
        }
        *self.inner.value.borrow_mut() = value;
        self.mark_dirty();
    }

    /// Updates the value in place and always schedules a notification,
    /// regardless of whether the result is equal to the prior value. Useful
    /// when `T` doesn't implement `PartialEq` cheaply or the caller already
    /// knows the update is meaningful.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.inner.value.borrow_mut());
        self.mark_dirty();
    }

    fn mark_dirty(&self) {
        if self.inner.scheduled.replace(true) {
            return;
        }
        schedule(self.inner.clone());
    }

    pub fn subscribe(&self, listener: impl Fn(&T) + 'static) -> ListenerKey {
        let key = self
            .inner
            .listeners
            .borrow_mut()
            .insert(Box::new(listener));
        let was_empty = {
            let mut order = self.inner.order.borrow_mut();
            let was_empty = order.is_empty();
            order.push(key);
            was_empty
        };
        if was_empty {
            if let Some(on_active) = self.inner.on_active.borrow().as_ref() {
                on_active();
            }
        }
        key
    }

    pub fn unsubscribe(&self, key: ListenerKey) -> bool {
        let removed = self.inner.listeners.borrow_mut().remove(key).is_some();
        if removed {
            let mut order = self.inner.order.borrow_mut();
            order.retain(|k| *k != key);
            if order.is_empty() {
                drop(order);
                if let Some(on_inactive) = self.inner.on_inactive.borrow().as_ref() {
                    on_inactive();
                }
            }
        }
        removed
    }

    pub fn is_watched(&self) -> bool {
        !self.inner.listeners.borrow().is_empty()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }
}
