//! Wrapper Lifecycle Manager
//!
//! [`ScriptHeap`] tracks every object that carries a wrapper. `collect`
//! plays the garbage collector: objects whose last strong reference is gone
//! move to the finalization queue. `drain` runs the variant disposal for
//! each queued wrapper; a wrapper that cannot be disposed yet goes back on
//! the queue for the next pass.
//!
//! The heap also owns the instance-identity map, which holds at most one
//! live script object per native pointer.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use rustc_hash::FxHashMap;

use crate::context::ExecutionContext;
use crate::objrt::Id;
use crate::script::{ObjectRef, ScriptObject};
use crate::worker::WorkerRegistry;
use crate::wrapper::{ReferenceStorage, StructStorage, Wrapper, WrapperCell};

struct Tracked {
    object: Weak<ScriptObject>,
    cell: Rc<WrapperCell>,
    is_super: bool,
}

struct Pending {
    tracked: Tracked,
    retries: u32,
}

/// Outcome of one disposal attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposal {
    Done,
    /// Try again on a later pass
    Retry,
}

/// Counters of a drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub disposed: usize,
    pub retried: usize,
}

/// Lifetime counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub tracked: usize,
    pub pending: usize,
    pub instances: usize,
    pub disposed: usize,
}

#[derive(Default)]
pub struct ScriptHeap {
    tracked: RefCell<Vec<Tracked>>,
    queue: RefCell<VecDeque<Pending>>,
    instances: RefCell<FxHashMap<usize, Weak<ScriptObject>>>,
    disposed: Cell<usize>,
}

impl ScriptHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `object` for unreachability. Returns a handle that does not
    /// keep it alive. Objects without a wrapper are not tracked.
    pub fn register(&self, object: &ObjectRef) -> Weak<ScriptObject> {
        let handle = Rc::downgrade(object);
        if let Some(cell) = object.wrapper() {
            self.tracked.borrow_mut().push(Tracked {
                object: handle.clone(),
                cell,
                is_super: object.is_super(),
            });
        }
        handle
    }

    /// Queue every tracked object that is no longer reachable
    pub fn collect(&self) -> usize {
        let mut tracked = self.tracked.borrow_mut();
        let mut queue = self.queue.borrow_mut();
        let before = queue.len();
        let mut i = 0;
        while i < tracked.len() {
            if tracked[i].object.strong_count() == 0 {
                queue.push_back(Pending {
                    tracked: tracked.swap_remove(i),
                    retries: 0,
                });
            } else {
                i += 1;
            }
        }
        queue.len() - before
    }

    /// Dispose queued wrappers, each at most once per pass
    pub fn drain(&self, ctx: &ExecutionContext) -> DrainReport {
        let mut report = DrainReport::default();
        let count = self.queue.borrow().len();
        for _ in 0..count {
            let Some(mut pending) = self.queue.borrow_mut().pop_front() else {
                break;
            };
            match self.dispose(ctx, &pending.tracked) {
                Disposal::Done => {
                    pending.tracked.cell.mark_disposed();
                    self.disposed.set(self.disposed.get() + 1);
                    report.disposed += 1;
                }
                Disposal::Retry => {
                    pending.retries += 1;
                    if pending.retries == ctx.options().max_finalizer_retries {
                        log::warn!(
                            "{:?} wrapper still not disposable after {} passes",
                            pending.tracked.cell.kind(),
                            pending.retries
                        );
                    } else {
                        log::trace!(
                            "finalizer retry {} for {:?}",
                            pending.retries,
                            pending.tracked.cell.kind()
                        );
                    }
                    report.retried += 1;
                    self.queue.borrow_mut().push_back(pending);
                }
            }
        }
        report
    }

    fn dispose(&self, ctx: &ExecutionContext, tracked: &Tracked) -> Disposal {
        if tracked.cell.is_disposed() {
            return Disposal::Done;
        }
        let mut wrapper = tracked.cell.raw();
        match &mut *wrapper {
            Wrapper::NativeObject(object) => {
                if tracked.is_super {
                    object.owner = None;
                } else {
                    self.remove_instance(object.object, &tracked.object);
                    ctx.runtime().release(object.object);
                }
            }
            Wrapper::Struct(value) => {
                value.storage = StructStorage::Borrowed {
                    address: 0,
                    owner: None,
                };
            }
            Wrapper::Pointer(pointer) => {
                if pointer.adopted && pointer.address != 0 {
                    unsafe { libc::free(pointer.address as *mut libc::c_void) };
                }
                ctx.caches().forget_pointer(pointer.address, &tracked.object);
            }
            Wrapper::Reference(reference) => {
                reference.storage = ReferenceStorage::Unset;
                reference.encoding = None;
                reference.abi = None;
                reference.pending = Default::default();
                reference.keep = Default::default();
            }
            Wrapper::FunctionReference(reference) => {
                reference.trampolines.clear();
                reference.function = None;
            }
            Wrapper::Block(block) => {
                block.script = None;
            }
            Wrapper::Worker(state) => {
                if state.is_running() {
                    return Disposal::Retry;
                }
                WorkerRegistry::global().remove(state.id());
            }
            Wrapper::Primitive(_)
            | Wrapper::Enum(_)
            | Wrapper::StructType(_)
            | Wrapper::NativeClass(_)
            | Wrapper::NativeProtocol(_)
            | Wrapper::Function(_) => {}
        }
        Disposal::Done
    }

    // ===== Instance identity =====

    /// Live script object for a native instance
    pub fn lookup_instance(&self, object: Id) -> Option<ObjectRef> {
        self.instances.borrow().get(&(object as usize)).and_then(Weak::upgrade)
    }

    /// Record `wrapper` as the script object of `object`, replacing a dead entry
    pub fn insert_instance(&self, object: Id, wrapper: &ObjectRef) {
        let mut instances = self.instances.borrow_mut();
        let entry = instances.entry(object as usize).or_default();
        debug_assert!(entry.upgrade().is_none(), "two live wrappers for {:p}", object);
        *entry = Rc::downgrade(wrapper);
    }

    /// Remove the entry of a disposed wrapper, unless a newer one replaced it
    fn remove_instance(&self, object: Id, handle: &Weak<ScriptObject>) {
        let mut instances = self.instances.borrow_mut();
        if instances
            .get(&(object as usize))
            .is_some_and(|current| Weak::ptr_eq(current, handle))
        {
            instances.remove(&(object as usize));
        }
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            tracked: self.tracked.borrow().len(),
            pending: self.queue.borrow().len(),
            instances: self.instances.borrow().len(),
            disposed: self.disposed.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrapper::PointerWrapper;

    fn pointer_object(address: usize) -> ObjectRef {
        crate::script::ObjectBuilder::new()
            .wrapper(Wrapper::Pointer(PointerWrapper {
                address,
                adopted: false,
            }))
            .build()
    }

    #[test]
    fn test_collect_queues_unreachable() {
        let heap = ScriptHeap::new();
        let kept = pointer_object(0x10);
        let dropped = pointer_object(0x20);
        heap.register(&kept);
        let handle = heap.register(&dropped);
        heap.register(&ScriptObject::new());
        assert_eq!(heap.stats().tracked, 2);

        drop(dropped);
        assert!(handle.upgrade().is_none());
        assert_eq!(heap.collect(), 1);
        assert_eq!(heap.stats().tracked, 1);
        assert_eq!(heap.stats().pending, 1);
        assert_eq!(heap.collect(), 0);
    }

    #[test]
    fn test_identity_entries() {
        let heap = ScriptHeap::new();
        let native = 0x1000 as Id;
        let first = ScriptObject::new();
        heap.insert_instance(native, &first);
        assert!(Rc::ptr_eq(&heap.lookup_instance(native).unwrap(), &first));

        let stale = Rc::downgrade(&first);
        drop(first);
        assert!(heap.lookup_instance(native).is_none());

        let second = ScriptObject::new();
        heap.insert_instance(native, &second);
        heap.remove_instance(native, &stale);
        assert!(heap.lookup_instance(native).is_some());
        heap.remove_instance(native, &Rc::downgrade(&second));
        assert!(heap.lookup_instance(native).is_none());
    }
}
