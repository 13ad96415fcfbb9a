//! Hierarchical cancellation scopes.
//!
//! A scope is a node in a tree. Canceling a node marks it and every live
//! descendant canceled, runs the cleanup callbacks registered on each node in
//! registration order, and makes every blocking primitive waiting under the
//! subtree return [`WorkflowError::Canceled`](crate::WorkflowError::Canceled)
//! on its next resume.
//!
//! Parents hold children weakly, children hold parents strongly, so dropping
//! the last handle to a child removes it from the tree.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::task::Poll;

use crate::runtime::coroutine::{note_progress, suspend_until};

type CleanupCallback = Box<dyn FnOnce()>;

struct ScopeNode {
    canceled: Cell<bool>,
    parent: Option<Rc<ScopeNode>>,
    children: RefCell<Vec<Weak<ScopeNode>>>,
    callbacks: RefCell<BTreeMap<u64, CleanupCallback>>,
    next_callback: Cell<u64>,
}

impl ScopeNode {
    fn new(parent: Option<Rc<ScopeNode>>) -> Rc<Self> {
        Rc::new(Self {
            canceled: Cell::new(false),
            parent,
            children: RefCell::new(Vec::new()),
            callbacks: RefCell::new(BTreeMap::new()),
            next_callback: Cell::new(0),
        })
    }

    fn cancel(self: &Rc<Self>) {
        if self.canceled.replace(true) {
            return;
        }
        note_progress();
        // Take the lists before running anything: callbacks may register more
        // callbacks or children, which then observe the canceled flag.
        let callbacks = std::mem::take(&mut *self.callbacks.borrow_mut());
        for callback in callbacks.into_values() {
            callback();
        }
        let children = std::mem::take(&mut *self.children.borrow_mut());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

/// Identifies a cleanup callback registered with
/// [`CancellationScope::on_cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackKey(u64);

/// Node of the cancellation tree. Cheap to clone; clones share the node.
#[derive(Clone)]
pub struct CancellationScope {
    node: Rc<ScopeNode>,
}

impl CancellationScope {
    /// A new root scope with no parent.
    pub fn root() -> Self {
        Self {
            node: ScopeNode::new(None),
        }
    }

    /// Create a child of `parent` together with the handle that cancels it.
    ///
    /// A child created under an already-canceled parent starts canceled.
    pub fn with_cancel(parent: &CancellationScope) -> (CancellationScope, CancelHandle) {
        let child = ScopeNode::new(Some(parent.node.clone()));
        if parent.is_canceled() {
            child.canceled.set(true);
        } else {
            let mut children = parent.node.children.borrow_mut();
            children.retain(|c| c.strong_count() > 0);
            children.push(Rc::downgrade(&child));
        }
        let handle = CancelHandle {
            node: Rc::downgrade(&child),
        };
        (CancellationScope { node: child }, handle)
    }

    pub fn is_canceled(&self) -> bool {
        self.node.canceled.get()
    }

    pub fn has_parent(&self) -> bool {
        self.node.parent.is_some()
    }

    /// Parent scope, if this is not a root.
    pub fn parent(&self) -> Option<CancellationScope> {
        self.node
            .parent
            .as_ref()
            .map(|p| CancellationScope { node: p.clone() })
    }

    /// Cancel this scope and all its descendants. Idempotent.
    pub fn cancel(&self) {
        self.node.cancel();
    }

    /// Register cleanup to run once when the scope is canceled.
    ///
    /// Runs immediately when the scope is already canceled.
    pub fn on_cancel(&self, callback: impl FnOnce() + 'static) -> CallbackKey {
        let key = CallbackKey(self.node.next_callback.get());
        self.node.next_callback.set(key.0 + 1);
        if self.is_canceled() {
            callback();
            return key;
        }
        self.node.callbacks.borrow_mut().insert(key.0, Box::new(callback));
        key
    }

    /// Drop a callback that is no longer needed. Returns false when it
    /// already ran or was removed.
    pub fn remove_on_cancel(&self, key: CallbackKey) -> bool {
        self.node.callbacks.borrow_mut().remove(&key.0).is_some()
    }

    /// Number of callbacks waiting for cancellation.
    pub fn pending_callbacks(&self) -> usize {
        self.node.callbacks.borrow().len()
    }

    /// Completes once the scope is canceled.
    pub fn cancelled(&self) -> impl Future<Output = ()> + '_ {
        suspend_until(|| "blocked on CancellationScope.Cancelled".to_string(), move || {
            if self.is_canceled() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
    }

    /// Whether both values refer to the same node.
    pub fn same_scope(&self, other: &CancellationScope) -> bool {
        Rc::ptr_eq(&self.node, &other.node)
    }
}

impl fmt::Debug for CancellationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationScope")
            .field("canceled", &self.is_canceled())
            .field("has_parent", &self.has_parent())
            .finish()
    }
}

/// Cancels the scope it was created with. Does not keep the scope alive.
#[derive(Clone)]
pub struct CancelHandle {
    node: Weak<ScopeNode>,
}

impl CancelHandle {
    /// Cancel the scope. Safe to call repeatedly or after the scope is gone.
    pub fn cancel(&self) {
        if let Some(node) = self.node.upgrade() {
            node.cancel();
        }
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("alive", &(self.node.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_cascades_to_descendants() {
        let root = CancellationScope::root();
        let (child, _child_handle) = CancellationScope::with_cancel(&root);
        let (grandchild, _gc_handle) = CancellationScope::with_cancel(&child);
        let (sibling, sibling_handle) = CancellationScope::with_cancel(&root);

        sibling_handle.cancel();
        assert!(sibling.is_canceled());
        assert!(!root.is_canceled());
        assert!(!child.is_canceled());

        root.cancel();
        assert!(child.is_canceled());
        assert!(grandchild.is_canceled());
    }

    #[test]
    fn callbacks_run_once_in_registration_order() {
        let root = CancellationScope::root();
        let (scope, handle) = CancellationScope::with_cancel(&root);
        let log = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            scope.on_cancel(move || log.borrow_mut().push(i));
        }
        handle.cancel();
        handle.cancel();
        assert_eq!(*log.borrow(), vec![0, 1, 2]);

        let late = log.clone();
        scope.on_cancel(move || late.borrow_mut().push(99));
        assert_eq!(*log.borrow(), vec![0, 1, 2, 99]);
    }

    #[test]
    fn removed_callback_never_runs() {
        let root = CancellationScope::root();
        let log = Rc::new(RefCell::new(Vec::new()));
        let keys: Vec<CallbackKey> = (0..3)
            .map(|i| {
                let log = log.clone();
                root.on_cancel(move || log.borrow_mut().push(i))
            })
            .collect();
        assert!(root.remove_on_cancel(keys[1]));
        assert!(!root.remove_on_cancel(keys[1]));
        assert_eq!(root.pending_callbacks(), 2);
        root.cancel();
        assert_eq!(*log.borrow(), vec![0, 2]);
        assert_eq!(root.pending_callbacks(), 0);
        assert!(!root.remove_on_cancel(keys[0]));
    }

    #[test]
    fn child_of_canceled_parent_starts_canceled() {
        let root = CancellationScope::root();
        root.cancel();
        let (child, _) = CancellationScope::with_cancel(&root);
        assert!(child.is_canceled());
        assert!(child.has_parent());
        assert!(child.parent().map(|p| p.same_scope(&root)).unwrap_or(false));
    }

    #[test]
    fn dropped_child_handle_is_harmless() {
        let root = CancellationScope::root();
        let handle = {
            let (_child, handle) = CancellationScope::with_cancel(&root);
            handle
        };
        handle.cancel();
        assert!(!root.is_canceled());
    }
}
