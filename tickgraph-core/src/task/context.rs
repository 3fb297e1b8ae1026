//! Thread Context
//!
//! Tracks which logical thread the calling OS thread is for each task graph.
//!
//! # Implementation
//!
//! A thread-local stack of `(graph, identity)` entries. Workers and spawned
//! named threads push an entry when they start; external threads push one by
//! attaching to a named thread. Lookups search from the top, so a thread can
//! serve several independent graphs (tests do this constantly) and the most
//! recent binding for a given graph wins.

use std::cell::RefCell;
use std::marker::PhantomData;

use super::thread::ThreadIdentity;

thread_local! {
    static THREAD_STACK: RefCell<Vec<ThreadEntry>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug, Clone, Copy)]
struct ThreadEntry {
    graph_id: u64,
    identity: ThreadIdentity,
}

/// Guard that removes the binding when dropped.
///
/// Not `Send`: the binding belongs to the thread that created it.
#[must_use = "the thread binding is removed when this guard is dropped"]
pub struct ThreadBinding {
    graph_id: u64,
    identity: ThreadIdentity,
    _not_send: PhantomData<*const ()>,
}

impl ThreadBinding {
    pub(crate) fn enter(graph_id: u64, identity: ThreadIdentity) -> Self {
        THREAD_STACK.with(|stack| stack.borrow_mut().push(ThreadEntry { graph_id, identity }));
        Self {
            graph_id,
            identity,
            _not_send: PhantomData,
        }
    }

    /// Identity of the calling thread for `graph_id`.
    pub(crate) fn current(graph_id: u64) -> ThreadIdentity {
        THREAD_STACK.with(|stack| {
            stack
                .borrow()
                .iter()
                .rev()
                .find(|entry| entry.graph_id == graph_id)
                .map(|entry| entry.identity)
                .unwrap_or(ThreadIdentity::External)
        })
    }

    pub fn identity(&self) -> ThreadIdentity {
        self.identity
    }
}

impl Drop for ThreadBinding {
    fn drop(&mut self) {
        THREAD_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let position = stack
                .iter()
                .rposition(|entry| entry.graph_id == self.graph_id && entry.identity == self.identity);
            debug_assert!(position.is_some(), "thread binding already removed");
            if let Some(position) = position {
                stack.remove(position);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::thread::{NamedThread, ThreadPriority};

    #[test]
    fn unbound_threads_are_external() {
        assert_eq!(ThreadBinding::current(u64::MAX), ThreadIdentity::External);
    }

    #[test]
    fn bindings_are_per_graph_and_scoped() {
        let game = ThreadBinding::enter(1, ThreadIdentity::Named(NamedThread::Game));
        assert_eq!(ThreadBinding::current(1), ThreadIdentity::Named(NamedThread::Game));
        assert_eq!(ThreadBinding::current(2), ThreadIdentity::External);

        {
            let worker = ThreadIdentity::Worker { bank: ThreadPriority::Normal, index: 3 };
            let _inner = ThreadBinding::enter(1, worker);
            assert_eq!(ThreadBinding::current(1), worker);
        }

        assert_eq!(ThreadBinding::current(1), game.identity());
        drop(game);
        assert_eq!(ThreadBinding::current(1), ThreadIdentity::External);
    }

    #[test]
    fn bindings_do_not_leak_across_threads() {
        let _game = ThreadBinding::enter(7, ThreadIdentity::Named(NamedThread::Game));
        let seen = std::thread::spawn(|| ThreadBinding::current(7)).join().unwrap();
        assert_eq!(seen, ThreadIdentity::External);
    }
}
