use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::datafile::Datafile;

/// A deferred destructive action parked in the barrier list.
pub enum BarrierAction {
    /// Rename a retired datafile to its `deleted-` name, close it and
    /// optionally unlink it.
    DatafileRetire { datafile: Arc<Datafile>, unlink: bool },
    /// Unload the collection once no reader pins remain.
    CollectionUnload,
    /// Drop the collection: close everything and rename or remove the
    /// collection directory.
    CollectionDrop,
}

enum BarrierNode {
    /// A live reader reference. While an element sits in front of an
    /// action, that action must not run.
    Element,
    Action(BarrierAction),
}

/// FIFO of reader pins and deferred actions, consumed from the head by
/// the cleanup worker. The head rule: an action is only handed out when
/// no element precedes it.
pub struct BarrierList {
    inner: Mutex<Inner>,
}

struct Inner {
    next_id: u64,
    nodes: VecDeque<(u64, BarrierNode)>,
}

impl BarrierList {
    pub fn new() -> Self {
        BarrierList {
            inner: Mutex::new(Inner {
                next_id: 1,
                nodes: VecDeque::new(),
            }),
        }
    }

    /// Append a reader element; returns the id used to release it.
    pub fn add_element(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.nodes.push_back((id, BarrierNode::Element));
        id
    }

    /// Remove a reader element, wherever it sits in the list.
    pub fn release_element(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(position) = inner.nodes.iter().position(|(node_id, _)| *node_id == id) {
            inner.nodes.remove(position);
        }
    }

    pub fn push_action(&self, action: BarrierAction) {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.nodes.push_back((id, BarrierNode::Action(action)));
    }

    /// Detach the head action if the head is not an element. Returns
    /// `None` when the list is empty or a reader pin is in front.
    pub fn pop_action(&self) -> Option<BarrierAction> {
        let mut inner = self.inner.lock().unwrap();
        match inner.nodes.front() {
            Some((_, BarrierNode::Action(_))) => {}
            _ => return None,
        }
        match inner.nodes.pop_front() {
            Some((_, BarrierNode::Action(action))) => Some(action),
            _ => unreachable!(),
        }
    }

    /// Detach the first action regardless of elements in front. Used by
    /// the final forced drain during shutdown.
    pub fn pop_action_forced(&self) -> Option<BarrierAction> {
        let mut inner = self.inner.lock().unwrap();
        let position = inner.nodes.iter().position(|(_, node)| match node {
            BarrierNode::Action(_) => true,
            BarrierNode::Element => false,
        })?;
        match inner.nodes.remove(position) {
            Some((_, BarrierNode::Action(action))) => Some(action),
            _ => unreachable!(),
        }
    }

    pub fn has_elements(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.nodes.iter().any(|(_, node)| match node {
            BarrierNode::Element => true,
            _ => false,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().nodes.is_empty()
    }
}
