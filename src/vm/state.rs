//! The keyed state-frame stack.
//!
//! Each frame carries an immutable `incoming` view (what was persisted
//! under this frame's key last run) and a mutable `outgoing` map built up
//! by saves during this run. Popping merges the outgoing value into the
//! parent's outgoing map under the frame key; the root frame merges into
//! the VM's persisted state value. A discard-pop drops the frame without
//! merging, leaving whatever was persisted before untouched.

use std::sync::Arc;

use crate::val::Val;

#[derive(Debug)]
struct StateFrame {
    /// None only on the root frame.
    key: Option<Arc<str>>,
    incoming: Val,
    outgoing: Val,
}

#[derive(Debug, Default)]
pub(crate) struct StateStack {
    frames: Vec<StateFrame>,
}

impl StateStack {
    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Push a frame. The first push adopts the whole persisted state as
    /// its incoming view; later pushes look up `incoming[key]` in the
    /// parent frame.
    pub fn push(&mut self, key: Option<Arc<str>>, vm_state: &Val) {
        let incoming = match self.frames.last() {
            None => vm_state.clone(),
            Some(parent) => {
                let key = match &key {
                    Some(k) => k,
                    None => panic!("internal error: non-root state frame pushed without a key"),
                };
                match &parent.incoming {
                    Val::Map(m) => m.get(key).cloned().unwrap_or(Val::Null),
                    _ => Val::Null,
                }
            }
        };
        self.frames.push(StateFrame {
            key,
            incoming,
            outgoing: Val::Null,
        });
    }

    /// Pop and merge. A null outgoing value removes the key from the
    /// parent instead of storing a null.
    pub fn pop(&mut self, vm_state: &mut Val) {
        let frame = match self.frames.pop() {
            Some(f) => f,
            None => panic!("internal error: state frame pop on empty stack"),
        };
        match self.frames.last_mut() {
            None => *vm_state = frame.outgoing,
            Some(parent) => {
                let key = match frame.key {
                    Some(k) => k,
                    None => panic!("internal error: non-root state frame without a key"),
                };
                if frame.outgoing.is_null() {
                    if let Val::Map(m) = &mut parent.outgoing {
                        Arc::make_mut(m).remove(&key);
                    }
                } else {
                    if !matches!(parent.outgoing, Val::Map(_)) {
                        parent.outgoing = Val::empty_map();
                    }
                    if let Val::Map(m) = &mut parent.outgoing {
                        Arc::make_mut(m).insert(key, frame.outgoing);
                    }
                }
            }
        }
    }

    pub fn pop_discard(&mut self) {
        if self.frames.pop().is_none() {
            panic!("internal error: state frame discard on empty stack");
        }
    }

    /// Read from the top frame's incoming view.
    pub fn get(&self, key: &str) -> Val {
        let top = match self.frames.last() {
            Some(f) => f,
            None => panic!("internal error: state read with no frame"),
        };
        match &top.incoming {
            Val::Map(m) => m.get(key).cloned().unwrap_or(Val::Null),
            _ => Val::Null,
        }
    }

    /// Write into the top frame's outgoing map; null deletes.
    pub fn save(&mut self, key: Arc<str>, value: Val) {
        let top = match self.frames.last_mut() {
            Some(f) => f,
            None => panic!("internal error: state save with no frame"),
        };
        if value.is_null() {
            if let Val::Map(m) = &mut top.outgoing {
                Arc::make_mut(m).remove(&key);
            }
            return;
        }
        if !matches!(top.outgoing, Val::Map(_)) {
            top.outgoing = Val::empty_map();
        }
        if let Val::Map(m) = &mut top.outgoing {
            Arc::make_mut(m).insert(key, value);
        }
    }
}
