//! Sorted views of the pushers sharing a group ordinal.
//!
//! Group membership is derived state, rebuilt from each pusher's
//! advertised `groupOrdinal`; the group holds back-references only, never
//! ownership. A dropped pusher simply vanishes from the views.

use std::sync::{Arc, Weak};

use crate::pusher::Pusher;
use crate::strip::Strip;

#[derive(Clone)]
struct Member {
    controller_ordinal: u32,
    mac: String,
    pusher: Weak<Pusher>,
}

impl Member {
    fn sort_key(&self) -> (u32, &str) {
        (self.controller_ordinal, &self.mac)
    }
}

/// The pushers sharing one group ordinal, sorted by controller ordinal
/// and then MAC address.
#[derive(Clone)]
pub struct PusherGroup {
    ordinal: u32,
    members: Vec<Member>,
}

impl PusherGroup {
    pub(crate) fn new(ordinal: u32) -> PusherGroup {
        PusherGroup {
            ordinal,
            members: Vec::new(),
        }
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub(crate) fn add_pusher(&mut self, pusher: &Arc<Pusher>) {
        let member = Member {
            controller_ordinal: pusher.controller_ordinal(),
            mac: pusher.mac().to_owned(),
            pusher: Arc::downgrade(pusher),
        };
        // Keyed inserts keep the vector sorted without a full re-sort.
        let position = self.members.binary_search_by(|m| {
            m.sort_key()
                .cmp(&(member.controller_ordinal, member.mac.as_str()))
        });
        match position {
            Ok(i) => self.members[i] = member,
            Err(i) => self.members.insert(i, member),
        }
    }

    pub(crate) fn remove_pusher(&mut self, pusher: &Arc<Pusher>) {
        let key = (pusher.controller_ordinal(), pusher.mac());
        if let Ok(i) = self
            .members
            .binary_search_by(|m| m.sort_key().cmp(&key))
        {
            self.members.remove(i);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The group's live pushers, in sort order.
    pub fn pushers(&self) -> Vec<Arc<Pusher>> {
        self.members
            .iter()
            .filter_map(|m| m.pusher.upgrade())
            .collect()
    }

    /// The number of strips across the group's live pushers.
    pub fn strip_count(&self) -> usize {
        self.pushers().iter().map(|p| p.strips().len()).sum()
    }

    /// Visits every strip of every live pusher, flattened in pusher order.
    pub fn for_each_strip(&self, mut f: impl FnMut(&mut Strip)) {
        for pusher in self.pushers() {
            for strip in pusher.strips().iter_mut() {
                f(strip);
            }
        }
    }
}
