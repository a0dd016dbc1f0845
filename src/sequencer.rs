//! Per-name command ordering for the daemon core.
use std::{
    collections::HashMap,
    sync::{Condvar, Mutex, PoisonError},
};

#[derive(Debug, Default)]
struct Lane {
    next_ticket: u64,
    now_serving: u64,
}

/// Hands out FIFO tickets per process name.
///
/// Holders of tickets for the same name run one at a time in the order the
/// tickets were taken. Different names never wait on each other.
#[derive(Debug, Default)]
pub struct NameSequencer {
    lanes: Mutex<HashMap<String, Lane>>,
    turn: Condvar,
}

/// Exclusive turn on one name; released on drop.
#[derive(Debug)]
pub struct Turn<'a> {
    sequencer: &'a NameSequencer,
    name: String,
}

impl NameSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the next ticket for `name` and blocks until it is served.
    pub fn acquire(&self, name: &str) -> Turn<'_> {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        let lane = lanes.entry(name.to_string()).or_default();
        let ticket = lane.next_ticket;
        lane.next_ticket += 1;

        while lanes
            .get(name)
            .is_some_and(|lane| lane.now_serving != ticket)
        {
            lanes = self
                .turn
                .wait(lanes)
                .unwrap_or_else(PoisonError::into_inner);
        }

        Turn {
            sequencer: self,
            name: name.to_string(),
        }
    }

    /// Number of names with queued or running turns.
    pub fn active_lanes(&self) -> usize {
        self.lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Turn<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        let mut lanes = self
            .sequencer
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(lane) = lanes.get_mut(&self.name) {
            lane.now_serving += 1;
            if lane.now_serving == lane.next_ticket {
                lanes.remove(&self.name);
            }
        }
        self.sequencer.turn.notify_all();
    }
}
