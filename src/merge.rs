// ===============================
// src/merge.rs (k-way chronological merge)
// ===============================
//
// One buffered action per input stream, min-heap on
// (timestamp, instrument, stream index). A stream is refilled right after its
// head is popped, and dropped from the heap once exhausted.
//
use std::cmp::Ordering;
use std::collections::BinaryHeap;

use thiserror::Error;

use crate::domain::{Action, Instrument, TsNs};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("stream {stream} ({instrument}) went back in time: {got} after {prev}")]
pub struct OutOfOrder {
    pub stream: usize,
    pub instrument: Instrument,
    pub prev: TsNs,
    pub got: TsNs,
}

struct Head {
    key: (TsNs, Instrument, usize),
    action: Action,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool { self.key == other.key }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl Ord for Head {
    // reversed: BinaryHeap is a max-heap
    fn cmp(&self, other: &Self) -> Ordering { other.key.cmp(&self.key) }
}

pub struct ActionMerger<I, E>
where
    I: Iterator<Item = Result<Action, E>>,
{
    streams: Vec<I>,
    last_ts: Vec<Option<TsNs>>,
    heap: BinaryHeap<Head>,
    pending_err: Option<E>,
    failed: bool,
}

impl<I, E> ActionMerger<I, E>
where
    I: Iterator<Item = Result<Action, E>>,
    E: From<OutOfOrder>,
{
    pub fn new(streams: Vec<I>) -> Self {
        let n = streams.len();
        let mut m = Self {
            streams,
            last_ts: vec![None; n],
            heap: BinaryHeap::with_capacity(n),
            pending_err: None,
            failed: false,
        };
        for i in 0..n {
            if let Err(e) = m.refill(i) {
                m.pending_err = Some(e);
                break;
            }
        }
        m
    }

    fn refill(&mut self, i: usize) -> Result<(), E> {
        match self.streams[i].next() {
            Some(Ok(action)) => {
                if let Some(prev) = self.last_ts[i] {
                    if action.timestamp < prev {
                        return Err(OutOfOrder { stream: i, instrument: action.instrument, prev, got: action.timestamp }.into());
                    }
                }
                self.last_ts[i] = Some(action.timestamp);
                self.heap.push(Head { key: (action.timestamp, action.instrument, i), action });
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }
}

impl<I, E> Iterator for ActionMerger<I, E>
where
    I: Iterator<Item = Result<Action, E>>,
    E: From<OutOfOrder>,
{
    type Item = Result<Action, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(e) = self.pending_err.take() {
            self.failed = true;
            return Some(Err(e));
        }
        let head = self.heap.pop()?;
        if let Err(e) = self.refill(head.key.2) {
            // the popped head is still good; surface the error on the next call
            self.pending_err = Some(e);
        }
        Some(Ok(head.action))
    }
}
