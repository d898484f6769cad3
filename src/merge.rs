//! K-way deterministic merge of per-source event streams.
//!
//! Each source is a boxed iterator yielding events in its own timestamp
//! order; the merge pulls the globally-next event across all sources using
//! a min-heap keyed on `TieBreakKey`, mirroring the teacher's
//! `EventQueue`/`BinaryHeap<Reverse<_>>` pull model rather than eagerly
//! materializing and sorting every source up front.

use crate::model::{Event, TieBreakKey};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// One pending event paired with the source it came from, ordered purely by
/// `TieBreakKey` so the heap pulls the globally-earliest event next.
struct HeapEntry {
    key: TieBreakKey,
    event: Event,
    source_index: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

/// Merges events from multiple sources into a single strictly-ordered
/// stream. Sources are pulled lazily: at most one buffered event per source
/// lives on the heap at a time.
pub struct MergedStream {
    sources: Vec<Box<dyn Iterator<Item = Event>>>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
}

impl MergedStream {
    /// Build a merge over `sources`, each optionally sliced to
    /// `[start_ms, end_ms)` before being handed in. Slicing is the caller's
    /// responsibility (typically via `Iterator::filter` on the adapter side)
    /// so this type stays agnostic to the window boundaries.
    pub fn new(mut sources: Vec<Box<dyn Iterator<Item = Event>>>) -> Self {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (index, source) in sources.iter_mut().enumerate() {
            if let Some(event) = source.next() {
                let key = TieBreakKey::for_event(&event, index);
                heap.push(Reverse(HeapEntry {
                    key,
                    event,
                    source_index: index,
                }));
            }
        }
        Self { sources, heap }
    }
}

impl Iterator for MergedStream {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        let Reverse(entry) = self.heap.pop()?;
        if let Some(next_event) = self.sources[entry.source_index].next() {
            let key = TieBreakKey::for_event(&next_event, entry.source_index);
            self.heap.push(Reverse(HeapEntry {
                key,
                event: next_event,
                source_index: entry.source_index,
            }));
        }
        Some(entry.event)
    }
}

/// Restrict an iterator of events to the half-open window
/// `[start_ms, end_ms)`, dropping events outside it. Events are assumed to
/// arrive from their source in non-decreasing `event_time_ms` order, so this
/// can stop early once `end_ms` is reached.
pub fn slice_window(
    source: impl Iterator<Item = Event> + 'static,
    start_ms: i64,
    end_ms: i64,
) -> Box<dyn Iterator<Item = Event>> {
    Box::new(
        source
            .skip_while(move |e| e.event_time_ms() < start_ms)
            .take_while(move |e| e.event_time_ms() < end_ms),
    )
}
