//! Banded queue of per-cell task lists with an in-flight cap.
//!
//! Items are grouped by cell and ordered by priority band (lower bands
//! first), FIFO across cells within a band. [`pop`](PriorityCellQueue::pop)
//! hands out a cell's *entire* pending list at once and marks the cell
//! acquired; no further list for that cell is handed out until the matching
//! [`release`](PriorityCellQueue::release). The acquired set doubles as the
//! back-pressure gauge: once `cap` cells are out, `pop` returns `None`.
//!
//! An item may be `None`, a placeholder that carries no work but keeps the
//! cell's list live so a later release is ordered after everything already
//! queued.

use std::collections::{HashSet, VecDeque};

/// One worker's queue. `T` is the task payload.
pub struct PriorityCellQueue<T> {
    /// `bands[b]` holds `(cell, pending items)` in FIFO order.
    bands: Vec<Vec<(u64, VecDeque<Option<T>>)>>,
    /// Lowest band that may be non-empty.
    first_band: usize,
    /// Cells handed out and not yet released.
    acquired: HashSet<u64>,
    cap: usize,
    queued: usize,
    peak_acquired: usize,
}

impl<T> PriorityCellQueue<T> {
    /// # Panics
    ///
    /// Panics if `bands` or `cap` is zero.
    pub fn new(bands: usize, cap: usize) -> Self {
        assert!(bands > 0, "need at least one priority band");
        assert!(cap > 0, "in-flight cap must be positive");
        Self {
            bands: (0..bands).map(|_| Vec::new()).collect(),
            first_band: bands,
            acquired: HashSet::new(),
            cap,
            queued: 0,
            peak_acquired: 0,
        }
    }

    /// Queues `item` for `cell` at `band` (clamped). `None` queues a
    /// placeholder.
    pub fn submit(&mut self, cell: u64, band: usize, item: Option<T>) {
        let band = band.min(self.bands.len() - 1);
        let entries = &mut self.bands[band];
        match entries.iter_mut().find(|(c, _)| *c == cell) {
            Some((_, list)) => list.push_back(item),
            None => {
                let mut list = VecDeque::with_capacity(1);
                list.push_back(item);
                entries.push((cell, list));
            }
        }
        self.queued += 1;
        if band < self.first_band {
            self.first_band = band;
        }
    }

    /// Moves `cell`'s pending list from `from` to `to`, keeping its internal
    /// order and joining the tail of the new band. No-op when the cell has
    /// nothing queued at `from`.
    pub fn resort(&mut self, cell: u64, from: usize, to: usize) {
        let from = from.min(self.bands.len() - 1);
        let to = to.min(self.bands.len() - 1);
        if from == to {
            return;
        }
        let Some(at) = self.bands[from].iter().position(|(c, _)| *c == cell) else {
            return;
        };
        let entry = self.bands[from].remove(at);
        self.bands[to].push(entry);
        if to < self.first_band {
            self.first_band = to;
        }
    }

    /// Returns the cell from whom the next batch should run, with its whole
    /// pending list, and marks it acquired. `None` when the cap is reached
    /// or nothing poppable remains.
    pub fn pop(&mut self) -> Option<(u64, Vec<Option<T>>)> {
        if self.acquired.len() >= self.cap {
            return None;
        }
        let mut band = self.first_band;
        while band < self.bands.len() {
            if self.bands[band].is_empty() {
                if band == self.first_band {
                    self.first_band += 1;
                }
                band += 1;
                continue;
            }
            if let Some(at) = self.bands[band]
                .iter()
                .position(|(c, _)| !self.acquired.contains(c))
            {
                let (cell, list) = self.bands[band].remove(at);
                self.queued -= list.len();
                self.acquired.insert(cell);
                self.peak_acquired = self.peak_acquired.max(self.acquired.len());
                return Some((cell, list.into_iter().collect()));
            }
            // Every queued cell in this band is already out; try further.
            band += 1;
        }
        None
    }

    /// Releases an acquired cell. `full_clear` also drops everything still
    /// queued for the cell; otherwise only its placeholders are dropped.
    pub fn release(&mut self, cell: u64, full_clear: bool) {
        self.acquired.remove(&cell);
        for entries in &mut self.bands {
            let Some(at) = entries.iter().position(|(c, _)| *c == cell) else {
                continue;
            };
            if full_clear {
                let (_, list) = entries.remove(at);
                self.queued -= list.len();
            } else {
                let list = &mut entries[at].1;
                let before = list.len();
                list.retain(Option::is_some);
                self.queued -= before - list.len();
                if list.is_empty() {
                    entries.remove(at);
                }
            }
        }
    }

    pub fn queued_len(&self) -> usize {
        self.queued
    }

    pub fn has_queued(&self) -> bool {
        self.queued > 0
    }

    pub fn acquired_count(&self) -> usize {
        self.acquired.len()
    }

    /// High-water mark of the acquired set since construction.
    pub fn peak_acquired(&self) -> usize {
        self.peak_acquired
    }

    pub fn cap(&self) -> usize {
        self.cap
    }
}

// ============================================================================
// Tests
// ============================================================================
