//! Fixed-capacity ring of recent samples and its text table.

use std::{fmt::Write, sync::Mutex, time::Duration};

use chrono::{DateTime, Utc};

use crate::probes::Sample;

const HEADER: &str = "| Sampled at | Oversleep  | Buf send   | Ping-pong  | Chain      |";
const HIGHLIGHT_MARKER: &str = " <---";

struct Ring {
    /// `None` marks a slot that has never been written.
    slots: Vec<Option<Sample>>,
    next: usize,
}

impl Ring {
    /// Newest first, stopping at the first never-written slot.
    fn newest_first(&self) -> impl Iterator<Item = &Sample> {
        let capacity = self.slots.len();
        (1..=capacity)
            .map(move |back| (self.next + capacity - back) % capacity)
            .map_while(move |idx| self.slots.get(idx).and_then(Option::as_ref))
    }
}

/// Thread-safe history shared between the sampling loop (writer) and
/// renderers (readers). The lock is never held across an await point.
pub struct History {
    inner: Mutex<Ring>,
}

impl History {
    /// Capacity is clamped to at least one slot.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Ring {
                slots: vec![None; capacity.max(1)],
                next: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    /// Number of samples currently retained.
    pub fn len(&self) -> usize {
        self.lock().newest_first().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record(&self, sample: Sample) {
        let mut ring = self.lock();
        let idx = ring.next;
        let capacity = ring.slots.len();
        if let Some(slot) = ring.slots.get_mut(idx) {
            *slot = Some(sample);
        }
        ring.next = (idx + 1) % capacity;
    }

    /// Copies of the retained samples, newest first.
    #[cfg(test)]
    pub(crate) fn recent(&self) -> Vec<Sample> {
        self.lock().newest_first().copied().collect()
    }

    /// Renders the table, newest row first. Rows for which `highlight`
    /// returns true get a trailing marker.
    pub fn render<F>(&self, highlight: F) -> String
    where
        F: Fn(&Sample) -> bool,
    {
        self.render_at(Utc::now(), highlight)
    }

    fn render_at<F>(&self, now: DateTime<Utc>, highlight: F) -> String
    where
        F: Fn(&Sample) -> bool,
    {
        let ring = self.lock();
        let mut out = String::with_capacity((ring.slots.len() + 1) * (HEADER.len() + 8));

        let _ = writeln!(out, "{}", HEADER);
        for s in ring.newest_first() {
            let age = (now - s.start).num_milliseconds() as f64 / 1e3;
            let _ = writeln!(
                out,
                "| {:5.1}s ago | {:>10} | {:>10} | {:>10} | {:>10} |{}",
                age,
                format_duration(s.oversleep),
                format_duration(s.buffered_send),
                format_duration(s.ping_pong),
                format_duration(s.chain),
                if highlight(s) { HIGHLIGHT_MARKER } else { "" },
            );
        }
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ring> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub fn format_duration(d: Duration) -> String {
    let ns = d.as_nanos();
    if ns >= 1_000_000_000 {
        format!("{:.2}s", d.as_secs_f64())
    } else if ns >= 1_000_000 {
        format!("{:.2}ms", ns as f64 / 1_000_000.0)
    } else if ns >= 1_000 {
        format!("{:.2}µs", ns as f64 / 1_000.0)
    } else {
        format!("{}ns", ns)
    }
}
