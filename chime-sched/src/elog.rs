//! Ring log of scheduler events, snapshot-copied into debug dumps.

use heapless::HistoryBuffer;
use nix::sys::time::TimeSpec;

/// Entries retained for dumps; older entries are overwritten.
pub const EVENT_LOG_SIZE: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventTag {
    DevAdded,
    StreamAdded,
    StreamSleepTime,
    PbMsg,
    WriteStreamsWait,
    Sleep,
    Wake,
    IodevCb,
}

#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub tag: EventTag,
    pub ts: TimeSpec,
    pub data: [u32; 3],
}

pub struct EventLog {
    entries: HistoryBuffer<Event, EVENT_LOG_SIZE>,
}

impl EventLog {
    pub fn new() -> EventLog {
        EventLog {
            entries: HistoryBuffer::new(),
        }
    }

    pub fn push(&mut self, tag: EventTag, data: [u32; 3]) {
        self.entries.write(Event {
            tag,
            ts: chime_clock::now(),
            data,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() == 0
    }

    /// Copy of the log, oldest entry first.
    pub fn snapshot(&self) -> Vec<Event> {
        self.entries.oldest_ordered().copied().collect()
    }
}

impl Default for EventLog {
    fn default() -> EventLog {
        EventLog::new()
    }
}
