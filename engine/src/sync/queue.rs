//! Ring-buffered ingest of external MIDI realtime messages and the
//! transport state derived from them.
//!
//! A MIDI monitor thread appends raw events between interrupts; at the
//! start of each interrupt the synchronizer drains the ring, advances
//! the [`MidiState`], and cooks the records into [`SyncEvent`]s.

use std::sync::atomic::{AtomicUsize, Ordering};

use midly::live::{LiveEvent, SystemCommon, SystemRealtime};
use tracing::{debug, warn};

use crate::mutex::UnsafeMutex;

/// Ring capacity. Overflow drops the newest event and counts it.
pub const MAX_SYNC_EVENTS: usize = 128;

/// Milliseconds without a clock before the stream counts as stopped.
/// 7.5 bpm is the slowest clock stream worth following.
pub const MAX_CLOCK_GAP_MS: i64 = 666;

/// Clocks per quarter note in the MIDI realtime spec.
pub const CLOCKS_PER_BEAT: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiStatus {
    Clock,
    Start,
    Stop,
    Continue,
    SongPosition,
}

#[derive(Debug, Clone, Copy)]
pub struct MidiSyncEvent {
    pub status: MidiStatus,
    /// Millisecond timestamp supplied by the monitor thread.
    pub clock: i64,
    pub songpos: i64,
}

/// Transport state advanced one raw event at a time.
#[derive(Debug)]
pub struct MidiState {
    pub name: &'static str,
    pub last_clock_millisecond: i64,
    pub receiving_clocks: bool,
    /// Armed by SongPosition for the next Continue; -1 when unset.
    pub song_position: i64,
    pub song_clock: i64,
    /// Clock within the current beat, 0..=23.
    pub beat_clock: i64,
    pub beat: i64,
    pub waiting_status: Option<MidiStatus>,
    pub started: bool,
}

impl Default for MidiState {
    fn default() -> Self {
        MidiState {
            name: "sync",
            last_clock_millisecond: 0,
            receiving_clocks: false,
            song_position: -1,
            song_clock: 0,
            beat_clock: 0,
            beat: 0,
            waiting_status: None,
            started: false,
        }
    }
}

impl MidiState {
    /// Expire the receiving flag when the clock stream goes quiet.
    pub fn tick(&mut self, current_millisecond: i64) {
        if self.receiving_clocks {
            let delta = current_millisecond - self.last_clock_millisecond;
            if delta > MAX_CLOCK_GAP_MS {
                debug!(state = self.name, "stopped receiving clocks");
                self.receiving_clocks = false;
            }
        }
    }

    /// Consume one raw event. Song position is not tracked as a running
    /// counter; it only arms the next Continue.
    pub fn advance(&mut self, event: &MidiSyncEvent) {
        match event.status {
            MidiStatus::Start => {
                // arm for the next clock
                self.waiting_status = Some(MidiStatus::Start);
                self.started = false;
                self.last_clock_millisecond = event.clock;
            }
            MidiStatus::Stop => {
                self.waiting_status = None;
                self.song_position = -1;
                self.started = false;
            }
            MidiStatus::Continue => {
                self.waiting_status = Some(MidiStatus::Continue);
                self.started = false;
                self.last_clock_millisecond = event.clock;
            }
            MidiStatus::SongPosition => {
                self.song_position = event.songpos;
            }
            MidiStatus::Clock => {
                let delta = event.clock - self.last_clock_millisecond;
                self.last_clock_millisecond = event.clock;
                if !self.receiving_clocks && delta < MAX_CLOCK_GAP_MS {
                    debug!(state = self.name, "started receiving clocks");
                    self.receiving_clocks = true;
                }

                if !self.started && self.waiting_status == Some(MidiStatus::Continue) {
                    if self.song_position >= 0 {
                        // a song position is sixteenth notes, six clocks each
                        self.song_clock = self.song_position * 6;
                    }
                    self.song_position = -1;
                    self.beat_clock = self.song_clock % CLOCKS_PER_BEAT;
                    self.beat = self.song_clock / CLOCKS_PER_BEAT;
                    self.started = true;
                } else if !self.started && self.waiting_status == Some(MidiStatus::Start) {
                    self.song_position = -1;
                    self.song_clock = 0;
                    self.beat_clock = 0;
                    self.beat = 0;
                    self.started = true;
                } else {
                    // the armed status only persists through its first clock
                    self.waiting_status = None;
                    self.song_clock += 1;
                    self.beat_clock += 1;
                    if self.beat_clock >= CLOCKS_PER_BEAT {
                        self.beat += 1;
                        self.beat_clock = 0;
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEventType {
    Start,
    Stop,
    Continue,
    Pulse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseType {
    Clock,
    Beat,
    Bar,
}

/// Cooked sync record delivered to tracks at interrupt start.
#[derive(Debug, Clone, Copy)]
pub struct SyncEvent {
    pub etype: SyncEventType,
    pub pulse: PulseType,
    pub beat: i64,
    pub continue_pulse: i64,
    pub millisecond: i64,
}

/// SPSC ring: the MIDI monitor thread is the only producer, the audio
/// interrupt the only consumer.
pub struct MidiQueue {
    events: Box<[UnsafeMutex<MidiSyncEvent>]>,
    head: AtomicUsize,
    tail: AtomicUsize,
    overflows: AtomicUsize,
    state: UnsafeMutex<MidiState>,
}

impl MidiQueue {
    pub fn new() -> Self {
        let events = (0..MAX_SYNC_EVENTS)
            .map(|_| {
                UnsafeMutex::new(MidiSyncEvent {
                    status: MidiStatus::Clock,
                    clock: 0,
                    songpos: 0,
                })
            })
            .collect::<Vec<_>>();
        MidiQueue {
            events: events.into_boxed_slice(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            overflows: AtomicUsize::new(0),
            state: UnsafeMutex::new(MidiState::default()),
        }
    }

    pub fn overflows(&self) -> usize {
        self.overflows.load(Ordering::Relaxed)
    }

    pub fn has_events(&self) -> bool {
        self.head.load(Ordering::Acquire) != self.tail.load(Ordering::Acquire)
    }

    pub fn state(&self) -> &MidiState {
        self.state.lock()
    }

    /// Producer side: append a raw status with its timestamp.
    pub fn add(&self, status: MidiStatus, clock: i64, songpos: i64) {
        let head = self.head.load(Ordering::Relaxed);
        let mut next = head + 1;
        if next >= MAX_SYNC_EVENTS {
            next = 0;
        }
        *self.events[head].lock() = MidiSyncEvent { status, clock, songpos };
        if next != self.tail.load(Ordering::Acquire) {
            self.head.store(next, Ordering::Release);
        } else {
            // overflow should only happen if the interrupt is stuck;
            // stay quiet, this would generate a flood of messages
            self.overflows.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Producer side: parse a raw wire message and enqueue it when it is
    /// a realtime or song-position message.
    pub fn add_bytes(&self, bytes: &[u8], clock: i64) {
        match LiveEvent::parse(bytes) {
            Ok(LiveEvent::Realtime(rt)) => match rt {
                SystemRealtime::TimingClock => self.add(MidiStatus::Clock, clock, 0),
                SystemRealtime::Start => self.add(MidiStatus::Start, clock, 0),
                SystemRealtime::Stop => self.add(MidiStatus::Stop, clock, 0),
                SystemRealtime::Continue => self.add(MidiStatus::Continue, clock, 0),
                _ => {}
            },
            Ok(LiveEvent::Common(SystemCommon::SongPosition(pos))) => {
                self.add(MidiStatus::SongPosition, clock, pos.as_int() as i64);
            }
            Ok(_) => {}
            Err(e) => warn!("unparseable midi message: {e}"),
        }
    }

    /// Consumer side, at interrupt start: expire the receiving flag.
    pub fn interrupt_start(&self, millisecond: i64) {
        self.state.lock().tick(millisecond);
    }

    /// Consumer side: drain the ring, advancing transport state and
    /// cooking events into `out`. Events are processed in arrival order
    /// at the start of the interrupt.
    pub fn get_events(&self, out: &mut Vec<SyncEvent>) {
        let state = self.state.lock();
        loop {
            let tail = self.tail.load(Ordering::Relaxed);
            if tail == self.head.load(Ordering::Acquire) {
                break;
            }
            let event = *self.events[tail].lock();
            let mut next = tail + 1;
            if next >= MAX_SYNC_EVENTS {
                next = 0;
            }
            self.tail.store(next, Ordering::Release);

            state.advance(&event);

            match event.status {
                MidiStatus::Stop => out.push(SyncEvent {
                    etype: SyncEventType::Stop,
                    pulse: PulseType::Clock,
                    beat: state.beat,
                    continue_pulse: 0,
                    millisecond: event.clock,
                }),
                MidiStatus::Clock => {
                    if state.waiting_status == Some(MidiStatus::Continue) {
                        let pulse = if state.beat_clock == 0 {
                            PulseType::Beat
                        } else {
                            PulseType::Clock
                        };
                        out.push(SyncEvent {
                            etype: SyncEventType::Continue,
                            pulse,
                            beat: state.beat,
                            continue_pulse: state.song_clock,
                            millisecond: event.clock,
                        });
                    } else if state.waiting_status == Some(MidiStatus::Start) {
                        // by definition a beat and bar boundary
                        out.push(SyncEvent {
                            etype: SyncEventType::Start,
                            pulse: PulseType::Beat,
                            beat: 0,
                            continue_pulse: 0,
                            millisecond: event.clock,
                        });
                    } else {
                        let pulse = if state.beat_clock != 0 {
                            PulseType::Clock
                        } else {
                            PulseType::Beat
                        };
                        out.push(SyncEvent {
                            etype: SyncEventType::Pulse,
                            pulse,
                            beat: state.beat,
                            continue_pulse: 0,
                            millisecond: event.clock,
                        });
                    }
                }
                // Start/Continue/SongPosition only arm state; the
                // following clock produces the event
                _ => {}
            }
        }
    }
}

impl Default for MidiQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(queue: &MidiQueue) -> Vec<SyncEvent> {
        let mut out = Vec::new();
        queue.get_events(&mut out);
        out
    }

    #[test]
    fn clocks_become_pulses_with_beat_tags() {
        let queue = MidiQueue::new();
        queue.add(MidiStatus::Start, 0, 0);
        for i in 0..25 {
            queue.add(MidiStatus::Clock, i, 0);
        }
        let events = drain(&queue);
        assert_eq!(events.len(), 25);
        // first clock after Start is the start event, on a beat
        assert_eq!(events[0].etype, SyncEventType::Start);
        assert_eq!(events[0].pulse, PulseType::Beat);
        for e in &events[1..24] {
            assert_eq!(e.etype, SyncEventType::Pulse);
            assert_eq!(e.pulse, PulseType::Clock);
        }
        // clock 24 wraps the beat
        assert_eq!(events[24].pulse, PulseType::Beat);
        assert_eq!(events[24].beat, 1);
    }

    #[test]
    fn continue_uses_armed_song_position() {
        let queue = MidiQueue::new();
        // song position 8 sixteenths = 48 clocks = beat 2
        queue.add(MidiStatus::SongPosition, 0, 8);
        queue.add(MidiStatus::Continue, 1, 0);
        queue.add(MidiStatus::Clock, 2, 0);
        let events = drain(&queue);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].etype, SyncEventType::Continue);
        assert_eq!(events[0].continue_pulse, 48);
        assert_eq!(events[0].pulse, PulseType::Beat);
        assert_eq!(queue.state().beat, 2);
    }

    #[test]
    fn stop_emits_stop_event() {
        let queue = MidiQueue::new();
        queue.add(MidiStatus::Stop, 5, 0);
        let events = drain(&queue);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].etype, SyncEventType::Stop);
        assert!(!queue.state().started);
    }

    #[test]
    fn overflow_drops_newest_and_counts() {
        let queue = MidiQueue::new();
        let capacity = MAX_SYNC_EVENTS - 1;
        for i in 0..(capacity + 10) {
            queue.add(MidiStatus::Clock, i as i64, 0);
        }
        assert_eq!(queue.overflows(), 10);
        let events = drain(&queue);
        assert_eq!(events.len(), capacity);
        // drained events keep arrival order
        assert_eq!(events[0].millisecond, 0);
        assert_eq!(events[capacity - 1].millisecond, capacity as i64 - 1);
    }

    #[test]
    fn receiving_clocks_expires() {
        let queue = MidiQueue::new();
        queue.add(MidiStatus::Clock, 0, 0);
        queue.add(MidiStatus::Clock, 20, 0);
        let _ = drain(&queue);
        assert!(queue.state().receiving_clocks);
        queue.interrupt_start(20 + MAX_CLOCK_GAP_MS + 1);
        assert!(!queue.state().receiving_clocks);
    }

    #[test]
    fn raw_bytes_parse_to_statuses() {
        let queue = MidiQueue::new();
        queue.add_bytes(&[0xF8], 0); // clock
        queue.add_bytes(&[0xFA], 1); // start
        queue.add_bytes(&[0xFC], 2); // stop
        queue.add_bytes(&[0xF2, 0x08, 0x00], 3); // song position 8
        assert!(queue.has_events());
        let _ = drain(&queue);
        assert_eq!(queue.state().song_position, 8);
    }
}
