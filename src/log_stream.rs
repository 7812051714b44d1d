use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_with::serde_as;
use time::OffsetDateTime;
use tokio::sync::{broadcast, watch};

use crate::utils::matches_hex_pattern;

const FANOUT_CHANNEL_CAPACITY: usize = 256;

/// Direction of a logged payload relative to the peripheral.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    /// Client bytes written to the write characteristic.
    Tx,
    /// Notification bytes received from the notify characteristic.
    Rx,
}

/// One logged packet, fanned out to observability subscribers.
#[serde_as]
#[derive(Debug, Clone, Serialize)]
pub struct PacketLogEntry {
    /// Monotonic sequence number; subscriber watermarks compare against it.
    pub seq: u64,
    /// Unix timestamp in milliseconds.
    pub ts_ms: i64,
    pub direction: Direction,
    pub session_id: String,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub bytes: Vec<u8>,
}

impl PacketLogEntry {
    /// Returns true when the entry passes an optional hex-substring filter.
    #[must_use]
    pub fn matches_filter(&self, filter: Option<&str>) -> bool {
        match filter {
            Some(pattern) => matches_hex_pattern(&self.bytes, pattern),
            None => true,
        }
    }
}

/// Fixed-capacity ring of packet log entries with live fan-out.
///
/// Writers are the session forwarders; readers never block them. Live
/// subscribers that fall behind the broadcast channel miss entries rather
/// than applying backpressure, and can re-read from their watermark.
pub struct PacketLog {
    entries: Mutex<VecDeque<PacketLogEntry>>,
    capacity: usize,
    next_seq: AtomicU64,
    fanout: broadcast::Sender<PacketLogEntry>,
}

impl PacketLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (fanout, _) = broadcast::channel(FANOUT_CHANNEL_CAPACITY);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            next_seq: AtomicU64::new(1),
            fanout,
        }
    }

    /// Appends one entry, evicting the oldest once the ring is full.
    pub fn append(&self, direction: Direction, session_id: &str, bytes: &[u8]) -> PacketLogEntry {
        let entry = PacketLogEntry {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            ts_ms: unix_millis_now(),
            direction,
            session_id: session_id.to_string(),
            bytes: bytes.to_vec(),
        };

        {
            let mut entries = self.entries.lock().expect("packet log lock poisoned");
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }

        // No subscribers is the common case; a send error just means that.
        let _ = self.fanout.send(entry.clone());
        entry
    }

    /// Returns retained entries newer than `watermark`, oldest first.
    #[must_use]
    pub fn entries_after(&self, watermark: u64) -> Vec<PacketLogEntry> {
        let entries = self.entries.lock().expect("packet log lock poisoned");
        entries
            .iter()
            .filter(|entry| entry.seq > watermark)
            .cloned()
            .collect()
    }

    /// Subscribes to entries appended after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PacketLogEntry> {
        self.fanout.subscribe()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("packet log lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn unix_millis_now() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    i64::try_from(nanos / 1_000_000).unwrap_or(i64::MAX)
}

/// Connection-state snapshot for `/health`-style consumers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionSnapshot {
    pub connected: bool,
    pub device_name: Option<String>,
    pub session_id: Option<String>,
    /// Unix milliseconds of the last TX/RX activity, when known.
    pub last_activity_ms: Option<i64>,
}

/// Shared connection-state cell, updated by sessions on every transition.
pub struct SharedState {
    tx: watch::Sender<ConnectionSnapshot>,
}

impl Default for SharedState {
    fn default() -> Self {
        let (tx, _) = watch::channel(ConnectionSnapshot::default());
        Self { tx }
    }
}

impl SharedState {
    /// Records a connected session.
    pub fn record_connected(&self, session_id: &str, device_name: Option<&str>) {
        self.tx.send_replace(ConnectionSnapshot {
            connected: true,
            device_name: device_name.map(str::to_string),
            session_id: Some(session_id.to_string()),
            last_activity_ms: Some(unix_millis_now()),
        });
    }

    /// Records TX/RX activity on the current session without changing
    /// connectedness.
    pub fn record_activity(&self) {
        self.tx.send_modify(|snapshot| {
            snapshot.last_activity_ms = Some(unix_millis_now());
        });
    }

    /// Records a disconnect; the session id is retained for post-mortems.
    pub fn record_disconnected(&self) {
        self.tx.send_modify(|snapshot| {
            snapshot.connected = false;
            snapshot.device_name = None;
        });
    }

    #[must_use]
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.tx.borrow().clone()
    }

    /// A watch receiver for consumers that want change notifications.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn ring_evicts_oldest_entries_at_capacity() {
        let log = PacketLog::new(3);
        for index in 0..5u8 {
            log.append(Direction::Tx, "s1", &[index]);
        }

        let retained: Vec<Vec<u8>> = log
            .entries_after(0)
            .into_iter()
            .map(|entry| entry.bytes)
            .collect();
        assert_eq!(vec![vec![2], vec![3], vec![4]], retained);
    }

    #[test]
    fn watermark_read_skips_already_seen_entries() {
        let log = PacketLog::new(10);
        log.append(Direction::Tx, "s1", &[0xA7]);
        let second = log.append(Direction::Rx, "s1", &[0xB3]);
        log.append(Direction::Tx, "s1", &[0x02]);

        let newer = log.entries_after(second.seq);
        assert_eq!(1, newer.len());
        assert_eq!(vec![0x02], newer[0].bytes);
    }

    #[test]
    fn tx_entries_for_a_session_are_totally_ordered() {
        let log = PacketLog::new(16);
        for index in 0..4u8 {
            log.append(Direction::Tx, "s1", &[index]);
        }

        let sequences: Vec<u64> = log
            .entries_after(0)
            .into_iter()
            .map(|entry| entry.seq)
            .collect();
        let mut sorted = sequences.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, sequences);
    }

    #[test]
    fn subscriber_receives_entries_appended_after_subscribe() {
        let log = PacketLog::new(4);
        log.append(Direction::Tx, "s1", &[0x01]);
        let mut rx = log.subscribe();
        log.append(Direction::Rx, "s1", &[0x02]);

        let received = rx.try_recv().expect("entry should be fanned out");
        assert_eq!(vec![0x02], received.bytes);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn entry_filter_matches_hex_pattern() {
        let log = PacketLog::new(4);
        let entry = log.append(Direction::Tx, "s1", &[0xA7, 0xB3, 0x02]);

        assert!(entry.matches_filter(None));
        assert!(entry.matches_filter(Some("a7b3")));
        assert!(!entry.matches_filter(Some("ff")));
    }

    #[test]
    fn entry_serializes_bytes_as_hex() {
        let log = PacketLog::new(4);
        let entry = log.append(Direction::Rx, "s1", &[0xA7, 0x00, 0xFF]);

        let json = serde_json::to_value(&entry).expect("entry should serialize");
        assert_eq!("a700ff", json["bytes"]);
        assert_eq!("RX", json["direction"]);
        assert_eq!("s1", json["session_id"]);
    }

    #[test]
    fn shared_state_tracks_connection_lifecycle() {
        let state = SharedState::default();
        assert!(!state.snapshot().connected);

        state.record_connected("s1", Some("CS108Reader42"));
        let snapshot = state.snapshot();
        assert!(snapshot.connected);
        assert_eq!(Some("CS108Reader42".to_string()), snapshot.device_name);
        assert_eq!(Some("s1".to_string()), snapshot.session_id);

        state.record_disconnected();
        let snapshot = state.snapshot();
        assert!(!snapshot.connected);
        assert_eq!(None, snapshot.device_name);
        assert_eq!(Some("s1".to_string()), snapshot.session_id);
    }
}
