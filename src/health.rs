use std::{collections::HashMap, sync::Mutex};

use chrono::{DateTime, Utc};

/// Liveness registry. Every background loop writes its own monotonic
/// timestamp once per iteration; external observers read the snapshot to
/// detect a stalled loop.
#[derive(Default)]
pub struct Heartbeats {
    beats: Mutex<HashMap<&'static str, DateTime<Utc>>>,
}

impl Heartbeats {
    pub fn beat(&self, loop_name: &'static str) {
        let mut beats = self.beats.lock().expect("heartbeat lock poisoned");
        beats.insert(loop_name, Utc::now());
    }

    pub fn last_beat(&self, loop_name: &str) -> Option<DateTime<Utc>> {
        let beats = self.beats.lock().expect("heartbeat lock poisoned");
        beats.get(loop_name).copied()
    }

    pub fn snapshot(&self) -> Vec<(&'static str, DateTime<Utc>)> {
        let beats = self.beats.lock().expect("heartbeat lock poisoned");
        let mut snapshot: Vec<_> = beats.iter().map(|(name, at)| (*name, *at)).collect();
        snapshot.sort_by_key(|(name, _)| *name);
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_beats_are_monotonic_per_loop() {
        let heartbeats = Heartbeats::default();
        heartbeats.beat("download");
        let first = heartbeats.last_beat("download").unwrap();
        heartbeats.beat("download");
        let second = heartbeats.last_beat("download").unwrap();

        assert!(second >= first);
        assert_eq!(heartbeats.snapshot().len(), 1);
    }

    #[test]
    fn test_unknown_loop_has_no_beat() {
        let heartbeats = Heartbeats::default();
        assert_eq!(heartbeats.last_beat("nope"), None);
    }
}
