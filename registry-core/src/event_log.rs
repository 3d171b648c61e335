//! Per-pool event log.
//!
//! Implements:
//! - Append-only history with contiguous event times
//! - Suffix reads for catching members up
//! - Purging of history every member has acknowledged
//!
//! The buffered events always cover `min_event_time..current_event_time`
//! without gaps, so the event with time `t` sits at offset `t - min_event_time`.

use crate::error::{RegistryError, Result};
use crate::types::{Event, EventKind, EventTime, Identity};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Ring of the events not yet purged from a pool's history
#[derive(Debug, Default)]
pub struct EventLog {
    events: VecDeque<Event>,
    min_event_time: EventTime,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time the next appended event will get
    pub fn current_event_time(&self) -> EventTime {
        self.min_event_time + self.events.len() as EventTime
    }

    /// Time of the oldest event still buffered
    pub fn min_event_time(&self) -> EventTime {
        self.min_event_time
    }

    /// Number of buffered events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    /// Append a new event stamped with the current event time
    pub fn append(
        &mut self,
        kind: EventKind,
        label: Option<String>,
        subjects: Vec<Identity>,
    ) -> &Event {
        let event = Event::new(self.current_event_time(), kind, label, subjects);
        debug!("EventLog: adding {}", event);
        self.events.push_back(event);
        // non-empty after push_back
        &self.events[self.events.len() - 1]
    }

    /// Events from `start` onwards, or the whole buffered history for `None`
    /// (a member that has not received anything yet).
    pub fn events_since(&self, start: Option<EventTime>) -> Result<Vec<Event>> {
        let start = match start {
            None => return Ok(self.events.iter().cloned().collect()),
            Some(start) => start,
        };

        if start < self.min_event_time {
            return Err(RegistryError::StaleRequest {
                requested: start,
                min_event_time: self.min_event_time,
            });
        }

        let offset = (start - self.min_event_time) as usize;
        Ok(self.events.iter().skip(offset).cloned().collect())
    }

    /// SIGNAL events at or after `since` that name the given member
    pub fn signals_for(&self, identity: &Identity, since: EventTime) -> Vec<Event> {
        self.events
            .iter()
            .filter(|e| e.time >= since && e.kind == EventKind::Signal && e.concerns(identity))
            .cloned()
            .collect()
    }

    /// Drop all events before `event_time`, which becomes the new minimum.
    ///
    /// Returns false and leaves the log untouched when the new minimum would
    /// move backwards or reach the current event time.
    pub fn purge_upto(&mut self, event_time: EventTime) -> bool {
        if event_time < self.min_event_time {
            warn!(
                "EventLog: tried to set minimum event time backwards from {} to {}",
                self.min_event_time, event_time
            );
            return false;
        }

        if event_time >= self.current_event_time() {
            warn!(
                "EventLog: tried to set minimum event time to {}, current time is {}",
                event_time,
                self.current_event_time()
            );
            return false;
        }

        while self
            .events
            .front()
            .map(|e| e.time < event_time)
            .unwrap_or(false)
        {
            self.events.pop_front();
        }
        self.min_event_time = event_time;

        debug!("EventLog: minimum event time now {}", event_time);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Location;

    fn identity(id: &str) -> Identity {
        Identity::new(
            id,
            "pool",
            "127.0.0.1:1".parse().unwrap(),
            Location::default(),
            Vec::new(),
        )
    }

    fn log_with(n: usize) -> EventLog {
        let mut log = EventLog::new();
        for i in 0..n {
            log.append(EventKind::Join, None, vec![identity(&i.to_string())]);
        }
        log
    }

    #[test]
    fn test_append_stamps_contiguous_times() {
        let log = log_with(3);
        let times: Vec<_> = log.iter().map(|e| e.time).collect();
        assert_eq!(times, vec![0, 1, 2]);
        assert_eq!(log.current_event_time(), 3);
    }

    #[test]
    fn test_events_since() {
        let log = log_with(4);

        let suffix = log.events_since(Some(1)).unwrap();
        assert_eq!(suffix.iter().map(|e| e.time).collect::<Vec<_>>(), vec![1, 2, 3]);

        assert!(log.events_since(Some(4)).unwrap().is_empty());
        assert!(log.events_since(Some(10)).unwrap().is_empty());
        assert_eq!(log.events_since(None).unwrap().len(), 4);
    }

    #[test]
    fn test_purge_keeps_suffix_identical() {
        let mut log = log_with(6);
        let before = log.events_since(Some(3)).unwrap();

        assert!(log.purge_upto(3));
        assert_eq!(log.min_event_time(), 3);
        assert_eq!(log.current_event_time(), 6);
        assert_eq!(log.events_since(Some(3)).unwrap(), before);
        assert_eq!(log.iter().next().map(|e| e.time), Some(3));
    }

    #[test]
    fn test_stale_request_after_purge() {
        let mut log = log_with(5);
        log.purge_upto(2);

        match log.events_since(Some(1)) {
            Err(RegistryError::StaleRequest {
                requested,
                min_event_time,
            }) => {
                assert_eq!(requested, 1);
                assert_eq!(min_event_time, 2);
            }
            other => panic!("Expected StaleRequest, got {:?}", other),
        }

        // full history request returns what is still buffered
        assert_eq!(log.events_since(None).unwrap().len(), 3);
    }

    #[test]
    fn test_purge_guards() {
        let mut log = log_with(4);
        assert!(log.purge_upto(2));

        assert!(!log.purge_upto(1));
        assert!(!log.purge_upto(4));
        assert!(!log.purge_upto(9));
        assert_eq!(log.min_event_time(), 2);
        assert_eq!(log.len(), 2);

        // same minimum again is allowed and changes nothing
        assert!(log.purge_upto(2));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_signals_for() {
        let mut log = log_with(2);
        log.append(
            EventKind::Signal,
            Some("stop".to_string()),
            vec![identity("0")],
        );
        log.append(
            EventKind::Signal,
            Some("go".to_string()),
            vec![identity("1")],
        );

        let signals = log.signals_for(&identity("0"), 0);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].label.as_deref(), Some("stop"));

        assert!(log.signals_for(&identity("0"), 3).is_empty());
    }
}
