//! Per-opcode communication statistics of the registry server

use crate::protocol::Opcode;
use std::fmt::Write;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub type Counter = AtomicU64;

#[derive(Debug, Default)]
struct OpcodeCounters {
    count: Counter,
    bytes_in: Counter,
    bytes_out: Counter,
    micros: Counter,
}

/// Snapshot of the counters of one opcode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpcodeStatistics {
    pub count: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub micros: u64,
}

#[derive(Debug, Clone, Default)]
/// Live counters shared by every connection handler.
pub struct CommunicationStatistics(Arc<CommunicationStatisticsInner>);

impl Deref for CommunicationStatistics {
    type Target = CommunicationStatisticsInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct CommunicationStatisticsInner {
    opcodes: [OpcodeCounters; Opcode::COUNT],
    /// Connections that failed before a request could be decoded.
    failed: Counter,
}

impl CommunicationStatisticsInner {
    /// Record one handled request.
    pub fn record(&self, opcode: Opcode, bytes_in: u64, bytes_out: u64, elapsed: Duration) {
        let counters = &self.opcodes[opcode.as_u8() as usize];
        counters.count.fetch_add(1, Ordering::Relaxed);
        counters.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        counters.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
        counters
            .micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counters of one opcode.
    pub fn get(&self, opcode: Opcode) -> OpcodeStatistics {
        let counters = &self.opcodes[opcode.as_u8() as usize];
        OpcodeStatistics {
            count: counters.count.load(Ordering::Relaxed),
            bytes_in: counters.bytes_in.load(Ordering::Relaxed),
            bytes_out: counters.bytes_out.load(Ordering::Relaxed),
            micros: counters.micros.load(Ordering::Relaxed),
        }
    }

    /// The number of connections dropped because of a bad request.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Multi-line table of all opcodes that were used at least once.
    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<12} {:>8} {:>12} {:>12} {:>10}",
            "OPCODE", "COUNT", "BYTES_IN", "BYTES_OUT", "AVG_MS"
        );

        let mut totals = OpcodeStatistics::default();
        for opcode in Opcode::ALL {
            let stats = self.get(opcode);
            if stats.count == 0 {
                continue;
            }
            let _ = writeln!(
                out,
                "{:<12} {:>8} {:>12} {:>12} {:>10.2}",
                opcode.name(),
                stats.count,
                stats.bytes_in,
                stats.bytes_out,
                stats.micros as f64 / stats.count as f64 / 1000.0
            );
            totals.count += stats.count;
            totals.bytes_in += stats.bytes_in;
            totals.bytes_out += stats.bytes_out;
        }

        let _ = write!(
            out,
            "{:<12} {:>8} {:>12} {:>12} (failed: {})",
            "TOTAL",
            totals.count,
            totals.bytes_in,
            totals.bytes_out,
            self.failed()
        );
        out
    }
}
