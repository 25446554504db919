//! Prefetch queue cycle model for the 8088/8086/286.
//!
//! The bus interface unit refills the queue while the execution unit is busy;
//! an instruction byte that is not yet in the queue stalls until a bus transfer
//! brings it in. Later cores have caches and no queue model (`size == 0`).

use serde::{Deserialize, Serialize};

use crate::model::CpuModel;

/// Clocks per bus transfer.
const BUS_CYCLE: i32 = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefetchQueue {
    size: u8,
    /// Bytes per bus transfer.
    bus_bytes: u8,
    /// Bytes currently queued.
    fill: u8,
    /// Leftover clocks toward the next transfer; negative while data accesses
    /// hold the bus.
    credit: i32,
}

impl PrefetchQueue {
    pub fn new(model: &CpuModel) -> Self {
        Self {
            size: model.prefetch_bytes,
            bus_bytes: (model.bus_width / 8).max(1),
            fill: 0,
            credit: 0,
        }
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.size != 0
    }

    #[inline]
    pub fn fill(&self) -> u8 {
        self.fill
    }

    /// Let `cycles` of execution time refill the queue.
    pub fn advance(&mut self, cycles: i64) {
        if !self.enabled() || cycles <= 0 {
            return;
        }
        self.credit = self.credit.saturating_add(cycles.min(i64::from(i32::MAX)) as i32);
        while self.credit >= BUS_CYCLE && self.fill < self.size {
            self.credit -= BUS_CYCLE;
            self.fill = (self.fill + self.bus_bytes).min(self.size);
        }
        if self.fill == self.size {
            self.credit = self.credit.min(BUS_CYCLE);
        }
    }

    /// Take `n` bytes for the decoder; returns stall clocks.
    pub fn consume(&mut self, n: u8) -> u32 {
        if !self.enabled() {
            return 0;
        }
        if self.fill >= n {
            self.fill -= n;
            return 0;
        }
        let missing = n - self.fill;
        self.fill = 0;
        let transfers = missing.div_ceil(self.bus_bytes);
        // The transfer that fetched the last byte may have brought a spare one.
        let fetched = transfers * self.bus_bytes;
        self.fill = fetched - missing;
        u32::from(transfers) * BUS_CYCLE as u32
    }

    /// A control transfer discards queued bytes.
    #[inline]
    pub fn flush(&mut self) {
        self.fill = 0;
        self.credit = 0;
    }

    /// Memory operand traffic competes with prefetching.
    pub fn note_data_access(&mut self, len: u32) {
        if !self.enabled() {
            return;
        }
        let transfers = len.div_ceil(u32::from(self.bus_bytes)) as i32;
        self.credit -= transfers * BUS_CYCLE;
    }
}
