//! Exit history for post-mortem debugging of a guest.

use crate::intel::vmerror::VmxBasicExitReason;

/// Number of exits remembered per guest.
pub const EXIT_HISTORY_LEN: usize = 16;

/// Ring of the last [`EXIT_HISTORY_LEN`] (exit reason, RIP) pairs of one guest.
#[derive(Debug, Clone, Default)]
pub struct ExitHistory {
    count: u64,
    reasons: [u32; EXIT_HISTORY_LEN],
    rips: [u64; EXIT_HISTORY_LEN],
}

impl ExitHistory {
    pub const fn new() -> Self {
        Self {
            count: 0,
            reasons: [0; EXIT_HISTORY_LEN],
            rips: [0; EXIT_HISTORY_LEN],
        }
    }

    /// Records one exit.
    pub fn record(&mut self, exit_reason: u32, rip: u64) {
        let idx = (self.count % EXIT_HISTORY_LEN as u64) as usize;
        self.reasons[idx] = exit_reason;
        self.rips[idx] = rip;

        if self.count != 0 && self.count % 100_000 == 0 {
            log::debug!("VM-exit milestone: {} exits", self.count);
        }
        self.count += 1;
    }

    /// Total number of exits recorded.
    pub fn total(&self) -> u64 {
        self.count
    }

    /// The remembered exits, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        let kept = self.count.min(EXIT_HISTORY_LEN as u64);

        (self.count - kept..self.count).map(move |n| {
            let idx = (n % EXIT_HISTORY_LEN as u64) as usize;
            (self.reasons[idx], self.rips[idx])
        })
    }

    /// Logs the remembered exits at error level.
    pub fn dump(&self) {
        log::error!("=== LAST {} VM-EXITS ===", EXIT_HISTORY_LEN);

        for (i, (reason, rip)) in self.entries().enumerate() {
            match VmxBasicExitReason::from_u32(reason) {
                Some(name) => log::error!("  [{}] Exit reason {} ({:?}) @ RIP {:#x}", i, reason, name, rip),
                None => log::error!("  [{}] Exit reason {} (Other) @ RIP {:#x}", i, reason, rip),
            }
        }

        log::error!("Total exits: {}", self.total());
    }
}
