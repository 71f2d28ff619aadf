//! Simulated PWM driver for development machines and CI.
//!
//! [`SimDriver`] never touches hardware. It remembers the last pulse written
//! to every channel, logs each write at `debug` level, and appends it to a
//! [`PulseJournal`] so tests can assert on the exact write sequence and its
//! timing.
//!
//! # Example
//!
//! ```rust
//! use neogrip_hal::driver::{self, PulseDriver};
//! use neogrip_hal::sim::SimDriver;
//!
//! let (sim, journal) = SimDriver::with_journal(330);
//! let shared = driver::shared(sim);
//! driver::write_pulse(&shared, 3, 2000).expect("sim write must succeed");
//!
//! assert_eq!(journal.pulses_for(3), vec![2000]);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use neogrip_types::NeoError;
use tokio::time::Instant;
use tracing::debug;

use crate::driver::PulseDriver;

// ────────────────────────────────────────────────────────────────────────────
// Journal
// ────────────────────────────────────────────────────────────────────────────

/// A single recorded write.
///
/// `at` uses the Tokio clock so tests running with a paused clock observe
/// exact virtual delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseWrite {
    pub channel: u8,
    pub pulse_us: u16,
    pub at: Instant,
}

#[derive(Default)]
struct JournalInner {
    writes: Vec<PulseWrite>,
    released: bool,
}

/// Cloneable handle onto the write history of a [`SimDriver`].
#[derive(Clone, Default)]
pub struct PulseJournal {
    inner: Arc<Mutex<JournalInner>>,
}

impl PulseJournal {
    /// Every write so far, oldest first.
    pub fn writes(&self) -> Vec<PulseWrite> {
        self.inner
            .lock()
            .map(|j| j.writes.clone())
            .unwrap_or_default()
    }

    /// Pulse widths written to `channel`, oldest first.
    pub fn pulses_for(&self, channel: u8) -> Vec<u16> {
        self.writes()
            .into_iter()
            .filter(|w| w.channel == channel)
            .map(|w| w.pulse_us)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|j| j.writes.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget all recorded writes (the released flag is kept).
    pub fn clear(&self) {
        if let Ok(mut j) = self.inner.lock() {
            j.writes.clear();
        }
    }

    /// Whether [`PulseDriver::release`] has been called.
    pub fn released(&self) -> bool {
        self.inner.lock().map(|j| j.released).unwrap_or(false)
    }

    fn record(&self, write: PulseWrite) {
        if let Ok(mut j) = self.inner.lock() {
            j.writes.push(write);
        }
    }

    fn mark_released(&self) {
        if let Ok(mut j) = self.inner.lock() {
            j.released = true;
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimDriver
// ────────────────────────────────────────────────────────────────────────────

/// Simulated 16-channel PWM output. Always succeeds unless a fault has been
/// injected with [`SimDriver::with_fault_on`].
pub struct SimDriver {
    id: String,
    frequency_hz: u16,
    last: HashMap<u8, u16>,
    journal: PulseJournal,
    faulty_channel: Option<u8>,
}

impl SimDriver {
    pub fn new(frequency_hz: u16) -> Self {
        Self {
            id: "sim".to_string(),
            frequency_hz,
            last: HashMap::new(),
            journal: PulseJournal::default(),
            faulty_channel: None,
        }
    }

    /// Create a driver together with a handle onto its write journal.
    pub fn with_journal(frequency_hz: u16) -> (Self, PulseJournal) {
        let driver = Self::new(frequency_hz);
        let journal = driver.journal.clone();
        (driver, journal)
    }

    /// Make every write to `channel` fail with a hardware fault.
    pub fn with_fault_on(mut self, channel: u8) -> Self {
        self.faulty_channel = Some(channel);
        self
    }

    pub fn frequency_hz(&self) -> u16 {
        self.frequency_hz
    }
}

impl PulseDriver for SimDriver {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_pulse_width(&mut self, channel: u8, pulse_us: u16) -> Result<(), NeoError> {
        if self.faulty_channel == Some(channel) {
            return Err(NeoError::HardwareFault {
                component: format!("{}/ch{channel:02}", self.id),
                details: "injected fault".to_string(),
            });
        }
        debug!(
            channel,
            pulse_us,
            frequency_hz = self.frequency_hz,
            "sim pulse"
        );
        self.last.insert(channel, pulse_us);
        self.journal.record(PulseWrite {
            channel,
            pulse_us,
            at: Instant::now(),
        });
        Ok(())
    }

    fn last_pulse(&self, channel: u8) -> Option<u16> {
        self.last.get(&channel).copied()
    }

    fn release(&mut self) -> Result<(), NeoError> {
        debug!(driver = %self.id, "sim release");
        self.journal.mark_released();
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
