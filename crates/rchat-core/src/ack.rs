use rchat_abstract::TimerService;
use serde::Serialize;
use tracing::trace;

use crate::window::SendWindow;

/// Channel an acknowledgment value arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AckSource {
    SendResponse,
    PollResponse,
}

/// Funnels acks from both response channels into the send window.
///
/// The two channels race each other, so values may arrive out of order;
/// the window's monotonic filter makes that harmless.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AckProcessor {
    applied: u64,
    redundant: u64,
    highest: Option<i64>,
}

impl AckProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_ack<C>(
        &mut self,
        window: &mut SendWindow,
        timers: &mut C,
        ack: i64,
        source: AckSource,
    ) -> usize
    where
        C: TimerService + ?Sized,
    {
        let released = window.on_ack(timers, ack);
        if released > 0 {
            self.applied += 1;
        } else {
            self.redundant += 1;
            trace!("Ack {} via {:?} released nothing", ack, source);
        }
        self.highest = Some(self.highest.map_or(ack, |h| h.max(ack)));
        released
    }

    /// Acks that released at least one segment.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Stale, duplicate or empty acks.
    pub fn redundant(&self) -> u64 {
        self.redundant
    }

    pub fn highest(&self) -> Option<i64> {
        self.highest
    }
}
