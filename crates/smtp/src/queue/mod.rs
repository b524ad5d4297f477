/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod agent;
pub mod dsn;
pub mod manager;

/// Process-wide kill switch for outgoing mail. Tripped when a delivery
/// attempt cannot record its outcome, because retrying without a record
/// risks sending the same message twice; restart is operator-mediated.
#[derive(Clone, Default)]
pub struct SpoolHalt {
    halted: Arc<AtomicBool>,
}

impl SpoolHalt {
    pub fn new() -> Self {
        SpoolHalt::default()
    }

    pub fn shutdown(&self) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            tracing::error!(
                context = "spool",
                event = "halt",
                "Shutting down outgoing mail due to a software problem. \
                 Operator attention is required."
            );
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halt_latches() {
        let halt = SpoolHalt::new();
        assert!(!halt.is_halted());
        halt.shutdown();
        assert!(halt.is_halted());
        let clone = halt.clone();
        assert!(clone.is_halted());
    }
}
