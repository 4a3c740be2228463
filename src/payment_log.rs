use std::time::Instant;

use log::{debug, error, info};

const TARGET: &str = "payments";

/// Step-by-step trace of one payment operation, keyed by transaction id.
/// Enable with `RUST_LOG=payments=debug`.
pub struct PaymentDebugLogger {
    operation: &'static str,
    transaction_id: String,
    started: Instant,
}

impl PaymentDebugLogger {
    pub fn start(operation: &'static str, transaction_id: &str) -> Self {
        debug!(target: TARGET, "[{operation}] tx={transaction_id} started");
        PaymentDebugLogger {
            operation,
            transaction_id: transaction_id.to_string(),
            started: Instant::now(),
        }
    }

    pub fn step(&self, detail: impl AsRef<str>) {
        debug!(
            target: TARGET,
            "[{}] tx={} +{}ms {}",
            self.operation,
            self.transaction_id,
            self.started.elapsed().as_millis(),
            detail.as_ref()
        );
    }

    pub fn failed(&self, err: &dyn std::fmt::Display) {
        error!(
            target: TARGET,
            "[{}] tx={} failed after {}ms: {}",
            self.operation,
            self.transaction_id,
            self.started.elapsed().as_millis(),
            err
        );
    }

    pub fn finished(&self, outcome: impl AsRef<str>) {
        info!(
            target: TARGET,
            "[{}] tx={} {} in {}ms",
            self.operation,
            self.transaction_id,
            outcome.as_ref(),
            self.started.elapsed().as_millis()
        );
    }
}
