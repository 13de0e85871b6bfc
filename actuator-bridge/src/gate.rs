//! Arrival counting for the startup self-test.

/// Counts inbound messages and answers whether a self-test phase may advance.
///
/// Every arrival counts, whatever its content. Phase `n` publishes one message
/// and is satisfied once `n + 1` arrivals have been seen, i.e. once its own
/// message has come back through the subscription. The count only grows.
#[derive(Debug, Default, Clone)]
pub struct ConfirmationGate {
    arrivals: u64,
}

impl ConfirmationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one arrival and return the new total.
    pub fn observe(&mut self) -> u64 {
        self.arrivals += 1;
        self.arrivals
    }

    /// True once more than `threshold` arrivals have been observed.
    pub fn reached(&self, threshold: u64) -> bool {
        self.arrivals > threshold
    }

    pub fn count(&self) -> u64 {
        self.arrivals
    }
}
