//! Synthetic interrupt injection.

use log::debug;

/// One pending request. Higher priorities win.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptRequest {
    pub vector: u32,
    pub priority: u8,
}

/// Polled by an emulator at every instruction boundary.
pub trait InterruptSource {
    /// The request that should be taken now, if any. `cycles` is the number
    /// of instructions retired so far.
    fn highest_pending(&self, cycles: u64) -> Option<InterruptRequest>;

    /// Called once the emulator has entered the handler for `request`.
    fn acknowledge(&mut self, request: InterruptRequest);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Scheduled {
    request: InterruptRequest,
    at_cycle: Option<u64>,
}

/// A simple queue of requests, each either raised immediately or held back
/// until a given retirement count.
#[derive(Debug, Default, Clone)]
pub struct InterruptQueue {
    pending: Vec<Scheduled>,
}

impl InterruptQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&mut self, vector: u32, priority: u8) {
        self.pending.push(Scheduled {
            request: InterruptRequest { vector, priority },
            at_cycle: None,
        });
    }

    pub fn schedule(&mut self, vector: u32, priority: u8, at_cycle: u64) {
        self.pending.push(Scheduled {
            request: InterruptRequest { vector, priority },
            at_cycle: Some(at_cycle),
        });
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl InterruptSource for InterruptQueue {
    fn highest_pending(&self, cycles: u64) -> Option<InterruptRequest> {
        self.pending
            .iter()
            .filter(|s| s.at_cycle.is_none_or(|at| cycles >= at))
            // ties go to the earliest request
            .rev()
            .max_by_key(|s| s.request.priority)
            .map(|s| s.request)
    }

    fn acknowledge(&mut self, request: InterruptRequest) {
        if let Some(pos) = self.pending.iter().position(|s| s.request == request) {
            debug!(
                "interrupt vector {:X} (priority {}) acknowledged",
                request.vector, request.priority
            );
            self.pending.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_priority_first() {
        let mut queue = InterruptQueue::new();
        queue.raise(5, 1);
        queue.raise(9, 3);
        queue.raise(7, 3);
        let first = queue.highest_pending(0).unwrap();
        assert_eq!(first, InterruptRequest { vector: 9, priority: 3 });
        queue.acknowledge(first);
        assert_eq!(queue.highest_pending(0).unwrap().vector, 7);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn scheduled_requests_wait_for_their_cycle() {
        let mut queue = InterruptQueue::new();
        queue.schedule(5, 1, 10);
        assert_eq!(queue.highest_pending(9), None);
        assert_eq!(queue.highest_pending(10).unwrap().vector, 5);
    }
}
