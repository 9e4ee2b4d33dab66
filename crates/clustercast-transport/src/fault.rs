//! Datagram-level fault injection for loss and flow-control tests.
//!
//! The hooks observe raw datagrams right after receive and right before
//! transmit; returning `true` drops the datagram. Production code leaves
//! both hooks unset, in which case the checks are a single mutex-guarded
//! `Option` test.

use std::sync::Mutex;

/// Decision hook over a raw datagram; `true` means drop it.
pub type DropFn = Box<dyn FnMut(&[u8]) -> bool + Send>;

/// Holds the optional drop hooks for one multiplexer instance.
#[derive(Default)]
pub(crate) struct FaultInjector {
    recv_drop: Mutex<Option<DropFn>>,
    send_drop: Mutex<Option<DropFn>>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_recv_drop(&self, hook: Option<DropFn>) {
        *self.recv_drop.lock().unwrap() = hook;
    }

    pub fn set_send_drop(&self, hook: Option<DropFn>) {
        *self.send_drop.lock().unwrap() = hook;
    }

    /// Consults the receive hook for a just-received datagram.
    pub fn drop_incoming(&self, datagram: &[u8]) -> bool {
        match self.recv_drop.lock().unwrap().as_mut() {
            Some(hook) => hook(datagram),
            None => false,
        }
    }

    /// Consults the send hook for an outgoing datagram.
    pub fn drop_outgoing(&self, datagram: &[u8]) -> bool {
        match self.send_drop.lock().unwrap().as_mut() {
            Some(hook) => hook(datagram),
            None => false,
        }
    }
}

impl std::fmt::Debug for FaultInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultInjector")
            .field("recv_hook", &self.recv_drop.lock().unwrap().is_some())
            .field("send_hook", &self.send_drop.lock().unwrap().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_hooks_drop_nothing() {
        let faults = FaultInjector::new();
        assert!(!faults.drop_incoming(&[1, 2, 3]));
        assert!(!faults.drop_outgoing(&[1, 2, 3]));
    }

    #[test]
    fn nth_datagram_drop() {
        let faults = FaultInjector::new();
        let mut seen = 0u32;
        faults.set_recv_drop(Some(Box::new(move |_| {
            seen += 1;
            seen == 2
        })));

        assert!(!faults.drop_incoming(b"a"));
        assert!(faults.drop_incoming(b"b"));
        assert!(!faults.drop_incoming(b"c"));
    }

    #[test]
    fn hooks_clear() {
        let faults = FaultInjector::new();
        faults.set_send_drop(Some(Box::new(|_| true)));
        assert!(faults.drop_outgoing(b"x"));
        faults.set_send_drop(None);
        assert!(!faults.drop_outgoing(b"x"));
    }
}
