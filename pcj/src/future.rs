use crate::error::{Error, ErrorKind, Result};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A one-shot completion slot carrying either a value or an error.
///
/// Signaling is idempotent: the first signal wins and later ones are
/// ignored. The slot is shared between the requesting thread and the worker
/// that eventually settles it; waiting suspends the caller until then.
pub struct Completion<T> {
    slot: Mutex<Option<Result<T>>>,
    cond: Condvar,
}

impl<T> Completion<T> {
    pub fn new() -> Completion<T> {
        Completion {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Settles the slot. Returns false if it was already settled.
    pub fn signal(&self, outcome: Result<T>) -> bool {
        let mut slot = self.slot.lock().unwrap();

        if slot.is_some() {
            return false;
        }

        *slot = Some(outcome);
        self.cond.notify_all();
        true
    }

    /// True once the slot has been settled.
    pub fn is_done(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    /// Blocks until the slot is settled and takes the outcome.
    pub fn wait(&self) -> Result<T> {
        let mut slot = self.slot.lock().unwrap();

        loop {
            match slot.take() {
                Some(outcome) => return outcome,
                None => slot = self.cond.wait(slot).unwrap(),
            }
        }
    }

    /// Blocks until the slot is settled or the timeout elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut slot = self.slot.lock().unwrap();

        loop {
            if let Some(outcome) = slot.take() {
                return outcome;
            }

            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(Error::new(ErrorKind::Timeout));
            }

            let (guard, _) = self.cond.wait_timeout(slot, deadline - now).unwrap();
            slot = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn signal_then_wait() {
        let slot = Completion::new();

        assert!(slot.signal(Ok(7)));
        assert!(slot.is_done());
        assert_eq!(slot.wait().unwrap(), 7);
    }

    #[test]
    fn signal_is_idempotent() {
        let slot = Completion::new();

        assert!(slot.signal(Ok(1)));
        assert!(!slot.signal(Ok(2)));
        assert!(!slot.signal(Err(Error::new(ErrorKind::ConnectionLost))));

        assert_eq!(slot.wait().unwrap(), 1);
    }

    #[test]
    fn wait_suspends_until_signal() {
        let slot = Arc::new(Completion::new());
        let signaler = slot.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaler.signal(Ok(42u64));
        });

        assert_eq!(slot.wait().unwrap(), 42);
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_expires() {
        let slot: Completion<()> = Completion::new();
        let err = slot.wait_timeout(Duration::from_millis(10)).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn error_outcome_re_raises() {
        let slot: Completion<()> = Completion::new();
        slot.signal(Err(Error::new(ErrorKind::NoSuchVariable)));

        assert_eq!(slot.wait().unwrap_err().kind(), ErrorKind::NoSuchVariable);
    }
}
