use crate::error::{Error, ErrorKind, Result};
use hashbrown::HashMap;
use std::sync::{Condvar, Mutex};

/// An associative combiner over encoded values. Registered under a name in
/// the SPMD job so reduce and accumulate can run it on any node.
pub type CombineFn = fn(&[u8], &[u8]) -> Result<Vec<u8>>;

struct Var {
    value: Option<Vec<u8>>,
    // Unconsumed put notifications; what monitor blocks on. Kept per
    // variable so a put landing just before the monitor call is not lost.
    pending: u64,
}

struct Store {
    vars: HashMap<String, Var>,
}

/// The private storage area of one logical thread: named storages holding
/// named shared variables as encoded blobs.
///
/// Remote gets, puts and broadcast deliveries land here from worker
/// threads; the owning thread reads locally. One lock serializes all of it,
/// which also gives accumulate its per-variable ordering.
pub struct ThreadStorage {
    stores: Mutex<HashMap<String, Store>>,
    changed: Condvar,
}

impl ThreadStorage {
    pub fn new() -> ThreadStorage {
        ThreadStorage {
            stores: Mutex::new(HashMap::new()),
            changed: Condvar::new(),
        }
    }

    /// Registers a storage and its variable names. Idempotent; values
    /// already present are kept.
    pub fn register(&self, storage: &str, names: &[&str]) {
        let mut stores = self.stores.lock().unwrap();

        let store = stores.entry(storage.to_string()).or_insert_with(|| Store {
            vars: HashMap::new(),
        });

        for &name in names {
            store
                .vars
                .entry(name.to_string())
                .or_insert(Var { value: None, pending: 0 });
        }
    }

    /// Stores a value. Last writer wins; monitors of the variable wake up.
    pub fn put(&self, storage: &str, name: &str, bytes: Vec<u8>) -> Result<()> {
        let mut stores = self.stores.lock().unwrap();
        let var = lookup(&mut stores, storage, name)?;

        var.value = Some(bytes);
        var.pending += 1;
        self.changed.notify_all();
        Ok(())
    }

    pub fn get(&self, storage: &str, name: &str) -> Result<Vec<u8>> {
        let mut stores = self.stores.lock().unwrap();
        let var = lookup(&mut stores, storage, name)?;

        var.value.clone().ok_or_else(|| {
            Error::with_detail(ErrorKind::NoSuchVariable, format!("{}.{} never written", storage, name))
        })
    }

    /// Combines a value into the variable. The first accumulate on an unset
    /// variable stores the incoming value. Runs under the storage lock, so
    /// concurrent accumulates on one variable are serialized.
    pub fn accumulate(&self, storage: &str, name: &str, op: CombineFn, bytes: Vec<u8>) -> Result<()> {
        let mut stores = self.stores.lock().unwrap();
        let var = lookup(&mut stores, storage, name)?;

        var.value = Some(match var.value.take() {
            Some(current) => op(&current, &bytes)?,
            None => bytes,
        });
        var.pending += 1;
        self.changed.notify_all();
        Ok(())
    }

    /// Consumes one put notification, blocking until one is available.
    /// A put that happened before the call satisfies it immediately.
    pub fn monitor(&self, storage: &str, name: &str) -> Result<()> {
        let mut stores = self.stores.lock().unwrap();

        loop {
            let var = lookup(&mut stores, storage, name)?;

            if var.pending > 0 {
                var.pending -= 1;
                return Ok(());
            }

            stores = self.changed.wait(stores).unwrap();
        }
    }
}

fn lookup<'a>(
    stores: &'a mut HashMap<String, Store>,
    storage: &str,
    name: &str,
) -> Result<&'a mut Var> {
    let store = stores
        .get_mut(storage)
        .ok_or_else(|| Error::with_detail(ErrorKind::NoSuchStorage, storage))?;

    store
        .vars
        .get_mut(name)
        .ok_or_else(|| Error::with_detail(ErrorKind::NoSuchVariable, format!("{}.{}", storage, name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{from_bytes, to_bytes};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn sum_i64(a: &[u8], b: &[u8]) -> Result<Vec<u8>> {
        let (a, b) = (from_bytes::<i64>(a)?, from_bytes::<i64>(b)?);
        Ok(to_bytes(&(a + b)))
    }

    #[test]
    fn put_then_get_returns_the_value() {
        let storage = ThreadStorage::new();
        storage.register("shared", &["x", "y"]);

        storage.put("shared", "x", to_bytes(&42i64)).unwrap();

        let bytes = storage.get("shared", "x").unwrap();
        assert_eq!(from_bytes::<i64>(&bytes).unwrap(), 42);
    }

    #[test]
    fn missing_storage_and_variable() {
        let storage = ThreadStorage::new();
        storage.register("shared", &["x"]);

        assert_eq!(
            storage.get("nope", "x").unwrap_err().kind(),
            ErrorKind::NoSuchStorage
        );
        assert_eq!(
            storage.get("shared", "y").unwrap_err().kind(),
            ErrorKind::NoSuchVariable
        );
        // Registered but never written reads as absent too.
        assert_eq!(
            storage.get("shared", "x").unwrap_err().kind(),
            ErrorKind::NoSuchVariable
        );
    }

    #[test]
    fn wrong_type_read_is_a_mismatch() {
        let storage = ThreadStorage::new();
        storage.register("shared", &["x"]);
        storage.put("shared", "x", to_bytes(&1i64)).unwrap();

        let bytes = storage.get("shared", "x").unwrap();
        assert_eq!(
            from_bytes::<String>(&bytes).unwrap_err().kind(),
            ErrorKind::TypeMismatch
        );
    }

    #[test]
    fn accumulate_folds_with_the_combiner() {
        let storage = ThreadStorage::new();
        storage.register("shared", &["acc"]);

        storage.accumulate("shared", "acc", sum_i64, to_bytes(&5i64)).unwrap();
        storage.accumulate("shared", "acc", sum_i64, to_bytes(&7i64)).unwrap();

        let bytes = storage.get("shared", "acc").unwrap();
        assert_eq!(from_bytes::<i64>(&bytes).unwrap(), 12);
    }

    #[test]
    fn concurrent_accumulates_are_serialized() {
        let storage = Arc::new(ThreadStorage::new());
        storage.register("shared", &["acc"]);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let storage = storage.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        storage
                            .accumulate("shared", "acc", sum_i64, to_bytes(&1i64))
                            .unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let bytes = storage.get("shared", "acc").unwrap();
        assert_eq!(from_bytes::<i64>(&bytes).unwrap(), 200);
    }

    #[test]
    fn monitor_wakes_on_next_put() {
        let storage = Arc::new(ThreadStorage::new());
        storage.register("shared", &["flag"]);

        let waiter = storage.clone();
        let handle = thread::spawn(move || waiter.monitor("shared", "flag"));

        thread::sleep(Duration::from_millis(20));
        storage.put("shared", "flag", to_bytes(&true)).unwrap();

        handle.join().unwrap().unwrap();
    }

    #[test]
    fn monitor_consumes_an_earlier_put() {
        let storage = ThreadStorage::new();
        storage.register("shared", &["flag"]);

        storage.put("shared", "flag", to_bytes(&true)).unwrap();

        // The notification is already pending, so this does not block.
        storage.monitor("shared", "flag").unwrap();
    }
}
