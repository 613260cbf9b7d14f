use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, ErrorKind, Result};

/// Acquires a mutex, mapping a poisoned lock to the `Lock` kind.
pub fn mlock<'a, T>(m: &'a Mutex<T>, object: &str) -> Result<MutexGuard<'a, T>> {
    m.lock()
        .map_err(|_| Error::new(ErrorKind::Lock, object, "mutex poisoned"))
}

/// Acquires a read lock, mapping a poisoned lock to the `Lock` kind.
pub fn rlock<'a, T>(l: &'a RwLock<T>, object: &str) -> Result<RwLockReadGuard<'a, T>> {
    l.read()
        .map_err(|_| Error::new(ErrorKind::Lock, object, "rwlock poisoned"))
}

/// Acquires a write lock, mapping a poisoned lock to the `Lock` kind.
pub fn wlock<'a, T>(l: &'a RwLock<T>, object: &str) -> Result<RwLockWriteGuard<'a, T>> {
    l.write()
        .map_err(|_| Error::new(ErrorKind::Lock, object, "rwlock poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locks_acquire() {
        let m = Mutex::new(1);
        assert_eq!(*mlock(&m, "t").unwrap(), 1);
        let l = RwLock::new(2);
        assert_eq!(*rlock(&l, "t").unwrap(), 2);
        *wlock(&l, "t").unwrap() = 3;
        assert_eq!(*rlock(&l, "t").unwrap(), 3);
    }
}
