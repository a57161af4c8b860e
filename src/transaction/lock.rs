use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

/// The single-writer mutex. Reentrant: committing a user tree updates the
/// system trees through the same code paths on the same thread, and only
/// the outermost level may rewrite the file header.
pub(crate) struct WriterLock {
    state: Mutex<LockState>,
    cv: Condvar,
}

struct LockState {
    owner: Option<ThreadId>,
    depth: u32,
}

pub(crate) struct WriterGuard<'a> {
    lock: &'a WriterLock,
}

impl WriterLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                owner: None,
                depth: 0,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn lock(&self) -> WriterGuard<'_> {
        let me = thread::current().id();
        let mut st = self.state.lock().unwrap();
        loop {
            match st.owner {
                None => {
                    st.owner = Some(me);
                    st.depth = 1;
                    break;
                }
                Some(owner) if owner == me => {
                    st.depth += 1;
                    break;
                }
                Some(_) => {
                    st = self.cv.wait(st).unwrap();
                }
            }
        }
        WriterGuard { lock: self }
    }
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.lock.state.lock().unwrap();
        st.depth -= 1;
        if st.depth == 0 {
            st.owner = None;
            self.lock.cv.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_reentrant_on_same_thread() {
        let lock = WriterLock::new();
        let _a = lock.lock();
        let _b = lock.lock();
    }

    #[test]
    fn test_excludes_other_threads() {
        let lock = Arc::new(WriterLock::new());
        let guard = lock.lock();

        let contender = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                let _g = lock.lock();
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!contender.is_finished());
        drop(guard);
        contender.join().unwrap();
    }
}
