use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::debug;

use crate::{database::StoreInner, types::SnapResult};

/// Daemon that closes read transactions whose wall-clock lifetime ran
/// out, so abandoned readers cannot hold page reclamation back forever.
pub(crate) struct Reaper {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    pub fn spawn(store: Arc<StoreInner>) -> SnapResult<Reaper> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("snapdb-reaper".to_string())
            .spawn(move || {
                let period = store.config.reaper_period;
                let timeout = store.config.read_timeout;
                loop {
                    thread::park_timeout(period);
                    if flag.load(Ordering::SeqCst) {
                        break;
                    }
                    let closed = store.readers.sweep_expired(timeout);
                    if closed > 0 {
                        debug!("reaper closed {} expired read transaction(s)", closed);
                    }
                }
            })?;

        Ok(Reaper {
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}
