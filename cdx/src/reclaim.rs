//! Periodic space reclamation.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::store::{Store, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub struct ReclaimOptions {
    /// Time between passes.
    pub interval: Duration,
    /// Discard ratio of the periodic passes.
    pub discard_ratio: f64,
    /// Discard ratio of the pass run on shutdown.
    pub shutdown_discard_ratio: f64,
}

impl Default for ReclaimOptions {
    fn default() -> Self {
        ReclaimOptions {
            interval: Duration::from_secs(5 * 60),
            discard_ratio: 0.5,
            shutdown_discard_ratio: 0.3,
        }
    }
}

/// Runs [`Store::reclaim`] on a timer, and once more when stopped.
pub struct Reclaimer {
    store: Arc<dyn Store>,
    shutdown_discard_ratio: f64,
    timer: Option<(JoinHandle<()>, Sender<()>)>,
}

fn pass(store: &dyn Store, discard_ratio: f64) -> bool {
    match store.reclaim(discard_ratio) {
        Ok(reclaimed) => {
            debug!(
                "{} reclaim pass at ratio {}: reclaimed={}",
                store.backend(),
                discard_ratio,
                reclaimed
            );
            reclaimed
        }
        Err(e) => {
            warn!("{} reclaim pass failed: {}", store.backend(), e);
            false
        }
    }
}

impl Reclaimer {
    pub fn start(store: Arc<dyn Store>, options: &ReclaimOptions) -> Result<Reclaimer, StoreError> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let timer_store = Arc::clone(&store);
        let interval = options.interval;
        let discard_ratio = options.discard_ratio;
        let handle = thread::Builder::new()
            .name("cdx-reclaim".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        pass(&*timer_store, discard_ratio);
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        Ok(Reclaimer {
            store,
            shutdown_discard_ratio: options.shutdown_discard_ratio,
            timer: Some((handle, stop_tx)),
        })
    }

    /// Stop the timer and run the shutdown pass.
    ///
    /// Returns whether the shutdown pass reclaimed anything; `false` if the
    /// reclaimer was already stopped.
    pub fn stop(&mut self) -> bool {
        match self.timer.take() {
            Some((handle, stop)) => {
                let _ = stop.send(());
                if handle.join().is_err() {
                    error!("Reclaim thread panicked");
                }
                pass(&*self.store, self.shutdown_discard_ratio)
            }
            None => false,
        }
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        Backend, Cursor, KeyRange, Namespace, Order, Put, Snapshot, StoreError,
    };
    use std::sync::Mutex;

    /// Records the ratio of every reclaim pass and fails every other one.
    #[derive(Default)]
    struct Recording {
        passes: Mutex<Vec<f64>>,
    }

    struct Empty;

    impl Snapshot for Empty {
        fn get(&self, _: Namespace, _: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(None)
        }

        fn scan(&self, _: Namespace, _: KeyRange, _: Order) -> Result<Cursor<'_>, StoreError> {
            Ok(Cursor::empty())
        }
    }

    impl Store for Recording {
        fn backend(&self) -> Backend {
            Backend::Lmdb
        }
        fn max_key_size(&self) -> usize {
            0
        }
        fn apply(&self, _: &[Put]) -> Result<(), StoreError> {
            Ok(())
        }
        fn get(&self, _: Namespace, _: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(None)
        }
        fn snapshot(&self) -> Result<Box<dyn Snapshot + '_>, StoreError> {
            Ok(Box::new(Empty))
        }
        fn delete_all(&self, _: Namespace) -> Result<(), StoreError> {
            Ok(())
        }
        fn reclaim(&self, discard_ratio: f64) -> Result<bool, StoreError> {
            let mut passes = self.passes.lock().unwrap();
            passes.push(discard_ratio);
            if passes.len() % 2 == 0 {
                Err(StoreError::Poisoned)
            } else {
                Ok(true)
            }
        }
        fn close(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[test]
    fn periodic_passes_survive_failures() {
        let store = Arc::new(Recording::default());
        let options = ReclaimOptions {
            interval: Duration::from_millis(5),
            ..Default::default()
        };
        let mut reclaimer = Reclaimer::start(store.clone(), &options).unwrap();
        for _ in 0..200 {
            if store.passes.lock().unwrap().len() >= 3 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        reclaimer.stop();

        let passes = store.passes.lock().unwrap();
        assert!(passes.len() >= 4, "only {} passes ran", passes.len());
        assert!(passes[..passes.len() - 1].iter().all(|&r| r == 0.5));
        assert_eq!(passes.last(), Some(&0.3));
    }

    #[test]
    fn shutdown_pass_runs_once() {
        let store = Arc::new(Recording::default());
        let mut reclaimer = Reclaimer::start(store.clone(), &Default::default()).unwrap();
        assert!(reclaimer.stop());
        assert!(!reclaimer.stop());
        drop(reclaimer);
        assert_eq!(*store.passes.lock().unwrap(), vec![0.3]);
    }
}
