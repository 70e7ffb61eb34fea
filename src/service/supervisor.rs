//! Idle Supervisor
//!
//! Background thread that periodically asks the recognition manager to release an
//! idle recognizer.

use crossbeam_channel::{bounded, select, tick, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

use crate::recognition::RecognitionManager;

/// Default period between idle checks
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Handle to the running supervisor thread. Dropping it stops and joins the thread.
pub struct IdleSupervisor {
    shutdown_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl IdleSupervisor {
    /// Start checking `manager` every `interval` until `stop` is set or the handle is dropped
    pub fn spawn(
        manager: Arc<RecognitionManager>,
        stop: Arc<AtomicBool>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let handle = std::thread::Builder::new()
            .name("idle-supervisor".into())
            .spawn(move || {
                info!("Idle supervisor started ({}s interval)", interval.as_secs_f64());
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            if stop.load(Ordering::SeqCst) {
                                break;
                            }
                            debug!("idle check");
                            manager.check_idle();
                        }
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                info!("Idle supervisor exiting");
            })?;

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Whether the supervisor thread is still running
    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stop the thread and wait for it
    pub fn shutdown(&mut self) {
        // Dropping the sender disconnects the channel and wakes the select
        self.shutdown_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for IdleSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognition::tests::counting_factory;
    use std::time::Instant;

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_unloads_idle_recognizer() {
        let (factory, _) = counting_factory(vec![]);
        let manager = Arc::new(RecognitionManager::with_idle_timeout(factory, Duration::ZERO));
        manager.ensure_ready().unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let supervisor =
            IdleSupervisor::spawn(manager.clone(), stop, Duration::from_millis(10)).unwrap();

        assert!(wait_until(Duration::from_secs(5), || !manager.is_loaded()));
        drop(supervisor);
    }

    #[test]
    fn test_keeps_recently_used_recognizer() {
        let (factory, _) = counting_factory(vec![]);
        let manager = Arc::new(RecognitionManager::new(factory));
        manager.ensure_ready().unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let mut supervisor =
            IdleSupervisor::spawn(manager.clone(), stop, Duration::from_millis(10)).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        supervisor.shutdown();

        assert!(manager.is_loaded());
        assert!(!supervisor.is_running());
    }

    #[test]
    fn test_exits_when_stop_flag_set() {
        let (factory, _) = counting_factory(vec![]);
        let manager = Arc::new(RecognitionManager::new(factory));
        let stop = Arc::new(AtomicBool::new(false));
        let supervisor =
            IdleSupervisor::spawn(manager, stop.clone(), Duration::from_millis(10)).unwrap();

        stop.store(true, Ordering::SeqCst);
        assert!(wait_until(Duration::from_secs(5), || !supervisor.is_running()));
    }
}
