//! Background task that ages the block cache every `interval` time units.
//! Stopped when dropped.

use super::*;
use block_cache::BlockCache;

use log::{debug, error};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct CacheAger {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CacheAger {
    pub fn spawn(cache: Arc<BlockCache>, interval: u32, time_unit: Duration) -> Result<Self> {
        let period = time_unit * interval;
        if period.is_zero() {
            return Err(FsError::InvalidArgument(
                "cache aging period must be > 0".to_owned(),
            ));
        }

        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("cache-ager".to_owned())
            .spawn(move || loop {
                match stopped.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => match cache.age_tick(interval) {
                        Ok(0) => {}
                        Ok(n) => debug!("cache ager: flushed {n} entries"),
                        Err(e) => error!("cache ager: {e}"),
                    },
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        // closing the channel wakes the thread up
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("cache ager: thread panicked");
            }
        }
    }
}

impl Drop for CacheAger {
    fn drop(&mut self) {
        self.stop();
    }
}
