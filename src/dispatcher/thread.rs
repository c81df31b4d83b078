//! Dispatcher thread
//!
//! Owns the OS thread that drives [`InputDispatcher::dispatch_once`] until
//! stopped.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

use super::InputDispatcher;

/// Runs a dispatcher on a dedicated thread.
#[derive(Debug)]
pub struct InputDispatcherThread {
    dispatcher: Arc<InputDispatcher>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl InputDispatcherThread {
    /// Spawn the thread. It loops until [`InputDispatcherThread::stop`] is
    /// called or the value is dropped.
    pub fn start(dispatcher: Arc<InputDispatcher>) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = thread::Builder::new().name("InputDispatcher".into()).spawn({
            let dispatcher = dispatcher.clone();
            let stop = stop.clone();
            move || {
                debug!("Dispatcher thread running");
                while !stop.load(Ordering::Acquire) {
                    dispatcher.dispatch_once();
                }
                debug!("Dispatcher thread exiting");
            }
        })?;
        info!("Input dispatcher thread started");

        Ok(Self {
            dispatcher,
            stop,
            handle: Some(handle),
        })
    }

    /// The dispatcher being driven.
    pub fn dispatcher(&self) -> &Arc<InputDispatcher> {
        &self.dispatcher
    }

    /// Ask the thread to exit, wake it, and join it.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        self.dispatcher.wake();
        if handle.join().is_err() {
            error!("Input dispatcher thread panicked");
        } else {
            info!("Input dispatcher thread stopped");
        }
    }

    /// True until [`InputDispatcherThread::stop`] has joined the thread.
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for InputDispatcherThread {
    fn drop(&mut self) {
        self.stop();
    }
}
