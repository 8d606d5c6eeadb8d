#![forbid(unsafe_code)]

//! Live event sources feeding the attacher: process lifecycle notifications
//! and shared library opens.

mod fanotify_watcher;
mod procfs_monitor;

pub use fanotify_watcher::{FanotifyLibraryWatcher, is_shared_object};
pub use procfs_monitor::ProcfsMonitor;

use crate::error::BoxError;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Capacity of the library event channel. Events beyond it are counted as
/// lost; reconciliation catches up with them.
pub const LIBRARY_EVENT_CAPACITY: usize = 1024;

pub type PidCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Handle returned by a subscription. Dropping it keeps the subscription.
pub struct Unsubscribe(Box<dyn FnOnce() + Send>);

impl Unsubscribe {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn unsubscribe(self) {
        (self.0)()
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Unsubscribe")
    }
}

/// Process exec and exit notifications.
///
/// Callbacks run on the source's own thread, never on the attacher's event
/// loop.
pub trait ProcessEventSource: Send + Sync {
    /// Prepare the source. `use_event_stream` asks for push notifications
    /// instead of polling, when the source supports both.
    fn initialize(&self, use_event_stream: bool) -> Result<(), BoxError>;
    fn subscribe_exec(&self, callback: PidCallback) -> Unsubscribe;
    fn subscribe_exit(&self, callback: PidCallback) -> Unsubscribe;
    fn stop(&self);
    /// Subset of `candidates` that no longer exist.
    fn find_deleted_processes(&self, candidates: &FxHashSet<u32>) -> FxHashSet<u32>;
}

/// A shared library opened by a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryOpen {
    pub path: PathBuf,
    pub pid: u32,
}

/// Where a [`SharedLibrarySource`] delivers its events.
#[derive(Debug, Clone)]
pub struct LibraryEventSink {
    data: mpsc::Sender<LibraryOpen>,
    lost: mpsc::UnboundedSender<u64>,
}

impl LibraryEventSink {
    pub fn new(data: mpsc::Sender<LibraryOpen>, lost: mpsc::UnboundedSender<u64>) -> Self {
        Self { data, lost }
    }

    /// Create a sink together with the receiving ends.
    pub fn channel(
        capacity: usize,
    ) -> (
        Self,
        mpsc::Receiver<LibraryOpen>,
        mpsc::UnboundedReceiver<u64>,
    ) {
        let (data_tx, data_rx) = mpsc::channel(capacity);
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        (Self::new(data_tx, lost_tx), data_rx, lost_rx)
    }

    /// Hand over an event without blocking. A full channel counts the event
    /// as lost. Returns `false` once the receiver is gone.
    pub fn deliver(&self, event: LibraryOpen) -> bool {
        match self.data.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => self.report_lost(1),
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Report events dropped before reaching the sink.
    pub fn report_lost(&self, count: u64) -> bool {
        self.lost.send(count).is_ok()
    }
}

/// Shared library open notifications.
pub trait SharedLibrarySource: Send {
    /// Acquire the resources the source needs. Calling it again once it
    /// succeeded is a no-op.
    fn init(&mut self) -> Result<(), BoxError>;
    fn start(&mut self, sink: LibraryEventSink) -> Result<(), BoxError>;
    fn stop(&mut self);
}

/// Callback list shared by event sources.
#[derive(Clone, Default)]
pub struct Subscribers {
    inner: Arc<Mutex<SubscriberList>>,
}

#[derive(Default)]
struct SubscriberList {
    next_id: u64,
    callbacks: Vec<(u64, PidCallback)>,
}

impl Subscribers {
    pub fn subscribe(&self, callback: PidCallback) -> Unsubscribe {
        let id = {
            let mut list = self.inner.lock();
            let id = list.next_id;
            list.next_id += 1;
            list.callbacks.push((id, callback));
            id
        };
        let inner = Arc::clone(&self.inner);
        Unsubscribe::new(move || inner.lock().callbacks.retain(|(other, _)| *other != id))
    }

    /// Invoke every callback. The list lock is not held while callbacks run.
    pub fn notify(&self, pid: u32) {
        let callbacks: Vec<PidCallback> = self
            .inner
            .lock()
            .callbacks
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(pid);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn unsubscribed_callbacks_are_not_notified() {
        let subscribers = Subscribers::default();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        let handle = subscribers.subscribe(Arc::new(move |pid| {
            counter.fetch_add(pid, Ordering::SeqCst);
        }));

        subscribers.notify(5);
        handle.unsubscribe();
        subscribers.notify(7);

        assert_eq!(seen.load(Ordering::SeqCst), 5);
        assert!(subscribers.is_empty());
    }

    #[test]
    fn full_channel_counts_lost_events() {
        let (sink, mut data, mut lost) = LibraryEventSink::channel(1);
        let event = LibraryOpen {
            path: PathBuf::from("/lib/libssl.so.3"),
            pid: 1,
        };

        assert!(sink.deliver(event.clone()));
        assert!(sink.deliver(event.clone()));
        assert_eq!(data.try_recv().unwrap(), event);
        assert_eq!(lost.try_recv().unwrap(), 1);

        drop(data);
        assert!(!sink.deliver(event));
    }
}
