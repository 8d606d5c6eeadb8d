#![forbid(unsafe_code)]

use crate::error::BoxError;
use crate::sources::{LibraryEventSink, LibraryOpen, SharedLibrarySource};
use nix::sys::fanotify::{EventFFlags, Fanotify, InitFlags, MarkFlags, MaskFlags};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, trace, warn};

const SKIP_PREFIXES: &[&str] = &["/proc/", "/sys/", "/dev/", "/run/", "/var/run/"];

/// Shared library source built on fanotify open notifications for the root
/// filesystem. Needs `CAP_SYS_ADMIN`.
#[derive(Default)]
pub struct FanotifyLibraryWatcher {
    fan: Option<Fanotify>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FanotifyLibraryWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn reader_loop(fan: Fanotify, sink: LibraryEventSink, stop: Arc<AtomicBool>) {
        let self_pid = std::process::id() as i32;

        while !stop.load(Ordering::Relaxed) {
            let events = match fan.read_events() {
                Ok(events) => events,
                Err(nix::errno::Errno::EAGAIN) => {
                    std::thread::sleep(Duration::from_millis(100));
                    continue;
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => {
                    warn!(?err, "fanotify read_events failed");
                    break;
                }
            };

            for event in &events {
                let Some(fd) = event.fd() else {
                    // queue overflow
                    if !sink.report_lost(1) {
                        return;
                    }
                    continue;
                };

                let pid = event.pid();
                if pid == self_pid || pid <= 0 {
                    continue;
                }

                let raw_fd = fd.as_raw_fd();
                let Ok(path) = std::fs::read_link(format!("/proc/self/fd/{raw_fd}")) else {
                    continue;
                };
                let Some(path_str) = path.to_str() else {
                    continue;
                };
                if SKIP_PREFIXES.iter().any(|prefix| path_str.starts_with(prefix)) {
                    continue;
                }
                if !is_shared_object(&path) {
                    continue;
                }

                let open = LibraryOpen {
                    path,
                    pid: pid as u32,
                };
                if !sink.deliver(open) {
                    trace!("library sink closed");
                    return;
                }
            }
        }

        trace!("fanotify reader loop exited");
    }
}

/// Whether the file name looks like a shared object: `libfoo.so` or
/// `libfoo.so.1.2`.
pub fn is_shared_object(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    if name.ends_with(".so") {
        return true;
    }
    name.rsplit_once(".so.").is_some_and(|(_, version)| {
        !version.is_empty() && version.chars().all(|c| c.is_ascii_digit() || c == '.')
    })
}

impl SharedLibrarySource for FanotifyLibraryWatcher {
    fn init(&mut self) -> Result<(), BoxError> {
        if self.fan.is_some() {
            return Ok(());
        }
        let fan = Fanotify::init(
            InitFlags::FAN_CLOEXEC | InitFlags::FAN_CLASS_NOTIF | InitFlags::FAN_NONBLOCK,
            EventFFlags::O_RDONLY | EventFFlags::O_CLOEXEC | EventFFlags::O_LARGEFILE,
        )?;
        let root = std::fs::File::open("/")?;
        fan.mark(
            MarkFlags::FAN_MARK_ADD | MarkFlags::FAN_MARK_FILESYSTEM,
            MaskFlags::FAN_OPEN,
            &root,
            None::<&Path>,
        )?;
        self.fan = Some(fan);
        Ok(())
    }

    fn start(&mut self, sink: LibraryEventSink) -> Result<(), BoxError> {
        let fan = self.fan.take().ok_or("fanotify watcher is not initialized")?;
        self.stop.store(false, Ordering::Relaxed);
        let stop = Arc::clone(&self.stop);
        let handle = std::thread::Builder::new()
            .name("fanotify-reader".into())
            .spawn(move || Self::reader_loop(fan, sink, stop))?;
        self.handle = Some(handle);
        info!("fanotify library watcher started");
        Ok(())
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for FanotifyLibraryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanotifyLibraryWatcher")
            .field("initialized", &self.fan.is_some())
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl Drop for FanotifyLibraryWatcher {
    fn drop(&mut self) {
        SharedLibrarySource::stop(self);
    }
}
