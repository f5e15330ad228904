//! The process-wide readiness loop.
//!
//! One background thread services every registered task and its bound
//! coprocess: it computes poll interest, blocks in `poll(2)` alongside
//! a wake pipe, performs the bounded reads and writes, and walks the
//! spin-counted deregistration state machine. All other threads only
//! enqueue work and wake the loop.

pub mod wake;

use std::collections::HashMap;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::{Arc, Mutex, OnceLock};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, error, trace, warn};

use crate::pty::task::{PtyTask, TaskId};
use wake::{install_sigchld_wake, WakePipe};

/// Per-read ceiling. Pty masters rarely hand back more than this in a
/// single read, so larger buffers only waste copies.
pub(crate) const IO_CHUNK_SIZE: usize = 4096;
/// Reads per task per iteration; keeps one chatty task from starving
/// the rest of the set.
const MAX_READS_PER_ITERATION: usize = 10;
/// Loop iterations a deregistering task waits before its owner hears
/// "deregistered". Two guarantees no in-flight iteration still holds
/// the stale descriptor.
const DEREGISTER_SPINS: u8 = 2;

struct DeregEntry {
    task: Arc<PtyTask>,
    spins_left: u8,
}

struct MuxState {
    tasks: HashMap<TaskId, Arc<PtyTask>>,
    deregistering: Vec<DeregEntry>,
    thread_started: bool,
}

struct MuxShared {
    // Coarse lock over the registration set. Held while scanning and
    // while flushing coprocess buffers, never while blocked in poll.
    state: Mutex<MuxState>,
    wake: WakePipe,
}

/// Handle to a multiplexer instance. Clones share the same loop.
///
/// Production code uses [`IoMultiplexer::global`]; tests construct
/// their own instances so loops cannot interfere across tests.
#[derive(Clone)]
pub struct IoMultiplexer {
    shared: Arc<MuxShared>,
}

static GLOBAL: OnceLock<IoMultiplexer> = OnceLock::new();

impl IoMultiplexer {
    pub fn new() -> Self {
        let wake = WakePipe::new().expect("wake pipe allocation cannot fail at startup");
        Self {
            shared: Arc::new(MuxShared {
                state: Mutex::new(MuxState {
                    tasks: HashMap::new(),
                    deregistering: Vec::new(),
                    thread_started: false,
                }),
                wake,
            }),
        }
    }

    /// The process-wide instance. Created lazily; the first use also
    /// routes SIGCHLD through its wake pipe.
    pub fn global() -> &'static IoMultiplexer {
        GLOBAL.get_or_init(|| {
            let mux = IoMultiplexer::new();
            install_sigchld_wake(&mux.shared.wake);
            mux
        })
    }

    pub fn register_task(&self, task: Arc<PtyTask>) {
        let mut state = self.shared.state.lock().unwrap();
        debug!("registering task {} (fd {})", task.id(), task.fd());
        state.tasks.insert(task.id(), task);
        self.ensure_thread(&mut state);
        drop(state);
        self.wake();
    }

    /// Remove the task from the active set and arm the two-spin
    /// confirmation. The owner's `task_deregistered` callback fires
    /// only after the counter drains.
    pub fn deregister_task(&self, task: &Arc<PtyTask>) {
        let mut state = self.shared.state.lock().unwrap();
        // May already be gone (broken-pipe removal); the owner still
        // gets its confirmation through the same delayed path.
        state.tasks.remove(&task.id());
        if !state
            .deregistering
            .iter()
            .any(|entry| entry.task.id() == task.id())
        {
            state.deregistering.push(DeregEntry {
                task: Arc::clone(task),
                spins_left: DEREGISTER_SPINS,
            });
        }
        self.ensure_thread(&mut state);
        drop(state);
        self.wake();
    }

    pub fn is_registered(&self, id: TaskId) -> bool {
        self.shared.state.lock().unwrap().tasks.contains_key(&id)
    }

    /// Interrupt the readiness wait so interest is recomputed.
    pub fn wake(&self) {
        self.shared.wake.wake();
    }

    fn ensure_thread(&self, state: &mut MuxState) {
        if state.thread_started {
            return;
        }
        state.thread_started = true;
        let shared = Arc::clone(&self.shared);
        std::thread::Builder::new()
            .name("ptymux-io".to_string())
            .spawn(move || run_loop(shared))
            .expect("failed to spawn multiplexer thread");
    }
}

impl Default for IoMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum EntryKind {
    /// The task's own pty master.
    TaskPty,
    /// Read end of the coprocess's stdout.
    CoprocessOut,
    /// Write end toward the coprocess's stdin.
    CoprocessIn,
}

struct ScanEntry {
    task: Arc<PtyTask>,
    kind: EntryKind,
    fd: RawFd,
    events: PollFlags,
}

fn run_loop(shared: Arc<MuxShared>) {
    debug!("multiplexer loop started");
    loop {
        iterate(&shared);
    }
}

/// One full iteration of the readiness loop: scan, wait, service I/O,
/// then spin bookkeeping. Factored out so tests can drive iterations
/// deterministically.
fn iterate(shared: &Arc<MuxShared>) {
    let entries = build_scan(shared);

    // Wake pipe first so slot 0 is always the wake channel.
    let mut poll_fds = Vec::with_capacity(entries.len() + 1);
    poll_fds.push(PollFd::new(shared.wake.poll_fd(), PollFlags::POLLIN));
    for entry in &entries {
        let fd = unsafe { BorrowedFd::borrow_raw(entry.fd) };
        poll_fds.push(PollFd::new(fd, entry.events));
    }

    match poll(&mut poll_fds, PollTimeout::NONE) {
        Ok(_) => {}
        Err(Errno::EINTR) => return,
        Err(e) => {
            error!("poll failed: {}", e);
            std::thread::sleep(std::time::Duration::from_millis(50));
            return;
        }
    }

    if revents(&poll_fds[0]).contains(PollFlags::POLLIN) {
        shared.wake.drain();
    }

    let mut broken: Vec<Arc<PtyTask>> = Vec::new();
    let mut dead_coprocs: Vec<Arc<PtyTask>> = Vec::new();

    for (entry, poll_fd) in entries.iter().zip(poll_fds.iter().skip(1)) {
        let ready = revents(poll_fd);
        if ready.is_empty() {
            continue;
        }
        match entry.kind {
            EntryKind::TaskPty => {
                if ready.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                    if service_task_read(shared, &entry.task).is_err() {
                        broken.push(Arc::clone(&entry.task));
                        continue;
                    }
                }
                if ready.contains(PollFlags::POLLOUT) && service_task_write(&entry.task).is_err() {
                    broken.push(Arc::clone(&entry.task));
                }
            }
            EntryKind::CoprocessOut => {
                if ready.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                    && service_coprocess_read(&entry.task).is_err()
                {
                    dead_coprocs.push(Arc::clone(&entry.task));
                }
            }
            EntryKind::CoprocessIn => {
                if ready.intersects(PollFlags::POLLOUT | PollFlags::POLLERR)
                    && service_coprocess_write(shared, &entry.task).is_err()
                {
                    dead_coprocs.push(Arc::clone(&entry.task));
                }
            }
        }
    }

    for task in broken {
        remove_broken_task(shared, &task);
    }
    for task in dead_coprocs {
        task.drop_coprocess_binding();
    }

    service_deregistrations(shared);
}

fn revents(poll_fd: &PollFd<'_>) -> PollFlags {
    poll_fd.revents().unwrap_or(PollFlags::empty())
}

/// Snapshot interest for every registered task under the coarse lock.
fn build_scan(shared: &MuxShared) -> Vec<ScanEntry> {
    let state = shared.state.lock().unwrap();
    let mut entries = Vec::new();

    for task in state.tasks.values() {
        if task.is_broken() {
            continue;
        }
        let paused = task.is_paused();
        let fd = task.fd();

        if fd >= 0 && !paused {
            let mut events = PollFlags::POLLIN;
            if task.has_pending_writes() {
                events |= PollFlags::POLLOUT;
            }
            entries.push(ScanEntry {
                task: Arc::clone(task),
                kind: EntryKind::TaskPty,
                fd,
                events,
            });
        }

        // Coprocess descriptors ride along regardless of pause state.
        if let Some((in_fd, out_fd, pending)) = task.coprocess_poll_info() {
            entries.push(ScanEntry {
                task: Arc::clone(task),
                kind: EntryKind::CoprocessOut,
                fd: out_fd,
                events: PollFlags::POLLIN,
            });
            if pending {
                entries.push(ScanEntry {
                    task: Arc::clone(task),
                    kind: EntryKind::CoprocessIn,
                    fd: in_fd,
                    events: PollFlags::POLLOUT,
                });
            }
        }
    }

    entries
}

/// Bounded multi-chunk read from the task's pty, forwarded to the
/// output sink and mirrored into a bound, non-muted coprocess.
/// `Err(())` means the descriptor is dead.
fn service_task_read(shared: &MuxShared, task: &Arc<PtyTask>) -> Result<(), ()> {
    let mut buf = [0u8; IO_CHUNK_SIZE];
    for _ in 0..MAX_READS_PER_ITERATION {
        let fd = task.fd();
        if fd < 0 {
            return Ok(());
        }
        match read_fd(fd, &mut buf) {
            Ok(0) => {
                trace!("task {}: EOF on pty", task.id());
                return Err(());
            }
            Ok(n) => {
                // The coprocess mirror stays under the coarse lock so a
                // concurrent bind/unbind cannot race it. The sink call
                // happens outside: external code must not run under the
                // registration lock.
                {
                    let _guard = shared.state.lock().unwrap();
                    task.mirror_to_coprocess(&buf[..n]);
                }
                task.deliver_output(&buf[..n]);
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => return Ok(()),
            Err(e) => {
                warn!("task {}: read failed: {}", task.id(), e);
                return Err(());
            }
        }
    }
    Ok(())
}

/// One bounded chunk from the front of the WriteQueue.
fn service_task_write(task: &Arc<PtyTask>) -> Result<(), ()> {
    let fd = task.fd();
    if fd < 0 {
        return Ok(());
    }
    task.drain_write_queue(fd)
}

fn service_coprocess_read(task: &Arc<PtyTask>) -> Result<(), ()> {
    let mut buf = [0u8; IO_CHUNK_SIZE];
    let Some(fd) = task.coprocess_poll_info().map(|(_, out_fd, _)| out_fd) else {
        return Ok(());
    };
    match read_fd(fd, &mut buf) {
        Ok(0) => Err(()),
        Ok(n) => {
            task.accept_coprocess_output(&buf[..n]);
            Ok(())
        }
        Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(()),
        Err(e) => {
            warn!("task {}: coprocess read failed: {}", task.id(), e);
            Err(())
        }
    }
}

fn service_coprocess_write(shared: &MuxShared, task: &Arc<PtyTask>) -> Result<(), ()> {
    let _guard = shared.state.lock().unwrap();
    task.flush_coprocess_input(IO_CHUNK_SIZE)
}

fn remove_broken_task(shared: &Arc<MuxShared>, task: &Arc<PtyTask>) {
    {
        let mut state = shared.state.lock().unwrap();
        state.tasks.remove(&task.id());
    }
    // Delegate notification happens outside the coarse lock and at
    // most once per task lifetime.
    task.enter_broken_state();
}

fn service_deregistrations(shared: &Arc<MuxShared>) {
    let mut confirmed = Vec::new();
    let keep_spinning;
    {
        let mut state = shared.state.lock().unwrap();
        for entry in &mut state.deregistering {
            entry.spins_left = entry.spins_left.saturating_sub(1);
        }
        state.deregistering.retain(|entry| {
            if entry.spins_left == 0 {
                confirmed.push(Arc::clone(&entry.task));
                false
            } else {
                true
            }
        });
        keep_spinning = !state.deregistering.is_empty();
    }
    for task in confirmed {
        trace!("task {}: deregistration confirmed", task.id());
        task.confirm_deregistered();
    }
    // Pending counters must make progress even with no I/O traffic.
    if keep_spinning {
        shared.wake.wake();
    }
}

pub(crate) fn read_fd(fd: RawFd, buf: &mut [u8]) -> Result<usize, Errno> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len()) };
    if n < 0 {
        Err(Errno::last())
    } else {
        Ok(n as usize)
    }
}

pub(crate) fn write_fd(fd: RawFd, buf: &[u8]) -> Result<usize, Errno> {
    let n = unsafe { libc::write(fd, buf.as_ptr().cast::<libc::c_void>(), buf.len()) };
    if n < 0 {
        Err(Errno::last())
    } else {
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PtyError;
    use crate::pty::task::TaskDelegate;
    use std::os::fd::{AsRawFd, IntoRawFd};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        output: Mutex<Vec<u8>>,
        broken: AtomicUsize,
        deregistered: AtomicUsize,
    }

    impl Counting {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                output: Mutex::new(Vec::new()),
                broken: AtomicUsize::new(0),
                deregistered: AtomicUsize::new(0),
            })
        }
    }

    impl TaskDelegate for Counting {
        fn handle_output(&self, _task: &PtyTask, data: &[u8]) {
            self.output.lock().unwrap().extend_from_slice(data);
        }

        fn broken_pipe(&self, _task: &PtyTask) {
            self.broken.fetch_add(1, Ordering::SeqCst);
        }

        fn task_deregistered(&self, _task: &PtyTask) {
            self.deregistered.fetch_add(1, Ordering::SeqCst);
        }

        fn launch_failed(&self, _task: &PtyTask, _error: &PtyError) {}
    }

    /// A multiplexer whose loop thread never starts, so tests drive
    /// `iterate` by hand.
    fn manual_mux() -> IoMultiplexer {
        let mux = IoMultiplexer::new();
        mux.shared.state.lock().unwrap().thread_started = true;
        mux
    }

    #[test]
    fn test_deregistration_confirms_on_the_second_iteration() {
        let mux = manual_mux();
        let delegate = Counting::new();
        let task = PtyTask::new(delegate.clone());

        mux.register_task(Arc::clone(&task));
        mux.deregister_task(&task);
        assert!(!mux.is_registered(task.id()));

        iterate(&mux.shared);
        assert_eq!(delegate.deregistered.load(Ordering::SeqCst), 0);

        iterate(&mux.shared);
        assert_eq!(delegate.deregistered.load(Ordering::SeqCst), 1);
        assert_eq!(delegate.broken.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_deregister_twice_confirms_once() {
        let mux = manual_mux();
        let delegate = Counting::new();
        let task = PtyTask::new(delegate.clone());

        mux.register_task(Arc::clone(&task));
        mux.deregister_task(&task);
        mux.deregister_task(&task);

        iterate(&mux.shared);
        iterate(&mux.shared);
        assert_eq!(delegate.deregistered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_paused_task_gets_no_poll_entry() {
        let mux = manual_mux();
        let delegate = Counting::new();
        let task = PtyTask::new(delegate);

        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        task.force_fd(read_end.into_raw_fd());
        mux.register_task(Arc::clone(&task));

        assert_eq!(build_scan(&mux.shared).len(), 1);

        task.set_paused(true);
        task.write(b"held");
        assert!(build_scan(&mux.shared).is_empty());

        task.set_paused(false);
        let entries = build_scan(&mux.shared);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].events.contains(PollFlags::POLLOUT));
    }

    #[test]
    fn test_queued_writes_drain_in_order_through_the_loop() {
        let mux = manual_mux();
        let delegate = Counting::new();
        let task = PtyTask::new(delegate);

        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        task.force_fd(write_end.into_raw_fd());
        mux.register_task(Arc::clone(&task));

        task.write(b"alpha ");
        task.write(b"beta");
        while task.has_pending_writes() {
            iterate(&mux.shared);
        }

        let mut buf = [0u8; 32];
        let n = read_fd(read_end.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"alpha beta");
    }

    #[test]
    fn test_dead_coprocess_pipe_does_not_stall_the_loop() {
        use std::time::{Duration, Instant};

        let mux = manual_mux();
        let delegate = Counting::new();
        let task = PtyTask::new(delegate.clone());
        mux.register_task(Arc::clone(&task));

        // Closes its stdout immediately but ignores SIGTERM and lives
        // on; the loop must shed the binding without waiting it out.
        task.bind_coprocess("trap '' TERM; exec 1>&-; sleep 30", false)
            .unwrap();

        let started = Instant::now();
        while task.has_coprocess() {
            assert!(
                started.elapsed() < Duration::from_secs(5),
                "coprocess binding was never dropped"
            );
            iterate(&mux.shared);
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_eof_marks_the_task_broken_and_removes_it() {
        let mux = manual_mux();
        let delegate = Counting::new();
        let task = PtyTask::new(delegate.clone());

        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        task.force_fd(read_end.into_raw_fd());
        mux.register_task(Arc::clone(&task));

        // Deliver some bytes, then hang up.
        write_fd(write_end.as_raw_fd(), b"last words").unwrap();
        drop(write_end);

        iterate(&mux.shared);
        assert_eq!(delegate.output.lock().unwrap().as_slice(), b"last words");
        assert!(task.is_broken());
        assert!(!mux.is_registered(task.id()));
        assert_eq!(delegate.broken.load(Ordering::SeqCst), 1);

        // The loop never polls a broken task again.
        assert!(build_scan(&mux.shared).is_empty());
    }
}
