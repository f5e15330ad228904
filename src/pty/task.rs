//! Pty-backed process tasks.
//!
//! A `PtyTask` owns one child process behind a pty master, either
//! forked directly or held on the task's behalf by a detached server
//! process. All I/O on the master goes through the multiplexer; the
//! task itself only carries state, the write queue and the optional
//! coprocess binding.

use std::os::fd::{IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::error::{PtyError, Result};
use crate::mux::{write_fd, IoMultiplexer, IO_CHUNK_SIZE};
use crate::pty::coprocess::{notify_coprocess_changed, Coprocess};
use crate::pty::log::OutputLog;
use crate::pty::queue::WriteQueue;
use crate::pty::spawn::{fork_direct, fork_server, LaunchSpec};
use crate::server::attach::{attach, AttachResult, DEFAULT_ATTACH_TIMEOUT};

pub type TaskId = u64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

const NO_FD: RawFd = -1;
const NO_PID: i32 = -1;

/// Owner-side callbacks. All of them may be invoked from the
/// multiplexer thread, so none of them may block indefinitely.
pub trait TaskDelegate: Send + Sync {
    /// Raw bytes read from the task's pty, in read order.
    fn handle_output(&self, task: &PtyTask, data: &[u8]);

    /// The task hit a fatal I/O or attach failure and is permanently
    /// dead. Delivered exactly once per task.
    fn broken_pipe(&self, task: &PtyTask);

    /// Deregistration confirmed: two loop iterations have passed since
    /// the descriptor was invalidated by `stop()`.
    fn task_deregistered(&self, task: &PtyTask);

    /// Fork-level launch failure, surfaced synchronously so the owner
    /// can alert the user.
    fn launch_failed(&self, task: &PtyTask, error: &PtyError);
}

struct LaunchRecord {
    command: String,
    working_dir: Option<PathBuf>,
    tty_name: String,
}

struct TaskControl {
    paused: bool,
    coprocess: Option<Coprocess>,
    log: OutputLog,
}

pub struct PtyTask {
    id: TaskId,
    delegate: Arc<dyn TaskDelegate>,
    fd: AtomicI32,
    child_pid: AtomicI32,
    server_pid: AtomicI32,
    server_child_pid: AtomicI32,
    broken: AtomicBool,
    broken_reported: AtomicBool,
    coprocess_only: bool,
    launch_record: Mutex<Option<LaunchRecord>>,
    // Pause flag and coprocess binding share one lock because the
    // multiplexer reads both in a single interest scan.
    control: Mutex<TaskControl>,
    queue: Mutex<WriteQueue>,
    mux: Mutex<Option<IoMultiplexer>>,
}

impl PtyTask {
    pub fn new(delegate: Arc<dyn TaskDelegate>) -> Arc<Self> {
        Self::build(delegate, false)
    }

    /// A task that exists only to host a coprocess; it never gets a
    /// pty of its own, and coprocess output goes straight to the sink.
    pub fn new_coprocess_only(delegate: Arc<dyn TaskDelegate>) -> Arc<Self> {
        Self::build(delegate, true)
    }

    fn build(delegate: Arc<dyn TaskDelegate>, coprocess_only: bool) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            delegate,
            fd: AtomicI32::new(NO_FD),
            child_pid: AtomicI32::new(NO_PID),
            server_pid: AtomicI32::new(NO_PID),
            server_child_pid: AtomicI32::new(NO_PID),
            broken: AtomicBool::new(false),
            broken_reported: AtomicBool::new(false),
            coprocess_only,
            launch_record: Mutex::new(None),
            control: Mutex::new(TaskControl {
                paused: false,
                coprocess: None,
                log: OutputLog::new(),
            }),
            queue: Mutex::new(WriteQueue::new()),
            mux: Mutex::new(None),
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Fork (or fork-through-server) and register with the multiplexer.
    ///
    /// Fork failure surfaces through `launch_failed`; attach failure
    /// after a successful server fork routes through the broken-pipe
    /// path, so the owner sees one uniform "task is dead" signal.
    pub fn launch(self: &Arc<Self>, spec: LaunchSpec, mux: &IoMultiplexer) -> Result<()> {
        if self.fd() >= 0 || self.is_broken() {
            return Err(PtyError::BadState("launch"));
        }
        if self.coprocess_only {
            return Err(PtyError::BadState("launch of a coprocess-only task"));
        }

        let tty_name = if spec.use_server {
            let server_pid = match fork_server(&spec) {
                Ok(pid) => pid,
                Err(e) => {
                    self.delegate.launch_failed(self, &e);
                    return Err(e);
                }
            };
            match attach(server_pid, DEFAULT_ATTACH_TIMEOUT) {
                Ok(AttachResult {
                    master,
                    child_pid,
                    tty_name,
                }) => {
                    self.server_pid.store(server_pid.as_raw(), Ordering::Release);
                    self.server_child_pid
                        .store(child_pid.as_raw(), Ordering::Release);
                    self.fd.store(master.into_raw_fd(), Ordering::Release);
                    tty_name
                }
                Err(e) => {
                    // The fd (if any was passed) died with the failed
                    // handshake; all that is left is to tell the owner.
                    warn!("task {}: attach to server {} failed: {}", self.id, server_pid, e);
                    self.enter_broken_state();
                    return Err(e.into());
                }
            }
        } else {
            let forked = match fork_direct(&spec) {
                Ok(forked) => forked,
                Err(e) => {
                    self.delegate.launch_failed(self, &e);
                    return Err(e);
                }
            };
            self.child_pid
                .store(forked.child.as_raw(), Ordering::Release);
            self.fd
                .store(forked.master.into_raw_fd(), Ordering::Release);
            forked.tty_name
        };

        let mut command = spec.program.clone();
        for arg in &spec.args {
            command.push(' ');
            command.push_str(arg);
        }
        *self.launch_record.lock().unwrap() = Some(LaunchRecord {
            command,
            working_dir: spec.working_dir.clone(),
            tty_name,
        });

        *self.mux.lock().unwrap() = Some(mux.clone());
        mux.register_task(Arc::clone(self));
        Ok(())
    }

    /// Reattach to an already-running detached server, e.g. after this
    /// process restarted while the session kept running.
    pub fn attach_to_server(
        self: &Arc<Self>,
        server_pid: Pid,
        timeout: Duration,
        mux: &IoMultiplexer,
    ) -> Result<()> {
        if self.fd() >= 0 || self.is_broken() {
            return Err(PtyError::BadState("attach"));
        }
        match attach(server_pid, timeout) {
            Ok(AttachResult {
                master,
                child_pid,
                tty_name,
            }) => {
                self.server_pid.store(server_pid.as_raw(), Ordering::Release);
                self.server_child_pid
                    .store(child_pid.as_raw(), Ordering::Release);
                self.fd.store(master.into_raw_fd(), Ordering::Release);
                *self.launch_record.lock().unwrap() = Some(LaunchRecord {
                    command: String::new(),
                    working_dir: None,
                    tty_name,
                });
                *self.mux.lock().unwrap() = Some(mux.clone());
                mux.register_task(Arc::clone(self));
                Ok(())
            }
            Err(e) => {
                self.enter_broken_state();
                Err(e.into())
            }
        }
    }

    /// Queue bytes for the child. Never blocks and never rejects;
    /// check [`has_room_for_write`](Self::has_room_for_write) first to
    /// respect backpressure.
    pub fn write(&self, data: &[u8]) {
        self.queue.lock().unwrap().append(data);
        self.wake_mux();
    }

    /// Soft backpressure signal from the write queue.
    pub fn has_room_for_write(&self) -> bool {
        self.queue.lock().unwrap().has_room()
    }

    pub fn set_paused(&self, paused: bool) {
        self.control.lock().unwrap().paused = paused;
        self.wake_mux();
    }

    pub fn is_paused(&self) -> bool {
        self.control.lock().unwrap().paused
    }

    /// Resize the pty. Compares against the current size first and only
    /// issues the resize ioctl when the dimensions actually change.
    /// No-op while the descriptor is invalid.
    pub fn set_size(&self, width: u16, height: u16) -> Result<()> {
        let fd = self.fd();
        if fd < 0 {
            return Ok(());
        }
        let mut current = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        if unsafe { libc::ioctl(fd, libc::TIOCGWINSZ as libc::c_ulong, &mut current) } < 0 {
            return Err(PtyError::Io(std::io::Error::last_os_error()));
        }
        if current.ws_col == width && current.ws_row == height {
            return Ok(());
        }
        let wanted = libc::winsize {
            ws_row: height,
            ws_col: width,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        if unsafe { libc::ioctl(fd, libc::TIOCSWINSZ as libc::c_ulong, &wanted) } < 0 {
            return Err(PtyError::Io(std::io::Error::last_os_error()));
        }
        debug!("task {}: resized pty to {}x{}", self.id, width, height);
        Ok(())
    }

    /// Best-effort signal delivery to whichever child this task owns.
    /// Silent no-op when no valid pid exists.
    pub fn send_signal(&self, signal: Signal) {
        let pid = self.server_child_pid.load(Ordering::Acquire);
        let pid = if pid > 0 {
            pid
        } else {
            self.child_pid.load(Ordering::Acquire)
        };
        if pid > 0 {
            let _ = kill(Pid::from_raw(pid), signal);
        }
    }

    /// Current child pid: the server-owned child when attached, else
    /// the directly owned child.
    pub fn pid(&self) -> Option<Pid> {
        let server_child = self.server_child_pid.load(Ordering::Acquire);
        if server_child > 0 {
            return Some(Pid::from_raw(server_child));
        }
        let child = self.child_pid.load(Ordering::Acquire);
        if child > 0 {
            Some(Pid::from_raw(child))
        } else {
            None
        }
    }

    pub fn tty_name(&self) -> Option<String> {
        self.launch_record
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r.tty_name.clone())
    }

    pub fn command(&self) -> Option<String> {
        self.launch_record
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r.command.clone())
    }

    pub fn working_path(&self) -> Option<PathBuf> {
        self.launch_record
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|r| r.working_dir.clone())
    }

    /// Live working directory of the child, read from the process
    /// table. Falls back to the launch-time path.
    pub fn current_working_directory(&self) -> Option<PathBuf> {
        self.pid()
            .and_then(crate::procinfo::working_directory)
            .or_else(|| self.working_path())
    }

    /// Short command name of the child as the kernel reports it.
    pub fn job_name(&self) -> Option<String> {
        self.pid().and_then(crate::procinfo::job_name)
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub fn is_server_attached(&self) -> bool {
        self.server_pid.load(Ordering::Acquire) > 0
    }

    pub fn owns_child_directly(&self) -> bool {
        self.child_pid.load(Ordering::Acquire) > 0
    }

    pub fn start_logging(&self, path: &Path) -> bool {
        self.control.lock().unwrap().log.start(path)
    }

    pub fn stop_logging(&self) {
        self.control.lock().unwrap().log.stop();
    }

    /// Spawn and bind a coprocess. An existing binding is stopped
    /// first.
    pub fn bind_coprocess(&self, command: &str, mute: bool) -> Result<()> {
        let coprocess = Coprocess::spawn(command, mute)?;
        let previous = {
            let mut control = self.control.lock().unwrap();
            control.coprocess.replace(coprocess)
        };
        if let Some(old) = previous {
            old.stop();
        }
        notify_coprocess_changed();
        self.wake_mux();
        Ok(())
    }

    /// Stop and unbind the coprocess, waiting for it to be reaped.
    /// Broadcasts the coprocess-changed notification afterwards.
    pub fn stop_coprocess(&self) {
        let taken = self.control.lock().unwrap().coprocess.take();
        if let Some(coprocess) = taken {
            coprocess.stop();
        }
        self.wake_mux();
    }

    pub fn has_coprocess(&self) -> bool {
        self.control.lock().unwrap().coprocess.is_some()
    }

    /// Best-effort teardown. Idempotent; the owner hears
    /// `task_deregistered` two loop iterations after the descriptor is
    /// invalidated here.
    pub fn stop(self: &Arc<Self>) {
        {
            let mut control = self.control.lock().unwrap();
            control.paused = false;
            control.log.stop();
        }

        let child = self.child_pid.load(Ordering::Acquire);
        if child > 0 {
            // The child is its session leader, so pid == pgid; hang up
            // the whole group.
            let _ = kill(Pid::from_raw(-child), Signal::SIGHUP);
            let _ = waitpid(Pid::from_raw(child), Some(WaitPidFlag::WNOHANG));
        }

        let server_child = self.server_child_pid.load(Ordering::Acquire);
        if server_child > 0 {
            let _ = kill(Pid::from_raw(-server_child), Signal::SIGHUP);
        }
        let server = self.server_pid.load(Ordering::Acquire);
        if server > 0 {
            info!("task {}: stopping server {}", self.id, server);
            let _ = kill(Pid::from_raw(server), Signal::SIGTERM);
            wait_for_process_exit(Pid::from_raw(server));
        }

        self.close_fd();

        let mux = self.mux.lock().unwrap().take();
        if let Some(mux) = mux {
            mux.deregister_task(self);
        }
    }

    // ---- multiplexer-facing internals ----

    pub(crate) fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    pub(crate) fn has_pending_writes(&self) -> bool {
        !self.queue.lock().unwrap().is_empty()
    }

    /// One bounded write from the queue front. `Err(())` marks a dead
    /// descriptor; transient conditions leave the queue untouched.
    pub(crate) fn drain_write_queue(&self, fd: RawFd) -> std::result::Result<(), ()> {
        let mut queue = self.queue.lock().unwrap();
        if queue.is_empty() {
            return Ok(());
        }
        let chunk = queue.front(IO_CHUNK_SIZE);
        match write_fd(fd, chunk) {
            Ok(n) => {
                queue.consume(n);
                Ok(())
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(()),
            Err(e) => {
                warn!("task {}: write failed: {}", self.id, e);
                Err(())
            }
        }
    }

    /// Append pty output to the active log and hand it to the sink.
    pub(crate) fn deliver_output(&self, data: &[u8]) {
        self.control.lock().unwrap().log.append(data);
        self.delegate.handle_output(self, data);
    }

    /// Mirror pty output into the bound coprocess's input buffer.
    /// Caller holds the multiplexer's coarse lock.
    pub(crate) fn mirror_to_coprocess(&self, data: &[u8]) {
        if let Some(coprocess) = self.control.lock().unwrap().coprocess.as_mut() {
            coprocess.mirror_output(data);
        }
    }

    pub(crate) fn coprocess_poll_info(&self) -> Option<(RawFd, RawFd, bool)> {
        self.control
            .lock()
            .unwrap()
            .coprocess
            .as_ref()
            .map(|c| (c.input_fd(), c.output_fd(), c.has_pending_input()))
    }

    /// Flush one bounded chunk of mirrored output into the coprocess's
    /// stdin. Caller holds the multiplexer's coarse lock.
    pub(crate) fn flush_coprocess_input(&self, limit: usize) -> std::result::Result<(), ()> {
        let mut control = self.control.lock().unwrap();
        let Some(coprocess) = control.coprocess.as_mut() else {
            return Ok(());
        };
        let chunk_len = {
            let chunk = coprocess.pending_front(limit);
            if chunk.is_empty() {
                return Ok(());
            }
            match write_fd(coprocess.input_fd(), chunk) {
                Ok(n) => n,
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => return Ok(()),
                Err(e) => {
                    warn!("task {}: coprocess write failed: {}", self.id, e);
                    return Err(());
                }
            }
        };
        coprocess.consume_pending(chunk_len);
        Ok(())
    }

    /// Coprocess stdout feeds back into the task's delivery path: the
    /// write queue for a real task, the sink for a coprocess-only one.
    pub(crate) fn accept_coprocess_output(&self, data: &[u8]) {
        if self.coprocess_only || self.fd() < 0 {
            self.delegate.handle_output(self, data);
        } else {
            self.queue.lock().unwrap().append(data);
        }
    }

    /// Tear down a coprocess whose pipes died. Runs on the multiplexer
    /// thread, so the reap must not block.
    pub(crate) fn drop_coprocess_binding(&self) {
        let taken = self.control.lock().unwrap().coprocess.take();
        if let Some(coprocess) = taken {
            debug!("task {}: coprocess {} ended", self.id, coprocess.pid());
            coprocess.discard();
        }
    }

    /// Permanent transition after a fatal I/O or attach failure.
    /// Closes the descriptor and reports to the delegate exactly once.
    pub(crate) fn enter_broken_state(&self) {
        self.broken.store(true, Ordering::Release);
        self.close_fd();
        let child = self.child_pid.load(Ordering::Acquire);
        if child > 0 {
            let _ = waitpid(Pid::from_raw(child), Some(WaitPidFlag::WNOHANG));
        }
        if !self.broken_reported.swap(true, Ordering::AcqRel) {
            self.delegate.broken_pipe(self);
        }
    }

    pub(crate) fn confirm_deregistered(&self) {
        self.delegate.task_deregistered(self);
    }

    /// Test hook: install an arbitrary descriptor (pipe ends stand in
    /// for pty masters). Takes ownership; the task closes it.
    #[cfg(test)]
    pub(crate) fn force_fd(&self, fd: RawFd) {
        self.fd.store(fd, Ordering::Release);
    }

    fn close_fd(&self) {
        let fd = self.fd.swap(NO_FD, Ordering::AcqRel);
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
    }

    fn wake_mux(&self) {
        if let Some(mux) = self.mux.lock().unwrap().as_ref() {
            mux.wake();
        }
    }
}

impl Drop for PtyTask {
    fn drop(&mut self) {
        self.close_fd();
    }
}

/// Synchronous wait used by `stop()` for a detached server. Falls back
/// to polling liveness when the server is not our direct child (the
/// reattach-after-restart case).
fn wait_for_process_exit(pid: Pid) {
    match waitpid(pid, None) {
        Ok(_) => return,
        Err(Errno::ECHILD) => {}
        Err(e) => {
            warn!("waitpid({}) failed: {}", pid, e);
            return;
        }
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        match kill(pid, None) {
            Err(Errno::ESRCH) => return,
            _ => std::thread::sleep(Duration::from_millis(10)),
        }
    }
    warn!("server {} did not exit within the stop deadline", pid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::read_fd;
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    use std::os::fd::{AsFd, AsRawFd};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[derive(Debug, PartialEq)]
    enum Event {
        Output(Vec<u8>),
        Broken,
        Deregistered,
    }

    struct Recorder {
        events: mpsc::Sender<Event>,
        broken_count: AtomicUsize,
    }

    impl Recorder {
        fn pair() -> (Arc<Self>, mpsc::Receiver<Event>) {
            let (tx, rx) = mpsc::channel();
            (
                Arc::new(Self {
                    events: tx,
                    broken_count: AtomicUsize::new(0),
                }),
                rx,
            )
        }
    }

    impl TaskDelegate for Recorder {
        fn handle_output(&self, _task: &PtyTask, data: &[u8]) {
            let _ = self.events.send(Event::Output(data.to_vec()));
        }

        fn broken_pipe(&self, _task: &PtyTask) {
            self.broken_count.fetch_add(1, Ordering::SeqCst);
            let _ = self.events.send(Event::Broken);
        }

        fn task_deregistered(&self, _task: &PtyTask) {
            let _ = self.events.send(Event::Deregistered);
        }

        fn launch_failed(&self, _task: &PtyTask, _error: &PtyError) {}
    }

    fn wait_for(rx: &mpsc::Receiver<Event>, wanted: fn(&Event) -> bool) -> Event {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(left) {
                Ok(event) if wanted(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("timed out waiting for event: {}", e),
            }
        }
    }

    fn nonblocking_pipe() -> (std::os::fd::OwnedFd, std::os::fd::OwnedFd) {
        let (r, w) = nix::unistd::pipe().unwrap();
        for fd in [&r, &w] {
            let flags = fcntl(fd.as_fd(), FcntlArg::F_GETFL).unwrap();
            let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
            fcntl(fd.as_fd(), FcntlArg::F_SETFL(flags)).unwrap();
        }
        (r, w)
    }

    #[test]
    fn test_drain_writes_queue_front_in_order() {
        let (delegate, _rx) = Recorder::pair();
        let task = PtyTask::new(delegate);
        let (read_end, write_end) = nonblocking_pipe();

        task.write(b"first ");
        task.write(b"second");
        while task.has_pending_writes() {
            task.drain_write_queue(write_end.as_raw_fd()).unwrap();
        }

        let mut buf = [0u8; 64];
        let n = read_fd(read_end.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"first second");
    }

    #[test]
    fn test_drain_on_full_pipe_keeps_queue_intact() {
        let (delegate, _rx) = Recorder::pair();
        let task = PtyTask::new(delegate);
        let (_read_end, write_end) = nonblocking_pipe();

        // Stuff the pipe until the kernel pushes back.
        let filler = [0u8; 4096];
        loop {
            match write_fd(write_end.as_raw_fd(), &filler) {
                Ok(_) => continue,
                Err(Errno::EAGAIN) => break,
                Err(e) => panic!("unexpected errno {}", e),
            }
        }

        task.write(b"stuck");
        assert!(task.drain_write_queue(write_end.as_raw_fd()).is_ok());
        assert!(task.has_pending_writes());
    }

    #[test]
    fn test_drain_reports_dead_descriptor() {
        let (delegate, _rx) = Recorder::pair();
        let task = PtyTask::new(delegate);
        let (read_end, write_end) = nonblocking_pipe();
        drop(read_end);

        task.write(b"doomed");
        assert!(task.drain_write_queue(write_end.as_raw_fd()).is_err());
    }

    #[test]
    fn test_send_signal_without_child_is_a_no_op() {
        let (delegate, _rx) = Recorder::pair();
        let task = PtyTask::new(delegate);
        task.send_signal(Signal::SIGTERM);
    }

    #[test]
    fn test_launch_direct_owns_exactly_one_way() {
        let mux = IoMultiplexer::new();
        let (delegate, rx) = Recorder::pair();
        let task = PtyTask::new(delegate);

        let mut spec = LaunchSpec::new("/bin/cat");
        spec.use_server = false;
        task.launch(spec, &mux).unwrap();

        assert!(task.owns_child_directly());
        assert!(!task.is_server_attached());
        assert!(task.pid().is_some());
        assert!(task.tty_name().unwrap().starts_with("/dev/"));
        assert!(mux.is_registered(task.id()));

        task.stop();
        wait_for(&rx, |e| matches!(e, Event::Deregistered));
        assert!(!mux.is_registered(task.id()));
        assert!(task.fd() < 0);
    }

    #[test]
    fn test_double_launch_is_rejected() {
        let mux = IoMultiplexer::new();
        let (delegate, rx) = Recorder::pair();
        let task = PtyTask::new(delegate);

        task.launch(LaunchSpec::new("/bin/cat"), &mux).unwrap();
        assert!(matches!(
            task.launch(LaunchSpec::new("/bin/cat"), &mux),
            Err(PtyError::BadState(_))
        ));

        task.stop();
        wait_for(&rx, |e| matches!(e, Event::Deregistered));
    }

    #[test]
    fn test_output_flows_to_delegate() {
        let mux = IoMultiplexer::new();
        let (delegate, rx) = Recorder::pair();
        let task = PtyTask::new(delegate);

        let mut spec = LaunchSpec::new("/bin/sh");
        spec.args = vec!["-c".to_string(), "printf marker; exec cat".to_string()];
        task.launch(spec, &mux).unwrap();

        let mut seen = Vec::new();
        loop {
            match wait_for(&rx, |e| matches!(e, Event::Output(_))) {
                Event::Output(data) => {
                    seen.extend_from_slice(&data);
                    if seen.windows(6).any(|w| w == b"marker") {
                        break;
                    }
                }
                _ => unreachable!(),
            }
        }

        task.stop();
        wait_for(&rx, |e| matches!(e, Event::Deregistered));
    }

    #[test]
    fn test_child_exit_reports_broken_pipe_once() {
        let mux = IoMultiplexer::new();
        let (delegate, rx) = Recorder::pair();
        let task = PtyTask::new(delegate.clone());

        let mut spec = LaunchSpec::new("/bin/sh");
        spec.args = vec!["-c".to_string(), "exit 0".to_string()];
        task.launch(spec, &mux).unwrap();

        wait_for(&rx, |e| matches!(e, Event::Broken));
        assert!(task.is_broken());
        assert!(task.fd() < 0);

        // A later stop must not produce a second report.
        task.stop();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(delegate.broken_count.load(Ordering::SeqCst), 1);
        assert!(!mux.is_registered(task.id()));
    }

    #[test]
    fn test_pause_holds_output_until_resume() {
        let mux = IoMultiplexer::new();
        let (delegate, rx) = Recorder::pair();
        let task = PtyTask::new(delegate);

        task.launch(LaunchSpec::new("/bin/cat"), &mux).unwrap();
        task.set_paused(true);
        // cat plus tty echo both reflect our bytes back.
        task.write(b"held\n");

        std::thread::sleep(Duration::from_millis(200));
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::TryRecvError::Empty)
        ));

        task.set_paused(false);
        wait_for(&rx, |e| matches!(e, Event::Output(_)));

        task.stop();
        wait_for(&rx, |e| matches!(e, Event::Deregistered));
    }

    #[test]
    fn test_set_size_applies_and_skips_identical() {
        let mux = IoMultiplexer::new();
        let (delegate, rx) = Recorder::pair();
        let task = PtyTask::new(delegate);

        let mut spec = LaunchSpec::new("/bin/cat");
        spec.width = 80;
        spec.height = 24;
        task.launch(spec, &mux).unwrap();

        task.set_size(132, 50).unwrap();
        task.set_size(132, 50).unwrap();

        let mut ws = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let rc = unsafe { libc::ioctl(task.fd(), libc::TIOCGWINSZ as libc::c_ulong, &mut ws) };
        assert_eq!(rc, 0);
        assert_eq!(ws.ws_col, 132);
        assert_eq!(ws.ws_row, 50);

        task.stop();
        wait_for(&rx, |e| matches!(e, Event::Deregistered));
    }

    #[test]
    fn test_coprocess_only_task_routes_output_to_delegate() {
        let (delegate, _rx) = Recorder::pair();
        let task = PtyTask::new_coprocess_only(delegate);
        assert!(matches!(
            task.launch(LaunchSpec::new("/bin/cat"), &IoMultiplexer::new()),
            Err(PtyError::BadState(_))
        ));

        task.accept_coprocess_output(b"direct");
        let event = _rx.try_recv().unwrap();
        assert_eq!(event, Event::Output(b"direct".to_vec()));
    }

    #[test]
    fn test_coprocess_output_feeds_write_queue() {
        let (delegate, _rx) = Recorder::pair();
        let task = PtyTask::new(delegate);
        // Simulate a launched task by the queue path only.
        task.fd.store(9999, Ordering::Release);
        task.accept_coprocess_output(b"to child");
        assert!(task.has_pending_writes());
        task.fd.store(NO_FD, Ordering::Release);
    }
}
