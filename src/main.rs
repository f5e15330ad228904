use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use ptymux::error::PtyError;
use ptymux::server::run_server;
use ptymux::{IoMultiplexer, LaunchSpec, PtyTask, TaskDelegate};

#[derive(Parser)]
#[command(name = "ptymux", about = "Run a command on a pty, optionally behind a detached server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a command on a fresh pty, wiring it to this terminal.
    Run {
        /// Launch through a detached server so the session survives us.
        #[arg(long)]
        detach: bool,

        /// Append raw pty output to this file.
        #[arg(long)]
        log: Option<PathBuf>,

        /// Shell command to bind as a coprocess.
        #[arg(long)]
        coprocess: Option<String>,

        /// Program and arguments.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Internal directive: run as the detached server for one child.
    /// Forked by `run --detach`, not meant to be invoked by hand.
    #[command(hide = true)]
    Serve {
        #[arg(long)]
        master_fd: i32,

        #[arg(long)]
        slave_fd: i32,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
}

enum Event {
    Broken,
    Deregistered,
}

struct TerminalSink {
    events: mpsc::Sender<Event>,
}

impl TaskDelegate for TerminalSink {
    fn handle_output(&self, _task: &PtyTask, data: &[u8]) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(data);
        let _ = stdout.flush();
    }

    fn broken_pipe(&self, _task: &PtyTask) {
        let _ = self.events.send(Event::Broken);
    }

    fn task_deregistered(&self, _task: &PtyTask) {
        let _ = self.events.send(Event::Deregistered);
    }

    fn launch_failed(&self, _task: &PtyTask, error: &PtyError) {
        eprintln!("ptymux: launch failed: {}", error);
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            master_fd,
            slave_fd,
            command,
        } => {
            let (program, args) = command.split_first().context("empty serve command")?;
            let code = run_server(master_fd, slave_fd, program, args)?;
            std::process::exit(code);
        }
        Command::Run {
            detach,
            log,
            coprocess,
            command,
        } => run_task(detach, log, coprocess, command),
    }
}

fn run_task(
    detach: bool,
    log: Option<PathBuf>,
    coprocess: Option<String>,
    command: Vec<String>,
) -> anyhow::Result<()> {
    let Some((program, args)) = command.split_first() else {
        bail!("empty command");
    };

    let (events_tx, events_rx) = mpsc::channel();
    let task = PtyTask::new(Arc::new(TerminalSink { events: events_tx }));

    let mut spec = LaunchSpec::new(program.clone());
    spec.args = args.to_vec();
    spec.use_server = detach;
    if let Some((width, height)) = terminal_size() {
        spec.width = width;
        spec.height = height;
    }

    task.launch(spec, IoMultiplexer::global())
        .context("launch failed")?;

    if let Some(path) = &log {
        if !task.start_logging(path) {
            warn!("could not open log file {}", path.display());
        }
    }
    if let Some(cmd) = &coprocess {
        task.bind_coprocess(cmd, false).context("coprocess failed")?;
    }

    // Forward our stdin to the child. The thread dies with the process.
    {
        let task = Arc::clone(&task);
        std::thread::spawn(move || {
            let mut stdin = std::io::stdin().lock();
            let mut buf = [0u8; 1024];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        while !task.has_room_for_write() {
                            std::thread::sleep(Duration::from_millis(5));
                        }
                        task.write(&buf[..n]);
                    }
                }
            }
        });
    }

    // Wait for the child to end, then tear down and wait for the
    // multiplexer to confirm.
    loop {
        match events_rx.recv() {
            Ok(Event::Broken) => break,
            Ok(Event::Deregistered) => continue,
            Err(_) => break,
        }
    }
    task.stop();
    let _ = events_rx.recv_timeout(Duration::from_secs(2));
    Ok(())
}

fn terminal_size() -> Option<(u16, u16)> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let rc = unsafe { libc::ioctl(0, libc::TIOCGWINSZ as libc::c_ulong, &mut ws) };
    if rc == 0 && ws.ws_col > 0 && ws.ws_row > 0 {
        Some((ws.ws_col, ws.ws_row))
    } else {
        None
    }
}
