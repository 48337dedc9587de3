//! Driver loop that owns a session controller.
//!
//! The runtime is the single execution context for a session: it drains
//! user commands, applies finished admin calls, fires due capture ticks and
//! retry deadlines, then waits on the transport until the next deadline.
//! Admin HTTP calls run on helper threads and come back over a channel.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::admin::{ServiceStatus, StatisticsAdmin};
use crate::ingest::FrameSource;
use crate::session::SessionController;
use crate::transport::{Transport, TransportError};

/// Longest the driver waits on the transport before re-checking commands.
pub const DEFAULT_MAX_POLL: Duration = Duration::from_millis(25);

const MIN_POLL: Duration = Duration::from_millis(1);

/// Requests from the presentation layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    ResetStatistics,
    QueryStatus,
    Shutdown,
}

enum AdminOutcome {
    Reset(Result<(), TransportError>),
    Status(Result<ServiceStatus, TransportError>),
}

pub struct ClientRuntime<T: Transport, S: FrameSource> {
    controller: SessionController<T, S>,
    admin: Arc<dyn StatisticsAdmin + Send + Sync>,
    commands: Receiver<Command>,
    admin_tx: Sender<AdminOutcome>,
    admin_rx: Receiver<AdminOutcome>,
    max_poll: Duration,
    shutdown: bool,
}

impl<T: Transport, S: FrameSource> ClientRuntime<T, S> {
    pub fn new(
        controller: SessionController<T, S>,
        admin: Arc<dyn StatisticsAdmin + Send + Sync>,
        commands: Receiver<Command>,
    ) -> Self {
        let (admin_tx, admin_rx) = mpsc::channel();
        Self {
            controller,
            admin,
            commands,
            admin_tx,
            admin_rx,
            max_poll: DEFAULT_MAX_POLL,
            shutdown: false,
        }
    }

    pub fn with_max_poll(mut self, max_poll: Duration) -> Self {
        self.max_poll = max_poll.max(MIN_POLL);
        self
    }

    pub fn controller(&self) -> &SessionController<T, S> {
        &self.controller
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Run until `Shutdown` arrives or every command sender is dropped, then
    /// close the session.
    pub fn run(&mut self) {
        log::info!(
            "ClientRuntime: running ({} transport to {})",
            self.controller.mode(),
            self.controller.endpoint()
        );
        while self.step() {}
        self.controller.close();
        log::info!("ClientRuntime: stopped");
    }

    /// One pass of the driver loop. Returns false once shut down.
    pub fn step(&mut self) -> bool {
        if self.shutdown {
            return false;
        }
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.dispatch(command),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    log::debug!("ClientRuntime: command channel closed");
                    self.shutdown = true;
                    break;
                }
            }
            if self.shutdown {
                break;
            }
        }
        if self.shutdown {
            self.controller.close();
            return false;
        }

        while let Ok(outcome) = self.admin_rx.try_recv() {
            match outcome {
                AdminOutcome::Reset(result) => self.controller.on_statistics_reset(result),
                AdminOutcome::Status(result) => self.controller.set_service_status(result),
            }
        }

        let now = Instant::now();
        self.controller.poll_retry(now);
        self.controller.on_tick(now);

        let wait = match self.controller.next_deadline() {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(self.max_poll),
            None => self.max_poll,
        };
        self.controller.pump(wait.max(MIN_POLL));
        true
    }

    fn dispatch(&mut self, command: Command) {
        log::debug!("ClientRuntime: {:?}", command);
        match command {
            Command::Start => self.controller.start(Instant::now()),
            Command::Stop => self.controller.stop(),
            Command::ResetStatistics => {
                let admin = Arc::clone(&self.admin);
                self.spawn_admin("sentinel-reset", move || {
                    AdminOutcome::Reset(admin.reset_statistics())
                });
            }
            Command::QueryStatus => {
                let admin = Arc::clone(&self.admin);
                self.spawn_admin("sentinel-status", move || {
                    AdminOutcome::Status(admin.status())
                });
            }
            Command::Shutdown => self.shutdown = true,
        }
    }

    fn spawn_admin<F>(&mut self, name: &str, call: F)
    where
        F: FnOnce() -> AdminOutcome + Send + 'static,
    {
        let tx = self.admin_tx.clone();
        let spawned = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _ = tx.send(call());
            });
        if let Err(err) = spawned {
            log::warn!("ClientRuntime: failed to spawn {}: {}", name, err);
        }
    }
}
