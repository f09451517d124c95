//! Interactive terminal session controller.
//!
//! One session per (room, user): output streaming into a rendering
//! surface, capability-gated input, coalesced viewport negotiation, and
//! failure-driven recovery. A server `exit` is informational (banner, the
//! session stays open for inspection); a server `error` is fatal to the
//! current session and triggers a full teardown-and-reinitialize, because
//! partial process/channel state cannot be resumed client-side.
//!
//! Every (re)initialization bumps an instance token. Event pumps carry the
//! token they were spawned under and drop anything delivered to a stale
//! instance, so a refreshed session never double-writes old output.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use atelier_channel::{Channel, ChannelError, Subscription};
use atelier_proto::{Capability, ClientMessage, FileNode, RoomInfo, Scope, ServerMessage, UserInfo};

use crate::viewport::ResizeCoalescer;

/// Terminal-session failures.
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("terminal session not initialized")]
    NotActive,
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Lifecycle of the terminal session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Uninitialized,
    Initializing,
    Active,
    Error,
    Reinitializing,
    Closing,
}

/// What happened to a run request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Dispatched,
    /// No file (or a directory) was selected; nothing was sent. The caller
    /// surfaces the notice.
    NoFileSelected,
    /// A run is already in flight; the request was suppressed.
    AlreadyRunning,
    /// Viewers cannot run files.
    ReadOnly,
}

/// The rendering surface behind the session (an xterm-like view).
pub trait TerminalSurface: Send {
    /// Append raw output.
    fn write(&mut self, data: &str);
    /// Wipe the visible buffer.
    fn clear(&mut self);
}

pub type SharedTerminalSurface = Arc<Mutex<dyn TerminalSurface>>;

/// Timing and sizing knobs.
#[derive(Debug, Clone)]
pub struct TerminalConfig {
    pub initial_cols: u16,
    pub initial_rows: u16,
    /// Resize bursts are coalesced to one message per window.
    pub resize_debounce: Duration,
    /// Fallback window after which the run-in-flight flag clears.
    pub run_cooldown: Duration,
    /// Minimum spacing between full reinitializations.
    pub refresh_debounce: Duration,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            initial_cols: 80,
            initial_rows: 30,
            resize_debounce: Duration::from_millis(50),
            run_cooldown: Duration::from_secs(1),
            refresh_debounce: Duration::from_secs(1),
        }
    }
}

struct ControllerInner {
    channel: Arc<dyn Channel>,
    user: UserInfo,
    room: RoomInfo,
    surface: SharedTerminalSurface,
    config: TerminalConfig,
    /// Monotonic instance token; bumped on every init and teardown.
    instance: AtomicU64,
    state: Mutex<TerminalState>,
    dimensions: Mutex<(u16, u16)>,
    resize: ResizeCoalescer,
    run_in_flight: AtomicBool,
    refreshing: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Controller for one user's interactive session in one room.
pub struct TerminalController {
    inner: Arc<ControllerInner>,
}

impl TerminalController {
    pub fn new(
        channel: Arc<dyn Channel>,
        user: UserInfo,
        room: RoomInfo,
        surface: SharedTerminalSurface,
        config: TerminalConfig,
    ) -> Self {
        let dimensions = (config.initial_cols, config.initial_rows);
        Self {
            inner: Arc::new(ControllerInner {
                channel,
                user,
                room,
                surface,
                config,
                instance: AtomicU64::new(0),
                state: Mutex::new(TerminalState::Uninitialized),
                dimensions: Mutex::new(dimensions),
                resize: ResizeCoalescer::new(),
                run_in_flight: AtomicBool::new(false),
                refreshing: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn capability(&self) -> Capability {
        self.inner.capability()
    }

    pub fn state(&self) -> TerminalState {
        *self.inner.state.lock().unwrap()
    }

    pub fn dimensions(&self) -> (u16, u16) {
        *self.inner.dimensions.lock().unwrap()
    }

    /// The session key shared with the server: `{room_id}-{user_id}`.
    pub fn session_key(&self) -> String {
        self.inner.session_key()
    }

    /// Create/attach the server-side session and start streaming.
    pub fn init(&self) -> Result<(), TerminalError> {
        self.inner.init()
    }

    /// Forward user input. Contributors stream to the server; viewers get
    /// an inline notice and nothing is sent.
    pub fn input(&self, data: &str) -> Result<(), TerminalError> {
        self.inner.input(data)
    }

    /// Report new viewport dimensions; coalesced before `resize-terminal`
    /// goes out.
    pub fn viewport_resized(&self, cols: u16, rows: u16) {
        self.inner.viewport_resized(cols, rows);
    }

    /// Dispatch a one-shot "execute this file" command.
    pub fn run(&self, file: Option<&FileNode>) -> Result<RunOutcome, TerminalError> {
        self.inner.run(file)
    }

    /// Clear the surface; contributors also reset the remote prompt.
    pub fn clear(&self) -> Result<(), TerminalError> {
        self.inner.clear()
    }

    /// Full recreation: dispose the current session entirely, then
    /// re-initialize under a fresh instance token. Rapid repeats within the
    /// refresh debounce are suppressed.
    pub fn refresh(&self) -> Result<(), TerminalError> {
        self.inner.refresh()
    }

    /// Tear everything down (room exit / unmount). Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl ControllerInner {
    fn capability(&self) -> Capability {
        Capability::resolve(&self.user, &self.room)
    }

    fn session_key(&self) -> String {
        format!("{}-{}", self.room.id, self.user.id)
    }

    fn scope(&self) -> Scope {
        Scope::Terminal {
            room_id: self.room.id,
            user_id: self.user.id,
        }
    }

    fn init(self: &Arc<Self>) -> Result<(), TerminalError> {
        {
            // One session per (room, user); re-init goes through refresh.
            let state = self.state.lock().unwrap();
            if matches!(*state, TerminalState::Initializing | TerminalState::Active) {
                log::debug!("init ignored: session already {:?}", *state);
                return Ok(());
            }
        }
        let instance = self.instance.fetch_add(1, Ordering::SeqCst) + 1;
        *self.state.lock().unwrap() = TerminalState::Initializing;

        let sub = self.channel.subscribe(self.scope());
        self.spawn_pump(sub, instance);

        self.channel
            .send(ClientMessage::InitTerminal {
                room_id: self.room.id,
                user_id: self.user.id,
                session_key: self.session_key(),
            })
            .map_err(|e| {
                *self.state.lock().unwrap() = TerminalState::Error;
                TerminalError::from(e)
            })?;

        // Announce the current viewport right away; later changes go
        // through the coalescer.
        let (cols, rows) = *self.dimensions.lock().unwrap();
        if let Err(e) = self.channel.send(ClientMessage::ResizeTerminal {
            cols,
            rows,
            room_id: self.room.id,
            user_id: self.user.id,
        }) {
            log::warn!("initial resize not delivered: {e}");
        }

        *self.state.lock().unwrap() = TerminalState::Active;
        log::info!(
            "terminal session {} initialized (instance {instance})",
            self.session_key()
        );
        Ok(())
    }

    fn spawn_pump(self: &Arc<Self>, mut sub: Subscription, instance: u64) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                if inner.instance.load(Ordering::SeqCst) != instance {
                    // Event delivered to a disposed instance.
                    break;
                }
                match event {
                    ServerMessage::TerminalOutput { data, .. } => {
                        inner.surface.lock().unwrap().write(&data);
                    }
                    ServerMessage::TerminalExit { exit_code, .. } => {
                        log::info!("terminal process exited with code {exit_code}");
                        inner.surface.lock().unwrap().write(&format!(
                            "\r\nTerminal session ended (exit code: {exit_code})\r\n"
                        ));
                    }
                    ServerMessage::TerminalError { error, .. } => {
                        log::warn!("terminal session error: {error}");
                        *inner.state.lock().unwrap() = TerminalState::Error;
                        if let Err(e) = inner.refresh() {
                            log::error!("terminal reinitialization failed: {e}");
                        }
                        break;
                    }
                    _ => {}
                }
            }
        });
        self.tasks.lock().unwrap().push(task);
    }

    fn input(self: &Arc<Self>, data: &str) -> Result<(), TerminalError> {
        if *self.state.lock().unwrap() == TerminalState::Uninitialized {
            return Err(TerminalError::NotActive);
        }
        if !self.capability().can_write() {
            self.surface
                .lock()
                .unwrap()
                .write("\r\nRead-only mode: terminal input is disabled.\r\n");
            return Ok(());
        }
        self.channel.send(ClientMessage::TerminalInput {
            data: data.to_string(),
            room_id: self.room.id,
            user_id: self.user.id,
            session_key: self.session_key(),
        })?;
        Ok(())
    }

    fn viewport_resized(self: &Arc<Self>, cols: u16, rows: u16) {
        *self.dimensions.lock().unwrap() = (cols, rows);
        if !self.resize.submit(cols, rows) {
            return;
        }
        let weak = Arc::downgrade(self);
        let delay = self.config.resize_debounce;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            let Some((cols, rows)) = inner.resize.take() else {
                return;
            };
            if *inner.state.lock().unwrap() != TerminalState::Active {
                return;
            }
            if let Err(e) = inner.channel.send(ClientMessage::ResizeTerminal {
                cols,
                rows,
                room_id: inner.room.id,
                user_id: inner.user.id,
            }) {
                log::warn!("resize not delivered: {e}");
            } else {
                log::debug!("viewport negotiated to {cols}x{rows}");
            }
        });
    }

    fn run(self: &Arc<Self>, file: Option<&FileNode>) -> Result<RunOutcome, TerminalError> {
        if !self.capability().can_write() {
            return Ok(RunOutcome::ReadOnly);
        }
        if self.run_in_flight.swap(true, Ordering::AcqRel) {
            return Ok(RunOutcome::AlreadyRunning);
        }
        let Some(file) = file.filter(|f| f.is_file()) else {
            self.run_in_flight.store(false, Ordering::Release);
            return Ok(RunOutcome::NoFileSelected);
        };

        if let Err(e) = self.channel.send(ClientMessage::RunFile {
            file: file.clone(),
            room_id: self.room.id,
            user_id: self.user.id,
        }) {
            self.run_in_flight.store(false, Ordering::Release);
            return Err(e.into());
        }
        log::debug!("dispatched run for {}", file.path);

        // No completion signal exists; the cooldown prevents a permanent
        // lockout.
        let weak = Arc::downgrade(self);
        let cooldown = self.config.run_cooldown;
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            if let Some(inner) = weak.upgrade() {
                inner.run_in_flight.store(false, Ordering::Release);
            }
        });
        Ok(RunOutcome::Dispatched)
    }

    fn clear(self: &Arc<Self>) -> Result<(), TerminalError> {
        self.surface.lock().unwrap().clear();
        if self.capability().can_write() {
            self.channel.send(ClientMessage::TerminalInput {
                data: "clear\n".to_string(),
                room_id: self.room.id,
                user_id: self.user.id,
                session_key: self.session_key(),
            })?;
        }
        Ok(())
    }

    fn refresh(self: &Arc<Self>) -> Result<(), TerminalError> {
        if self.refreshing.swap(true, Ordering::AcqRel) {
            log::debug!("refresh suppressed (one already in progress)");
            return Ok(());
        }
        log::info!("refreshing terminal session {}", self.session_key());
        self.teardown(TerminalState::Reinitializing);
        let result = self.init();

        let weak = Arc::downgrade(self);
        let debounce = self.config.refresh_debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Some(inner) = weak.upgrade() {
                inner.refreshing.store(false, Ordering::Release);
            }
        });
        result
    }

    fn close(self: &Arc<Self>) {
        if *self.state.lock().unwrap() == TerminalState::Uninitialized {
            return;
        }
        *self.state.lock().unwrap() = TerminalState::Closing;
        self.teardown(TerminalState::Uninitialized);
        log::info!("terminal session {} closed", self.session_key());
    }

    /// Dispose the current instance: stale pumps stop, the server is told
    /// to release the session, pending viewport/run state is dropped.
    fn teardown(self: &Arc<Self>, next: TerminalState) {
        self.instance.fetch_add(1, Ordering::SeqCst);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.resize.reset();
        self.run_in_flight.store(false, Ordering::Release);
        if let Err(e) = self.channel.send(ClientMessage::LeaveTerminal {
            room_id: self.room.id,
            user_id: self.user.id,
        }) {
            log::debug!("leave-terminal not delivered: {e}");
        }
        *self.state.lock().unwrap() = next;
    }
}

/// In-memory surface for tests and headless embeddings.
#[derive(Default)]
pub struct CaptureSurface {
    pub output: String,
    pub clears: usize,
}

impl CaptureSurface {
    pub fn shared() -> Arc<Mutex<CaptureSurface>> {
        Arc::new(Mutex::new(CaptureSurface::default()))
    }
}

impl TerminalSurface for CaptureSurface {
    fn write(&mut self, data: &str) {
        self.output.push_str(data);
    }

    fn clear(&mut self) {
        self.output.clear();
        self.clears += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TerminalConfig::default();
        assert_eq!(config.initial_cols, 80);
        assert_eq!(config.initial_rows, 30);
        assert!(config.run_cooldown >= config.resize_debounce);
    }

    #[test]
    fn test_capture_surface() {
        let mut surface = CaptureSurface::default();
        surface.write("a");
        surface.write("b");
        assert_eq!(surface.output, "ab");
        surface.clear();
        assert_eq!(surface.output, "");
        assert_eq!(surface.clears, 1);
    }
}
