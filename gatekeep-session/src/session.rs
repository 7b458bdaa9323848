//! Session runtime: one task owns every slot
//!
//! Transport events, poll ticks, user commands and transport completions are
//! all funnelled through a single `select!` loop, so slot state has exactly one
//! writer. Transport calls run on their own tasks and report back through the
//! completion channel.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::{
    Action, BleTransport, Completion, SessionError, SessionOptions, SessionState, SlotConfig,
    SlotSnapshot, TransportEvent,
};

enum Command {
    Write {
        role: String,
        value: u8,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front door to a running session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Vec<SlotSnapshot>>,
}

impl SessionHandle {
    /// Write one byte to `role`'s characteristic
    ///
    /// Fails with `NotReady` if the slot has no usable connection. A transport
    /// failure of the write itself is only logged.
    pub async fn write(&self, role: &str, value: u8) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Write { role: role.to_string(), value, reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Current state of every slot
    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        self.snapshots.borrow().clone()
    }

    /// Receiver that wakes on every slot state change
    pub fn snapshots(&self) -> watch::Receiver<Vec<SlotSnapshot>> {
        self.snapshots.clone()
    }

    /// Stop the session and disconnect everything it holds
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

pub struct Session<T: BleTransport> {
    transport: Arc<T>,
    state: SessionState,
    completions: mpsc::UnboundedSender<Completion>,
    snapshots: watch::Sender<Vec<SlotSnapshot>>,
}

impl<T: BleTransport> Session<T> {
    /// Subscribe to `transport` and run a session for `slots` on a new task
    pub async fn spawn(
        transport: Arc<T>,
        slots: Vec<SlotConfig>,
        options: SessionOptions,
    ) -> Result<(SessionHandle, JoinHandle<()>), SessionError> {
        let state = SessionState::new(slots, options)?;
        let events = transport.subscribe().await?;

        let (command_tx, command_rx) = mpsc::channel(32);
        let (snapshot_tx, snapshot_rx) = watch::channel(state.snapshot());
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let session = Self {
            transport,
            state,
            completions: completion_tx,
            snapshots: snapshot_tx,
        };
        let task = tokio::spawn(session.run(events, command_rx, completion_rx));

        Ok((
            SessionHandle {
                commands: command_tx,
                snapshots: snapshot_rx,
            },
            task,
        ))
    }

    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut commands: mpsc::Receiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        let actions = self.state.start(Instant::now());
        self.dispatch(actions);

        let mut ticker = tokio::time::interval(self.state.options().poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown_reply = loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    debug!("transport event: {event:?}");
                    let actions = self.state.handle_event(event, Instant::now());
                    self.dispatch(actions);
                }

                Some(completion) = completions.recv() => {
                    let actions = self.state.on_completion(completion, Instant::now());
                    self.dispatch(actions);
                }

                _ = ticker.tick() => {
                    let actions = self.state.poll(Instant::now());
                    self.dispatch(actions);
                }

                command = commands.recv() => match command {
                    Some(Command::Write { role, value, reply }) => {
                        let result = match self.state.write(&role, value) {
                            Ok(action) => {
                                self.dispatch(vec![action]);
                                Ok(())
                            }
                            Err(e) => Err(e),
                        };
                        let _ = reply.send(result);
                    }
                    Some(Command::Shutdown { reply }) => break Some(reply),
                    // every handle dropped
                    None => break None,
                },
            }

            self.publish();
        };

        drop(events);
        let actions = self.state.shutdown();
        self.publish();

        for action in actions {
            if let Action::Disconnect { handle } = action {
                if let Err(e) = self.transport.disconnect(&handle).await {
                    warn!("disconnect from {handle} failed: {e}");
                }
            }
        }

        info!("Session stopped");
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    fn publish(&self) {
        let next = self.state.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn dispatch(&self, actions: Vec<Action>) {
        for action in actions {
            let transport = Arc::clone(&self.transport);
            let completions = self.completions.clone();
            tokio::spawn(async move {
                if let Some(completion) = execute(transport.as_ref(), action).await {
                    // the session may be gone by now
                    let _ = completions.send(completion);
                }
            });
        }
    }
}

async fn execute<T: BleTransport>(transport: &T, action: Action) -> Option<Completion> {
    match action {
        Action::Scan { service_filter, timeout, allow_duplicates } => {
            debug!("Scanning...");
            transport
                .scan(&service_filter, timeout, allow_duplicates)
                .await
                .err()
                .map(|error| Completion::ScanFailed { error })
        }
        Action::Connect { role, handle, epoch } => {
            let result = transport.connect(&handle).await;
            Some(Completion::Connected { role, handle, epoch, result })
        }
        Action::DiscoverServices { role, handle, epoch } => {
            let result = transport.discover_services(&handle).await;
            Some(Completion::ServicesDiscovered { role, handle, epoch, result })
        }
        Action::Read { role, handle, epoch, service_id, characteristic_id } => {
            let result = transport.read(&handle, &service_id, &characteristic_id).await;
            Some(Completion::Read { role, handle, epoch, result })
        }
        Action::Write { role, handle, epoch, service_id, characteristic_id, value } => {
            let result = transport
                .write(&handle, &service_id, &characteristic_id, &[value])
                .await;
            Some(Completion::Written { role, handle, epoch, value, result })
        }
        Action::Disconnect { handle } => {
            if let Err(e) = transport.disconnect(&handle).await {
                warn!("disconnect from {handle} failed: {e}");
            }
            None
        }
    }
}
