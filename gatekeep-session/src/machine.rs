//! Slot lifecycle state machine
//!
//! `SessionState` never talks to the radio. Every input (transport event,
//! poll tick, user command, transport completion) mutates the slots and
//! returns the transport requests to issue next. The runtime in `session.rs`
//! executes those requests and feeds their results back as `Completion`s.

use std::collections::HashSet;
use std::time::Duration;

use log::{debug, info, trace, warn};
use tokio::time::Instant;

use crate::{
    ConnectionState, GattCharacteristic, PeripheralHandle, PeripheralSlot, SessionError,
    SessionOptions, SlotConfig, SlotSnapshot, TransportError, TransportEvent,
};

/// Transport request emitted by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Scan {
        service_filter: Vec<String>,
        timeout: Duration,
        allow_duplicates: bool,
    },
    Connect {
        role: String,
        handle: PeripheralHandle,
        epoch: u64,
    },
    DiscoverServices {
        role: String,
        handle: PeripheralHandle,
        epoch: u64,
    },
    Read {
        role: String,
        handle: PeripheralHandle,
        epoch: u64,
        service_id: String,
        characteristic_id: String,
    },
    Write {
        role: String,
        handle: PeripheralHandle,
        epoch: u64,
        service_id: String,
        characteristic_id: String,
        value: u8,
    },
    Disconnect {
        handle: PeripheralHandle,
    },
}

/// Result of an `Action`, tagged with the slot, handle and connection epoch it
/// was issued for
#[derive(Debug)]
pub enum Completion {
    Connected {
        role: String,
        handle: PeripheralHandle,
        epoch: u64,
        result: Result<(), TransportError>,
    },
    ServicesDiscovered {
        role: String,
        handle: PeripheralHandle,
        epoch: u64,
        result: Result<Vec<GattCharacteristic>, TransportError>,
    },
    Read {
        role: String,
        handle: PeripheralHandle,
        epoch: u64,
        result: Result<Vec<u8>, TransportError>,
    },
    Written {
        role: String,
        handle: PeripheralHandle,
        epoch: u64,
        value: u8,
        result: Result<(), TransportError>,
    },
    ScanFailed {
        error: TransportError,
    },
}

pub struct SessionState {
    slots: Vec<PeripheralSlot>,
    options: SessionOptions,
    scan_active: bool,
    last_scan: Option<Instant>,
    stopped: bool,
}

impl SessionState {
    /// One `Disconnected` slot per config entry; roles must be unique
    pub fn new(slots: Vec<SlotConfig>, options: SessionOptions) -> Result<Self, SessionError> {
        let mut seen = HashSet::new();
        for slot in &slots {
            if !seen.insert(slot.role.as_str()) {
                return Err(SessionError::DuplicateRole(slot.role.clone()));
            }
        }

        Ok(Self {
            slots: slots.into_iter().map(PeripheralSlot::new).collect(),
            options,
            scan_active: false,
            last_scan: None,
            stopped: false,
        })
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn slots(&self) -> &[PeripheralSlot] {
        &self.slots
    }

    pub fn slot(&self, role: &str) -> Option<&PeripheralSlot> {
        self.slots.iter().find(|s| s.role() == role)
    }

    fn slot_mut(&mut self, role: &str) -> Option<&mut PeripheralSlot> {
        self.slots.iter_mut().find(|s| s.role() == role)
    }

    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        self.slots.iter().map(PeripheralSlot::snapshot).collect()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Begin scanning for the configured peripherals
    pub fn start(&mut self, now: Instant) -> Vec<Action> {
        info!(
            "Starting session with {} slot(s): {}",
            self.slots.len(),
            self.slots.iter().map(|s| s.role()).collect::<Vec<_>>().join(", ")
        );
        vec![self.scan(now)]
    }

    fn scan(&mut self, now: Instant) -> Action {
        self.scan_active = true;
        self.last_scan = Some(now);
        Action::Scan {
            service_filter: self.options.service_filter.clone(),
            timeout: self.options.scan_window,
            allow_duplicates: self.options.allow_duplicates,
        }
    }

    fn all_ready(&self) -> bool {
        self.slots.iter().all(PeripheralSlot::is_ready)
    }

    pub fn handle_event(&mut self, event: TransportEvent, now: Instant) -> Vec<Action> {
        if self.stopped {
            return Vec::new();
        }

        match event {
            TransportEvent::PeripheralDiscovered { handle, advertised_name } => {
                self.on_discovered(handle, &advertised_name, now)
            }
            TransportEvent::PeripheralDisconnected { handle } => self.on_disconnected(&handle, now),
            TransportEvent::ScanStopped => self.on_scan_stopped(now),
        }
    }

    /// A peripheral showed up; the first idle slot advertising that name claims it
    pub fn on_discovered(
        &mut self,
        handle: PeripheralHandle,
        advertised_name: &str,
        now: Instant,
    ) -> Vec<Action> {
        if self.slots.iter().any(|s| s.holds(&handle)) {
            trace!("{handle} already claimed, ignoring discovery");
            return Vec::new();
        }

        let Some(slot) = self.slots.iter_mut().find(|s| {
            s.state() == ConnectionState::Disconnected && s.config.advertised_name == advertised_name
        }) else {
            return Vec::new();
        };

        info!("{}: found {advertised_name:?} ({handle}), connecting", slot.role());
        slot.begin_connect(handle.clone(), now);

        vec![Action::Connect {
            role: slot.role().to_string(),
            handle,
            epoch: slot.epoch(),
        }]
    }

    /// The link to `handle` dropped; free its slot and look for it again
    pub fn on_disconnected(&mut self, handle: &PeripheralHandle, now: Instant) -> Vec<Action> {
        let Some(slot) = self.slots.iter_mut().find(|s| s.holds(handle)) else {
            debug!("disconnect from unclaimed peripheral {handle}");
            return Vec::new();
        };

        info!("{}: disconnected, continuing to scan", slot.role());
        slot.reset();
        vec![self.scan(now)]
    }

    pub fn on_scan_stopped(&mut self, now: Instant) -> Vec<Action> {
        self.scan_active = false;
        if self.all_ready() {
            debug!("scan stopped, all slots ready");
            return Vec::new();
        }
        debug!("scan stopped, rescanning");
        vec![self.scan(now)]
    }

    /// Periodic tick: give up on stuck connects, then read every ready slot
    pub fn poll(&mut self, now: Instant) -> Vec<Action> {
        if self.stopped {
            return Vec::new();
        }

        let mut actions = Vec::new();
        let timeout = self.options.connect_timeout;

        for slot in &mut self.slots {
            let pending = matches!(
                slot.state(),
                ConnectionState::Connecting | ConnectionState::Connected
            );
            let expired = slot
                .since()
                .is_some_and(|since| now.saturating_duration_since(since) >= timeout);

            if pending && expired {
                warn!("{}: no usable connection after {timeout:?}, giving up", slot.role());
                if let Some(handle) = slot.reset() {
                    actions.push(Action::Disconnect { handle });
                }
            }
        }

        // the scan chain died (transport refused a scan): restart it once per window
        let scan_due = self
            .last_scan
            .is_none_or(|at| now.saturating_duration_since(at) >= self.options.scan_window);
        if !self.scan_active && !self.all_ready() && scan_due {
            debug!("no scan running, restarting");
            actions.push(self.scan(now));
        }

        for slot in &mut self.slots {
            if !slot.is_ready() || slot.read_in_flight() {
                continue;
            }
            let Some(handle) = slot.handle().cloned() else {
                continue;
            };
            slot.set_read_in_flight(true);
            actions.push(Action::Read {
                role: slot.role().to_string(),
                handle,
                epoch: slot.epoch(),
                service_id: slot.config.service_id.clone(),
                characteristic_id: slot.config.characteristic_id.clone(),
            });
        }

        actions
    }

    /// Write a single byte to the slot's characteristic
    pub fn write(&mut self, role: &str, value: u8) -> Result<Action, SessionError> {
        if self.stopped {
            return Err(SessionError::Closed);
        }

        let slot = self
            .slot_mut(role)
            .ok_or_else(|| SessionError::UnknownRole(role.to_string()))?;

        let handle = match (slot.state(), slot.handle()) {
            (ConnectionState::ServiceReady, Some(handle)) => handle.clone(),
            _ => return Err(SessionError::NotReady(role.to_string())),
        };

        Ok(Action::Write {
            role: role.to_string(),
            handle,
            epoch: slot.epoch(),
            service_id: slot.config.service_id.clone(),
            characteristic_id: slot.config.characteristic_id.clone(),
            value,
        })
    }

    /// Apply a transport result, discarding it if its slot has moved on
    pub fn on_completion(&mut self, completion: Completion, now: Instant) -> Vec<Action> {
        if self.stopped {
            return Vec::new();
        }

        match completion {
            Completion::Connected { role, handle, epoch, result } => {
                self.on_connected(&role, handle, epoch, result)
            }
            Completion::ServicesDiscovered { role, handle, epoch, result } => {
                self.on_services(&role, handle, epoch, result)
            }
            Completion::Read { role, handle, epoch, result } => {
                self.on_read(&role, &handle, epoch, result);
                Vec::new()
            }
            Completion::Written { role, value, result, .. } => {
                match result {
                    Ok(()) => info!("{role}: wrote {value}"),
                    Err(e) => warn!("{role}: write of {value} failed: {e}"),
                }
                Vec::new()
            }
            Completion::ScanFailed { error } => {
                warn!("scan request failed: {error}");
                self.scan_active = false;
                self.last_scan = Some(now);
                Vec::new()
            }
        }
    }

    fn on_connected(
        &mut self,
        role: &str,
        handle: PeripheralHandle,
        epoch: u64,
        result: Result<(), TransportError>,
    ) -> Vec<Action> {
        let Some(slot) = self.slot_mut(role) else {
            return Vec::new();
        };

        if !slot.is_link(&handle, epoch) || slot.state() != ConnectionState::Connecting {
            debug!("{role}: discarding stale connect result for {handle}");
            // the link came up after we stopped waiting for it; a newer
            // connect to the same handle keeps it
            return match result {
                Ok(()) if !slot.holds(&handle) => vec![Action::Disconnect { handle }],
                _ => Vec::new(),
            };
        }

        match result {
            Ok(()) => {
                info!("{role}: connected, checking characteristic");
                slot.mark_connected();
                vec![Action::DiscoverServices {
                    role: role.to_string(),
                    handle,
                    epoch,
                }]
            }
            Err(e) => {
                warn!("{role}: connect to {handle} failed: {e}");
                slot.reset();
                Vec::new()
            }
        }
    }

    fn on_services(
        &mut self,
        role: &str,
        handle: PeripheralHandle,
        epoch: u64,
        result: Result<Vec<GattCharacteristic>, TransportError>,
    ) -> Vec<Action> {
        let Some(slot) = self.slot_mut(role) else {
            return Vec::new();
        };

        if !slot.is_link(&handle, epoch) || slot.state() != ConnectionState::Connected {
            debug!("{role}: discarding stale service discovery for {handle}");
            return Vec::new();
        }

        let found = match result {
            Ok(characteristics) => characteristics
                .iter()
                .any(|c| c.matches(&slot.config.service_id, &slot.config.characteristic_id)),
            Err(e) => {
                warn!("{role}: service discovery failed: {e}");
                false
            }
        };

        if found {
            info!("{role}: characteristic found, ready");
            slot.mark_ready();
            return Vec::new();
        }

        warn!(
            "{role}: {}/{} not offered by {handle}, disconnecting",
            slot.config.service_id, slot.config.characteristic_id
        );
        slot.reset();
        vec![Action::Disconnect { handle }]
    }

    fn on_read(
        &mut self,
        role: &str,
        handle: &PeripheralHandle,
        epoch: u64,
        result: Result<Vec<u8>, TransportError>,
    ) {
        let Some(slot) = self.slot_mut(role) else {
            return;
        };

        // a read from before a reconnect carries the old epoch, even for the same handle
        if !slot.is_link(handle, epoch) {
            debug!("{role}: discarding stale read from {handle}");
            return;
        }
        slot.set_read_in_flight(false);

        if !slot.is_ready() {
            return;
        }

        match result {
            Ok(bytes) => match bytes.first() {
                Some(&value) => {
                    if slot.last_value() != Some(value) {
                        debug!("{role}: value {value}");
                    }
                    slot.set_last_value(value);
                }
                None => warn!("{role}: read returned no data"),
            },
            Err(e) => warn!("{role}: read failed: {e}"),
        }
    }

    /// Stop reacting to anything and release every held peripheral
    pub fn shutdown(&mut self) -> Vec<Action> {
        self.stopped = true;
        self.slots
            .iter_mut()
            .filter_map(PeripheralSlot::reset)
            .map(|handle| Action::Disconnect { handle })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str) -> PeripheralHandle {
        PeripheralHandle::new(id)
    }

    fn door() -> SlotConfig {
        SlotConfig::new("door", "Door Component", "180A", "2A57")
    }

    fn user() -> SlotConfig {
        SlotConfig::new("user", "User Component", "180A", "2A58")
    }

    fn state(slots: Vec<SlotConfig>) -> SessionState {
        SessionState::new(slots, SessionOptions::default()).unwrap()
    }

    fn assert_consistent(s: &SessionState) {
        for slot in s.slots() {
            assert!(slot.is_consistent(), "{} inconsistent", slot.role());
        }
    }

    fn discovered(id: &str, name: &str) -> TransportEvent {
        TransportEvent::PeripheralDiscovered {
            handle: handle(id),
            advertised_name: name.to_string(),
        }
    }

    fn connected(role: &str, id: &str, epoch: u64) -> Completion {
        Completion::Connected {
            role: role.to_string(),
            handle: handle(id),
            epoch,
            result: Ok(()),
        }
    }

    fn services(role: &str, id: &str, epoch: u64, chars: Vec<GattCharacteristic>) -> Completion {
        Completion::ServicesDiscovered {
            role: role.to_string(),
            handle: handle(id),
            epoch,
            result: Ok(chars),
        }
    }

    /// Drive `role` to ServiceReady on peripheral `id`
    fn make_ready(s: &mut SessionState, role: &str, id: &str, name: &str, chr: &str) {
        let now = Instant::now();
        s.handle_event(discovered(id, name), now);
        let epoch = s.slot(role).unwrap().epoch();
        s.on_completion(connected(role, id, epoch), now);
        s.on_completion(services(role, id, epoch, vec![GattCharacteristic::new("180a", chr)]), now);
        assert!(s.slot(role).unwrap().is_ready());
    }

    fn count_reads(actions: &[Action]) -> usize {
        actions.iter().filter(|a| matches!(a, Action::Read { .. })).count()
    }

    #[test]
    fn start_requests_scan() {
        let mut s = state(vec![door()]);
        let actions = s.start(Instant::now());
        assert!(matches!(actions.as_slice(), [Action::Scan { .. }]));
        assert_eq!(s.slot("door").unwrap().state(), ConnectionState::Disconnected);
    }

    #[test]
    fn duplicate_roles_rejected() {
        let result = SessionState::new(vec![door(), door()], SessionOptions::default());
        assert!(matches!(result, Err(SessionError::DuplicateRole(r)) if r == "door"));
    }

    #[test]
    fn door_lifecycle() {
        let mut s = state(vec![door()]);
        let now = Instant::now();
        s.start(now);

        let actions = s.handle_event(discovered("p1", "Door Component"), now);
        assert_eq!(
            actions,
            vec![Action::Connect { role: "door".into(), handle: handle("p1"), epoch: 1 }]
        );
        assert_eq!(s.slot("door").unwrap().state(), ConnectionState::Connecting);
        assert_consistent(&s);

        let actions = s.on_completion(connected("door", "p1", 1), now);
        assert_eq!(
            actions,
            vec![Action::DiscoverServices { role: "door".into(), handle: handle("p1"), epoch: 1 }]
        );
        assert_eq!(s.slot("door").unwrap().state(), ConnectionState::Connected);
        assert_consistent(&s);

        let chars = vec![
            GattCharacteristic::new("1800", "2A00"),
            GattCharacteristic::new("0000180a-0000-1000-8000-00805f9b34fb", "2a57"),
        ];
        assert!(s.on_completion(services("door", "p1", 1, chars), now).is_empty());
        assert_eq!(s.slot("door").unwrap().state(), ConnectionState::ServiceReady);
        assert_consistent(&s);

        let actions = s.handle_event(
            TransportEvent::PeripheralDisconnected { handle: handle("p1") },
            now,
        );
        assert!(matches!(actions.as_slice(), [Action::Scan { .. }]));
        let slot = s.slot("door").unwrap();
        assert_eq!(slot.state(), ConnectionState::Disconnected);
        assert!(slot.handle().is_none());
        assert_consistent(&s);
    }

    #[test]
    fn unmatched_name_changes_nothing() {
        let mut s = state(vec![door(), user()]);
        let before = s.snapshot();
        let actions = s.handle_event(discovered("p9", "Someone's Headphones"), Instant::now());
        assert!(actions.is_empty());
        assert_eq!(s.snapshot(), before);
    }

    #[test]
    fn name_match_is_case_sensitive() {
        let mut s = state(vec![door()]);
        let actions = s.handle_event(discovered("p1", "door component"), Instant::now());
        assert!(actions.is_empty());
    }

    #[test]
    fn claimed_handle_is_not_connected_twice() {
        let mut s = state(vec![door()]);
        let now = Instant::now();
        assert_eq!(s.handle_event(discovered("p1", "Door Component"), now).len(), 1);
        assert!(s.handle_event(discovered("p1", "Door Component"), now).is_empty());
    }

    #[test]
    fn one_peripheral_fills_one_slot() {
        let mut a = door();
        let mut b = user();
        a.advertised_name = "Shared".into();
        b.advertised_name = "Shared".into();
        let mut s = state(vec![a, b]);
        let now = Instant::now();

        let actions = s.handle_event(discovered("p1", "Shared"), now);
        assert_eq!(actions.len(), 1);
        assert_eq!(s.slot("user").unwrap().state(), ConnectionState::Disconnected);

        let actions = s.handle_event(discovered("p2", "Shared"), now);
        assert_eq!(
            actions,
            vec![Action::Connect { role: "user".into(), handle: handle("p2"), epoch: 1 }]
        );
    }

    #[test]
    fn disconnect_from_connecting() {
        let mut s = state(vec![door()]);
        let now = Instant::now();
        s.handle_event(discovered("p1", "Door Component"), now);
        s.handle_event(TransportEvent::PeripheralDisconnected { handle: handle("p1") }, now);
        assert_eq!(s.slot("door").unwrap().state(), ConnectionState::Disconnected);
        assert_consistent(&s);
    }

    #[test]
    fn disconnect_only_affects_owning_slot() {
        let mut s = state(vec![door(), user()]);
        make_ready(&mut s, "door", "p1", "Door Component", "2A57");
        make_ready(&mut s, "user", "p2", "User Component", "2A58");

        s.handle_event(
            TransportEvent::PeripheralDisconnected { handle: handle("p1") },
            Instant::now(),
        );
        assert_eq!(s.slot("door").unwrap().state(), ConnectionState::Disconnected);
        let user = s.slot("user").unwrap();
        assert_eq!(user.state(), ConnectionState::ServiceReady);
        assert_eq!(user.handle(), Some(&handle("p2")));
        assert_consistent(&s);
    }

    #[test]
    fn unknown_disconnect_is_ignored() {
        let mut s = state(vec![door()]);
        make_ready(&mut s, "door", "p1", "Door Component", "2A57");
        let actions = s.handle_event(
            TransportEvent::PeripheralDisconnected { handle: handle("p7") },
            Instant::now(),
        );
        assert!(actions.is_empty());
        assert!(s.slot("door").unwrap().is_ready());
    }

    #[test]
    fn connect_failure_returns_to_disconnected() {
        let mut s = state(vec![door()]);
        let now = Instant::now();
        s.handle_event(discovered("p1", "Door Component"), now);
        let actions = s.on_completion(
            Completion::Connected {
                role: "door".into(),
                handle: handle("p1"),
                epoch: 1,
                result: Err(TransportError::Backend("le-connection-abort".into())),
            },
            now,
        );
        assert!(actions.is_empty());
        assert_eq!(s.slot("door").unwrap().state(), ConnectionState::Disconnected);
        assert_consistent(&s);

        // the next discovery retries
        assert_eq!(s.handle_event(discovered("p1", "Door Component"), now).len(), 1);
    }

    #[test]
    fn missing_characteristic_disconnects() {
        let mut s = state(vec![door()]);
        let now = Instant::now();
        s.handle_event(discovered("p1", "Door Component"), now);
        s.on_completion(connected("door", "p1", 1), now);
        let actions = s.on_completion(
            services("door", "p1", 1, vec![GattCharacteristic::new("180A", "2A99")]),
            now,
        );
        assert_eq!(actions, vec![Action::Disconnect { handle: handle("p1") }]);
        assert_eq!(s.slot("door").unwrap().state(), ConnectionState::Disconnected);
        assert_consistent(&s);
    }

    #[test]
    fn stuck_connect_times_out() {
        let mut s = state(vec![door()]);
        let now = Instant::now();
        s.start(now);
        s.handle_event(discovered("p1", "Door Component"), now);

        let timeout = s.options().connect_timeout;
        assert!(s.poll(now + timeout / 2).is_empty());

        let actions = s.poll(now + timeout);
        assert!(actions.contains(&Action::Disconnect { handle: handle("p1") }));
        assert_eq!(s.slot("door").unwrap().state(), ConnectionState::Disconnected);
        assert_consistent(&s);

        // a late connect success is torn down rather than applied
        let actions = s.on_completion(connected("door", "p1", 1), now + timeout);
        assert_eq!(actions, vec![Action::Disconnect { handle: handle("p1") }]);
        assert_eq!(s.slot("door").unwrap().state(), ConnectionState::Disconnected);
    }

    #[test]
    fn poll_reads_only_ready_slots() {
        let mut s = state(vec![door(), user()]);
        let now = Instant::now();
        s.start(now);
        make_ready(&mut s, "door", "p1", "Door Component", "2A57");
        s.handle_event(discovered("p2", "User Component"), now);

        let actions = s.poll(now);
        assert_eq!(count_reads(&actions), 1);
        assert!(actions.iter().all(|a| match a {
            Action::Read { role, .. } => role == "door",
            _ => true,
        }));
    }

    #[test]
    fn poll_does_not_stack_reads() {
        let mut s = state(vec![door()]);
        let now = Instant::now();
        make_ready(&mut s, "door", "p1", "Door Component", "2A57");

        assert_eq!(count_reads(&s.poll(now)), 1);
        assert_eq!(count_reads(&s.poll(now)), 0);

        s.on_completion(
            Completion::Read { role: "door".into(), handle: handle("p1"), epoch: 1, result: Ok(vec![1]) },
            now,
        );
        assert_eq!(s.slot("door").unwrap().last_value(), Some(1));
        assert_eq!(count_reads(&s.poll(now)), 1);
    }

    #[test]
    fn read_failure_keeps_last_value() {
        let mut s = state(vec![door()]);
        let now = Instant::now();
        make_ready(&mut s, "door", "p1", "Door Component", "2A57");

        s.poll(now);
        s.on_completion(
            Completion::Read { role: "door".into(), handle: handle("p1"), epoch: 1, result: Ok(vec![0]) },
            now,
        );
        s.poll(now);
        s.on_completion(
            Completion::Read {
                role: "door".into(),
                handle: handle("p1"),
                epoch: 1,
                result: Err(TransportError::Backend("timeout".into())),
            },
            now,
        );
        assert_eq!(s.slot("door").unwrap().last_value(), Some(0));
        assert!(s.slot("door").unwrap().is_ready());
    }

    #[test]
    fn stale_read_is_discarded() {
        let mut s = state(vec![door()]);
        let now = Instant::now();
        make_ready(&mut s, "door", "p1", "Door Component", "2A57");
        s.poll(now);

        s.handle_event(TransportEvent::PeripheralDisconnected { handle: handle("p1") }, now);
        make_ready(&mut s, "door", "p2", "Door Component", "2A57");

        s.on_completion(
            Completion::Read { role: "door".into(), handle: handle("p1"), epoch: 1, result: Ok(vec![1]) },
            now,
        );
        assert_eq!(s.slot("door").unwrap().last_value(), None);
    }

    #[test]
    fn read_from_previous_link_is_discarded_after_reconnect() {
        let mut s = state(vec![door()]);
        let now = Instant::now();
        make_ready(&mut s, "door", "p1", "Door Component", "2A57");
        let old = s.slot("door").unwrap().epoch();
        assert_eq!(count_reads(&s.poll(now)), 1);

        // same peripheral comes back under the same handle
        s.handle_event(TransportEvent::PeripheralDisconnected { handle: handle("p1") }, now);
        make_ready(&mut s, "door", "p1", "Door Component", "2A57");
        assert_ne!(s.slot("door").unwrap().epoch(), old);
        assert_eq!(count_reads(&s.poll(now)), 1);

        s.on_completion(
            Completion::Read { role: "door".into(), handle: handle("p1"), epoch: old, result: Ok(vec![7]) },
            now,
        );
        assert_eq!(s.slot("door").unwrap().last_value(), None);
        // the read of the new link is still outstanding
        assert_eq!(count_reads(&s.poll(now)), 0);
    }

    #[test]
    fn connect_result_from_previous_link_is_ignored() {
        let mut s = state(vec![door()]);
        let now = Instant::now();
        s.handle_event(discovered("p1", "Door Component"), now);
        s.handle_event(TransportEvent::PeripheralDisconnected { handle: handle("p1") }, now);
        s.handle_event(discovered("p1", "Door Component"), now);

        // the first connect finishing must neither advance nor tear down the second
        assert!(s.on_completion(connected("door", "p1", 1), now).is_empty());
        assert_eq!(s.slot("door").unwrap().state(), ConnectionState::Connecting);

        let actions = s.on_completion(connected("door", "p1", 2), now);
        assert_eq!(
            actions,
            vec![Action::DiscoverServices { role: "door".into(), handle: handle("p1"), epoch: 2 }]
        );
    }

    #[test]
    fn write_when_ready() {
        let mut s = state(vec![door()]);
        make_ready(&mut s, "door", "p1", "Door Component", "2A57");
        let action = s.write("door", 1).unwrap();
        assert_eq!(
            action,
            Action::Write {
                role: "door".into(),
                handle: handle("p1"),
                epoch: 1,
                service_id: "180A".into(),
                characteristic_id: "2A57".into(),
                value: 1,
            }
        );
    }

    #[test]
    fn write_when_not_ready() {
        let mut s = state(vec![door()]);
        assert!(matches!(s.write("door", 1), Err(SessionError::NotReady(r)) if r == "door"));
        s.handle_event(discovered("p1", "Door Component"), Instant::now());
        assert!(matches!(s.write("door", 0), Err(SessionError::NotReady(_))));
        assert!(matches!(s.write("garage", 0), Err(SessionError::UnknownRole(_))));
    }

    #[test]
    fn scan_stopped_rescans_until_all_ready() {
        let mut s = state(vec![door()]);
        let now = Instant::now();
        s.start(now);
        assert!(matches!(s.on_scan_stopped(now).as_slice(), [Action::Scan { .. }]));

        make_ready(&mut s, "door", "p1", "Door Component", "2A57");
        assert!(s.on_scan_stopped(now).is_empty());
    }

    #[test]
    fn failed_scan_is_restarted_by_poll() {
        let mut s = state(vec![door()]);
        let now = Instant::now();
        s.start(now);
        s.on_completion(
            Completion::ScanFailed { error: TransportError::Backend("busy".into()) },
            now,
        );

        let window = s.options().scan_window;
        assert!(s.poll(now).is_empty());
        assert!(matches!(s.poll(now + window).as_slice(), [Action::Scan { .. }]));
    }

    #[test]
    fn shutdown_disconnects_held_peripherals() {
        let mut s = state(vec![door(), user()]);
        let now = Instant::now();
        make_ready(&mut s, "door", "p1", "Door Component", "2A57");
        s.handle_event(discovered("p2", "User Component"), now);

        let mut actions = s.shutdown();
        actions.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
        assert_eq!(
            actions,
            vec![
                Action::Disconnect { handle: handle("p1") },
                Action::Disconnect { handle: handle("p2") },
            ]
        );
        assert_consistent(&s);
        assert!(s.handle_event(discovered("p3", "Door Component"), now).is_empty());
        assert!(s.poll(now).is_empty());
        assert!(matches!(s.write("door", 1), Err(SessionError::Closed)));
    }
}
