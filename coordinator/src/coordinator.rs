//! Roster / session state machine.
//!
//! One [`Coordinator`] owns every piece of cross-device state: the device
//! map, the conductor slot, the session identifier, the synchronized-start
//! flag and the capture counter.  All of it sits behind a single mutex and
//! every broadcast is enqueued while that mutex is held, so each device
//! observes events in exactly the order they were produced.
//!
//! Sends never block: each device has an unbounded queue drained by its own
//! writer task (see `server.rs`).  A send to a device whose writer is gone
//! simply fails and is ignored; the sweeper removes such devices later.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use syncam_common::naming::{self, SessionIds};
use syncam_common::protocol::{AuxCapableDevice, CaptureEvent, ClientMessage, Role, ServerMessage};

/// Queue feeding one device's channel writer.
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

/// Countdown shape.
#[derive(Debug, Clone)]
pub struct Settings {
    pub countdown_ticks: u32,
    pub countdown_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            countdown_ticks: 3,
            countdown_interval: Duration::from_secs(1),
        }
    }
}

struct Device {
    role: Role,
    has_aux_light: bool,
    connected_at: DateTime<Utc>,
    /// Tie-break for equal `connected_at`.
    join_seq: u64,
    label: Option<String>,
    tx: Outbound,
}

struct Roster {
    devices: HashMap<String, Device>,
    conductor: Option<String>,
    session_id: String,
    sync_started: bool,
    counter: u32,
    next_join_seq: u64,
    aux_selected: Option<String>,
}

impl Roster {
    fn is_conductor(&self, device_id: &str) -> bool {
        self.conductor.as_deref() == Some(device_id)
    }

    /// Best-effort send; a closed queue is not an error here.
    fn send_to(&self, device_id: &str, msg: ServerMessage) -> bool {
        match self.devices.get(device_id) {
            Some(device) => {
                if device.tx.send(msg).is_err() {
                    debug!("Send to {device_id} skipped, channel closed");
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }

    fn broadcast(&self, msg: &ServerMessage) {
        for (id, device) in &self.devices {
            if device.tx.send(msg.clone()).is_err() {
                debug!("Broadcast to {id} skipped, channel closed");
            }
        }
    }

    fn broadcast_count(&self) {
        self.broadcast(&ServerMessage::DeviceCount {
            total_connected: self.devices.len(),
            session_id: self.session_id.clone(),
        });
    }

    fn role_assigned(&self, device_id: &str, role: Role) -> ServerMessage {
        ServerMessage::RoleAssigned {
            device_id: device_id.to_string(),
            role,
            session_id: self.session_id.clone(),
            sync_started: self.sync_started,
        }
    }

    fn aux_capable_list(&self) -> Vec<AuxCapableDevice> {
        let mut capable: Vec<(&String, &Device)> = self
            .devices
            .iter()
            .filter(|(_, d)| d.has_aux_light)
            .collect();
        capable.sort_by_key(|(_, d)| d.join_seq);
        capable
            .into_iter()
            .map(|(id, d)| AuxCapableDevice {
                device_id: id.clone(),
                role: d.role,
            })
            .collect()
    }

    fn send_aux_list_to_conductor(&self) {
        if let Some(conductor) = &self.conductor {
            self.send_to(
                conductor,
                ServerMessage::AuxCapableList {
                    devices: self.aux_capable_list(),
                },
            );
        }
    }

    /// Earliest connected device; join order breaks ties.
    fn promotion_candidate(&self) -> Option<String> {
        self.devices
            .iter()
            .min_by_key(|(_, d)| (d.connected_at, d.join_seq))
            .map(|(id, _)| id.clone())
    }
}

/// What a removal did to the roster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Removal {
    pub promoted: Option<String>,
    pub session_reset: bool,
}

/// Result of a synchronized-start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyStarted,
    NotConductor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub role: Role,
    pub has_aux_light: bool,
    pub connected_at: DateTime<Utc>,
    pub label: Option<String>,
}

/// Read-only copy of the roster for health checks and tests.
#[derive(Debug, Clone)]
pub struct RosterSnapshot {
    pub devices: Vec<DeviceSnapshot>,
    pub conductor: Option<String>,
    pub session_id: String,
    pub sync_started: bool,
    pub next_counter: u32,
    pub aux_selected: Option<String>,
}

/// The single authority over devices, roles, sessions and capture naming.
pub struct Coordinator {
    roster: Mutex<Roster>,
    session_ids: SessionIds,
    settings: Settings,
}

impl Coordinator {
    /// `counter` is the first capture counter to hand out, normally derived
    /// from storage by `LocalStore::resume_counter`.
    pub fn new(settings: Settings, counter: u32) -> Self {
        let session_ids = SessionIds::new();
        let session_id = session_ids.next();
        info!("Coordinator ready (session {session_id}, counter {counter})");
        Self {
            roster: Mutex::new(Roster {
                devices: HashMap::new(),
                conductor: None,
                session_id,
                sync_started: false,
                counter,
                next_join_seq: 0,
                aux_selected: None,
            }),
            session_ids,
            settings,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Roster> {
        // A panic while holding the lock cannot leave the roster half-written
        // in a way later callers care about; keep serving.
        self.roster.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── channel lifecycle ────────────────────────────────────────────────

    /// Register a freshly opened channel and assign its role.
    pub fn connect(&self, device_id: &str, tx: Outbound) -> Role {
        self.connect_at(device_id, tx, Utc::now())
    }

    pub fn connect_at(&self, device_id: &str, tx: Outbound, now: DateTime<Utc>) -> Role {
        let mut roster = self.lock();

        if roster.devices.contains_key(device_id) {
            warn!("Duplicate connect from {device_id}, replacing previous channel");
            self.remove_locked(&mut roster, device_id);
        }

        // check-and-set under the lock: first device without a conductor wins
        let role = if roster.conductor.is_none() {
            roster.conductor = Some(device_id.to_string());
            Role::Conductor
        } else {
            Role::Participant
        };

        let join_seq = roster.next_join_seq;
        roster.next_join_seq += 1;
        roster.devices.insert(
            device_id.to_string(),
            Device {
                role,
                has_aux_light: false,
                connected_at: now,
                join_seq,
                label: None,
                tx,
            },
        );

        info!(
            "Device {device_id} connected as {role} ({} total, session {})",
            roster.devices.len(),
            roster.session_id
        );

        let assigned = roster.role_assigned(device_id, role);
        roster.send_to(device_id, assigned);
        roster.broadcast_count();
        if role == Role::Conductor {
            roster.send_aux_list_to_conductor();
        }
        role
    }

    /// Remove a device whose channel closed.
    pub fn disconnect(&self, device_id: &str) -> Option<Removal> {
        let mut roster = self.lock();
        let removal = self.remove_locked(&mut roster, device_id)?;
        roster.broadcast_count();
        Some(removal)
    }

    /// Remove `device_id`, promote or reset as needed.  Does not broadcast
    /// the device count; callers do that once per batch.
    fn remove_locked(&self, roster: &mut Roster, device_id: &str) -> Option<Removal> {
        let device = roster.devices.remove(device_id)?;
        let mut removal = Removal::default();

        if roster.aux_selected.as_deref() == Some(device_id) {
            roster.aux_selected = None;
        }

        let was_conductor = roster.is_conductor(device_id);
        if was_conductor {
            roster.conductor = None;
        }

        info!(
            "Device {device_id} ({}) disconnected, {} remaining",
            device.role,
            roster.devices.len()
        );

        if roster.devices.is_empty() {
            let previous = std::mem::replace(&mut roster.session_id, self.session_ids.next());
            roster.sync_started = false;
            removal.session_reset = true;
            info!(
                "Roster empty, session {previous} reset to {} (next counter {})",
                roster.session_id, roster.counter
            );
            return Some(removal);
        }

        if was_conductor {
            if let Some(next) = roster.promotion_candidate() {
                if let Some(d) = roster.devices.get_mut(&next) {
                    d.role = Role::Conductor;
                }
                roster.conductor = Some(next.clone());
                info!("Promoted {next} to conductor");
                let assigned = roster.role_assigned(&next, Role::Conductor);
                roster.send_to(&next, assigned);
                roster.send_aux_list_to_conductor();
                removal.promoted = Some(next);
            }
        } else if device.has_aux_light {
            roster.send_aux_list_to_conductor();
        }

        Some(removal)
    }

    /// Drop devices whose channel writer is gone but whose disconnect was
    /// never reported.  Returns the number removed.
    pub fn sweep_stale(&self) -> usize {
        let mut roster = self.lock();
        let stale: Vec<String> = roster
            .devices
            .iter()
            .filter(|(_, d)| d.tx.is_closed())
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            self.remove_locked(&mut roster, id);
        }
        if !stale.is_empty() {
            info!("Swept {} stale device(s)", stale.len());
            roster.broadcast_count();
        }
        stale.len()
    }

    /// Run [`Self::sweep_stale`] every `every` until the task is aborted.
    pub async fn run_sweeper(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep_stale();
        }
    }

    // ── inbound messages ─────────────────────────────────────────────────

    /// Dispatch one decoded message from `device_id`.
    pub fn handle(self: &Arc<Self>, device_id: &str, msg: ClientMessage) {
        debug!("{} from {device_id}", msg.kind());
        match msg {
            ClientMessage::Join { label } => self.join(device_id, label),
            ClientMessage::RegisterAuxCapability { has_capability } => {
                self.register_aux_capability(device_id, has_capability)
            }
            ClientMessage::SelectAuxDevice { target_id } => {
                self.select_aux_device(device_id, target_id.as_deref());
            }
            ClientMessage::RequestSynchronizedStart => {
                self.request_synchronized_start(device_id);
            }
            ClientMessage::TriggerCapture => {
                self.trigger_capture(device_id);
            }
            ClientMessage::NotifyUploaded { filename } => self.notify_uploaded(device_id, &filename),
        }
    }

    /// Explicit hello: record the label and repeat the role information.
    pub fn join(&self, device_id: &str, label: Option<String>) {
        let mut roster = self.lock();
        let Some(device) = roster.devices.get_mut(device_id) else {
            return;
        };
        if label.is_some() {
            device.label = label;
        }
        let role = device.role;
        let assigned = roster.role_assigned(device_id, role);
        roster.send_to(device_id, assigned);
        roster.send_to(
            device_id,
            ServerMessage::DeviceCount {
                total_connected: roster.devices.len(),
                session_id: roster.session_id.clone(),
            },
        );
    }

    pub fn register_aux_capability(&self, device_id: &str, has_capability: bool) {
        let mut roster = self.lock();
        let Some(device) = roster.devices.get_mut(device_id) else {
            return;
        };
        device.has_aux_light = has_capability;
        debug!("Aux capability of {device_id}: {has_capability}");
        roster.send_aux_list_to_conductor();
    }

    /// Conductor picks the aux-light device (or clears the choice).
    /// Returns false if the request was not honored.
    pub fn select_aux_device(&self, requester: &str, target: Option<&str>) -> bool {
        let mut roster = self.lock();
        if !roster.is_conductor(requester) {
            debug!("select-aux-device from non-conductor {requester} ignored");
            return false;
        }

        roster.broadcast(&ServerMessage::AuxSelected { is_selected: false });
        roster.aux_selected = None;
        if let Some(target) = target {
            if roster.send_to(target, ServerMessage::AuxSelected { is_selected: true }) {
                roster.aux_selected = Some(target.to_string());
            }
        }
        info!("Aux light device selected: {:?}", roster.aux_selected);
        true
    }

    /// Start the countdown for this session.  The started flag flips under
    /// the lock before any tick is scheduled, so a second request can never
    /// produce a second countdown.
    pub fn request_synchronized_start(self: &Arc<Self>, requester: &str) -> StartOutcome {
        let session_id = {
            let mut roster = self.lock();
            if !roster.is_conductor(requester) {
                debug!("Synchronized start from non-conductor {requester} ignored");
                return StartOutcome::NotConductor;
            }
            if roster.sync_started {
                roster.send_to(
                    requester,
                    ServerMessage::Busy {
                        request: ClientMessage::RequestSynchronizedStart.kind().to_string(),
                    },
                );
                return StartOutcome::AlreadyStarted;
            }
            roster.sync_started = true;
            roster.session_id.clone()
        };

        info!(
            "Countdown started in session {session_id} ({} ticks)",
            self.settings.countdown_ticks
        );
        tokio::spawn(Arc::clone(self).run_countdown(session_id));
        StartOutcome::Started
    }

    async fn run_countdown(self: Arc<Self>, session_id: String) {
        let interval = self.settings.countdown_interval;
        for remaining in (1..=self.settings.countdown_ticks).rev() {
            if !self.broadcast_in_session(&session_id, ServerMessage::CountdownTick { remaining }) {
                return;
            }
            tokio::time::sleep(interval).await;
        }
        if self.broadcast_in_session(&session_id, ServerMessage::Go) {
            info!("Go in session {session_id}");
        }
    }

    /// Broadcast only if the session has not been reset meanwhile.
    fn broadcast_in_session(&self, session_id: &str, msg: ServerMessage) -> bool {
        let roster = self.lock();
        if roster.session_id != session_id {
            info!("Session {session_id} ended during countdown, aborting");
            return false;
        }
        roster.broadcast(&msg);
        true
    }

    /// Conductor trigger: mint the capture event and fan it out.
    pub fn trigger_capture(&self, requester: &str) -> Option<CaptureEvent> {
        self.trigger_capture_at(requester, Local::now())
    }

    pub fn trigger_capture_at(&self, requester: &str, now: DateTime<Local>) -> Option<CaptureEvent> {
        let mut roster = self.lock();
        if !roster.is_conductor(requester) {
            debug!("Trigger from non-conductor {requester} ignored");
            return None;
        }

        let logical_timestamp = now.timestamp_millis();
        let folder_id = naming::folder_id(roster.counter, &now, logical_timestamp);
        roster.counter = roster.counter.saturating_add(1);

        let event = CaptureEvent {
            logical_timestamp,
            session_id: roster.session_id.clone(),
            folder_id,
        };
        roster.broadcast(&ServerMessage::Capture(event.clone()));
        info!(
            "Capture {} (ts={}) broadcast to {} device(s)",
            event.folder_id,
            event.logical_timestamp,
            roster.devices.len()
        );
        Some(event)
    }

    pub fn notify_uploaded(&self, device_id: &str, filename: &str) {
        let roster = self.lock();
        let label = roster
            .devices
            .get(device_id)
            .and_then(|d| d.label.clone())
            .unwrap_or_default();
        info!("Upload reported by {device_id} ({label}): {filename}");
    }

    // ── inspection ───────────────────────────────────────────────────────

    pub fn snapshot(&self) -> RosterSnapshot {
        let roster = self.lock();
        let mut devices: Vec<(u64, DeviceSnapshot)> = roster
            .devices
            .iter()
            .map(|(id, d)| {
                (
                    d.join_seq,
                    DeviceSnapshot {
                        device_id: id.clone(),
                        role: d.role,
                        has_aux_light: d.has_aux_light,
                        connected_at: d.connected_at,
                        label: d.label.clone(),
                    },
                )
            })
            .collect();
        devices.sort_by_key(|(seq, _)| *seq);
        RosterSnapshot {
            devices: devices.into_iter().map(|(_, d)| d).collect(),
            conductor: roster.conductor.clone(),
            session_id: roster.session_id.clone(),
            sync_started: roster.sync_started,
            next_counter: roster.counter,
            aux_selected: roster.aux_selected.clone(),
        }
    }
}

// ─── tests ───────────────────────────────────────────────────────────────
