//! Device-side reaction to coordinator events.
//!
//! [`DeviceAgent`] owns the rolling buffer and the uploader.  Inbound
//! [`ServerMessage`]s update a local view of the session and drive the
//! buffer; a capture event spawns one capture task so the channel keeps
//! being served while the marked segment is awaited.  At most one capture
//! is in flight per device; a second one is answered with "busy".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use syncam_common::naming;
use syncam_common::protocol::{
    AuxCapableDevice, CaptureEvent, ClientMessage, Role, SegmentMetadata, ServerMessage,
};

use crate::buffer::{BufferState, RollingBuffer};
use crate::error::CaptureError;
use crate::source::CaptureSource;
use crate::upload::Uploader;

/// User-visible state line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentStatus {
    Connecting,
    Waiting,
    CountingDown(u32),
    /// Buffer running, first segment not finalized yet.
    Recording,
    Ready,
    Saving,
    Saved(String),
    UploadFailed,
    NotReady,
    Busy,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => f.write_str("connecting"),
            Self::Waiting => f.write_str("waiting"),
            Self::CountingDown(n) => write!(f, "counting down {n}"),
            Self::Recording => f.write_str("recording"),
            Self::Ready => f.write_str("ready"),
            Self::Saving => f.write_str("saving"),
            Self::Saved(name) => write!(f, "saved {name}"),
            Self::UploadFailed => f.write_str("upload failed — retrying buffer"),
            Self::NotReady => f.write_str("not ready yet"),
            Self::Busy => f.write_str("busy"),
        }
    }
}

impl AgentStatus {
    /// States that simply mirror the buffer and may be replaced whenever
    /// the buffer changes.
    fn is_idle(&self) -> bool {
        matches!(
            self,
            Self::Waiting | Self::Recording | Self::Ready | Self::Saved(_) | Self::NotReady | Self::Busy
        )
    }
}

/// What this device currently knows about the session.
#[derive(Debug, Clone, Default)]
pub struct SessionView {
    pub device_id: Option<String>,
    pub role: Option<Role>,
    pub session_id: Option<String>,
    pub total_connected: usize,
    pub sync_started: bool,
    pub aux_selected: bool,
    /// Conductor only.
    pub aux_capable: Vec<AuxCapableDevice>,
}

impl SessionView {
    pub fn is_conductor(&self) -> bool {
        self.role == Some(Role::Conductor)
    }

    /// Operator status line.  The conductor also sees the devices a
    /// `select` can target.
    pub fn summary(&self, status: &AgentStatus) -> String {
        let mut line = format!(
            "{} | {} device(s) | {status}",
            self.role.map_or("unassigned", |r| r.as_str()),
            self.total_connected
        );
        if self.is_conductor() {
            line.push_str(" | aux: ");
            line.push_str(&aux_list(&self.aux_capable));
        }
        line
    }
}

fn aux_list(devices: &[AuxCapableDevice]) -> String {
    if devices.is_empty() {
        return "none".to_string();
    }
    devices
        .iter()
        .map(|d| format!("{} ({})", d.device_id, d.role))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub label: Option<String>,
    pub has_aux_light: bool,
    pub light_pulse: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            label: None,
            has_aux_light: false,
            light_pulse: Duration::from_millis(500),
        }
    }
}

pub enum CaptureOutcome {
    Started(JoinHandle<Result<String, CaptureError>>),
    Busy,
}

pub struct DeviceAgent<S: CaptureSource, U: Uploader> {
    buffer: RollingBuffer<S>,
    uploader: U,
    settings: AgentSettings,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    session: Mutex<SessionView>,
    status: watch::Sender<AgentStatus>,
    in_flight: AtomicBool,
    capture_cancel: Mutex<CancellationToken>,
}

impl<S: CaptureSource, U: Uploader> DeviceAgent<S, U> {
    pub fn new(
        buffer: RollingBuffer<S>,
        uploader: U,
        settings: AgentSettings,
        outbound: mpsc::UnboundedSender<ClientMessage>,
    ) -> Self {
        Self {
            buffer,
            uploader,
            settings,
            outbound,
            session: Mutex::new(SessionView::default()),
            status: watch::Sender::new(AgentStatus::Connecting),
            in_flight: AtomicBool::new(false),
            capture_cancel: Mutex::new(CancellationToken::new()),
        }
    }

    fn view(&self) -> MutexGuard<'_, SessionView> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn session(&self) -> SessionView {
        self.view().clone()
    }

    pub fn buffer(&self) -> &RollingBuffer<S> {
        &self.buffer
    }

    pub fn status(&self) -> AgentStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<AgentStatus> {
        self.status.subscribe()
    }

    pub fn capture_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: AgentStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            info!("Status: {status}");
            *current = status;
            true
        });
    }

    /// Status derived from the buffer when nothing else is going on.
    fn idle_status(&self) -> AgentStatus {
        match self.buffer.state() {
            BufferState::Stopped => AgentStatus::Waiting,
            BufferState::Filling => AgentStatus::Recording,
            BufferState::Ready | BufferState::AwaitingMarkedSegment => AgentStatus::Ready,
        }
    }

    /// Re-derive an idle status after a buffer transition.  A failure
    /// notice stays up until the rebuilt buffer is ready again.
    pub fn refresh_status(&self) {
        let replaceable = {
            let current = self.status.borrow();
            current.is_idle()
                || (*current == AgentStatus::UploadFailed
                    && self.buffer.state() == BufferState::Ready)
        };
        if replaceable {
            self.set_status(self.idle_status());
        }
    }

    /// Follow buffer state changes until `shutdown`.
    pub async fn follow_buffer(self: Arc<Self>, shutdown: CancellationToken) {
        let mut states = self.buffer.subscribe_state();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.refresh_status();
                }
            }
        }
    }

    fn send(&self, msg: ClientMessage) -> bool {
        let kind = msg.kind();
        if self.outbound.send(msg).is_err() {
            debug!("Outbound queue closed, dropping {kind}");
            return false;
        }
        true
    }

    // ── connection lifecycle ─────────────────────────────────────────────

    /// Frames sent on every (re)connect, before anything else.
    pub fn hello(&self) -> Vec<ClientMessage> {
        vec![
            ClientMessage::Join {
                label: self.settings.label.clone(),
            },
            ClientMessage::RegisterAuxCapability {
                has_capability: self.settings.has_aux_light,
            },
        ]
    }

    /// The channel dropped: abandon any capture wait.  The buffer keeps
    /// running so a quick reconnect into the same session loses nothing.
    pub fn on_disconnected(&self) {
        self.cancel_capture();
        {
            let mut view = self.view();
            view.device_id = None;
            view.role = None;
            view.aux_selected = false;
            view.aux_capable.clear();
        }
        self.set_status(AgentStatus::Connecting);
    }

    /// Abandon the capture wait in flight, if any.  Later captures get a
    /// fresh token.
    fn cancel_capture(&self) {
        let token = {
            let mut cancel = self.capture_cancel.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *cancel, CancellationToken::new())
        };
        token.cancel();
    }

    // ── inbound events ───────────────────────────────────────────────────

    pub async fn handle(self: &Arc<Self>, msg: ServerMessage) {
        match msg {
            ServerMessage::RoleAssigned {
                device_id,
                role,
                session_id,
                sync_started,
            } => self.on_role_assigned(device_id, role, session_id, sync_started).await,
            ServerMessage::DeviceCount {
                total_connected, ..
            } => {
                self.view().total_connected = total_connected;
                debug!("{total_connected} device(s) connected");
            }
            ServerMessage::AuxCapableList { devices } => {
                info!("Aux-capable devices: {}", aux_list(&devices));
                self.view().aux_capable = devices;
            }
            ServerMessage::AuxSelected { is_selected } => {
                info!("Aux light {}", if is_selected { "selected" } else { "released" });
                self.view().aux_selected = is_selected;
            }
            ServerMessage::CountdownTick { remaining } => {
                self.set_status(AgentStatus::CountingDown(remaining));
            }
            ServerMessage::Go => {
                self.view().sync_started = true;
                info!("Go: starting rolling buffer");
                self.buffer.start();
                self.set_status(self.idle_status());
            }
            ServerMessage::Capture(event) => {
                if let CaptureOutcome::Busy = self.on_capture(event) {
                    warn!("Capture ignored: busy");
                }
            }
            ServerMessage::Busy { request } => {
                warn!("Coordinator rejected {request}: busy");
                if self.status.borrow().is_idle() {
                    self.set_status(AgentStatus::Busy);
                }
            }
        }
    }

    async fn on_role_assigned(
        &self,
        device_id: String,
        role: Role,
        session_id: String,
        sync_started: bool,
    ) {
        let new_session = {
            let mut view = self.view();
            let new_session = view.session_id.as_deref() != Some(session_id.as_str());
            view.device_id = Some(device_id.clone());
            view.role = Some(role);
            view.session_id = Some(session_id.clone());
            view.sync_started = sync_started;
            new_session
        };
        info!("Assigned {role} as {device_id} in session {session_id}");

        if sync_started {
            self.buffer.start();
        } else if new_session {
            // the old session's capture has nowhere to go
            self.cancel_capture();
            if self.buffer.is_running() {
                info!("New session has not started yet, stopping buffer");
                self.buffer.stop().await;
            }
        }
        self.set_status(self.idle_status());
    }

    // ── capture ──────────────────────────────────────────────────────────

    /// Begin handling a capture broadcast.  Returns immediately; the wait
    /// for the marked segment and the upload run in a spawned task.
    pub fn on_capture(self: &Arc<Self>, event: CaptureEvent) -> CaptureOutcome {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return CaptureOutcome::Busy;
        }
        let received_at = Utc::now().timestamp_millis();
        let cancel = self
            .capture_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        info!(
            "Capture {} (ts={}) received",
            event.folder_id, event.logical_timestamp
        );

        let agent = Arc::clone(self);
        CaptureOutcome::Started(tokio::spawn(async move {
            let result = agent.run_capture(&event, received_at, &cancel).await;
            agent.in_flight.store(false, Ordering::SeqCst);
            match &result {
                Ok(filename) => info!("Capture {} saved as {filename}", event.folder_id),
                Err(e) => warn!("Capture {} failed: {e}", event.folder_id),
            }
            result
        }))
    }

    async fn run_capture(
        self: &Arc<Self>,
        event: &CaptureEvent,
        received_at: i64,
        cancel: &CancellationToken,
    ) -> Result<String, CaptureError> {
        let view = self.session();
        if self.settings.has_aux_light && view.aux_selected {
            self.pulse_light();
        }
        self.set_status(AgentStatus::Saving);

        let segment = match self.buffer.capture_marked(cancel).await {
            Ok(segment) => segment,
            Err(e) => {
                self.capture_failed(&e).await;
                return Err(e);
            }
        };

        if cancel.is_cancelled() {
            self.buffer.release();
            return Err(CaptureError::Cancelled);
        }

        let source = self.buffer.source();
        let device_id = view.device_id.as_deref().unwrap_or("unassigned");
        let role = view.role.unwrap_or(Role::Participant);
        let filename =
            naming::segment_filename(event.logical_timestamp, role, device_id, source.extension());
        let metadata = SegmentMetadata {
            filename: filename.clone(),
            folder_id: event.folder_id.clone(),
            session_id: event.session_id.clone(),
            device_id: device_id.to_string(),
            capture_logical_timestamp: event.logical_timestamp,
            received_at,
            nominal_duration_ms: self.buffer.timing().window.as_millis() as u64,
            byte_size: segment.data.len() as u64,
            role,
            label: self.settings.label.clone(),
        };

        let uploaded = self
            .uploader
            .upload(
                &event.folder_id,
                &filename,
                segment.data.clone(),
                source.content_type(),
                &metadata,
            )
            .await;
        self.buffer.release();

        match uploaded {
            Ok(()) => {
                self.send(ClientMessage::NotifyUploaded {
                    filename: filename.clone(),
                });
                self.set_status(AgentStatus::Saved(filename.clone()));
                Ok(filename)
            }
            Err(e) => {
                let e = CaptureError::Upload(e);
                self.capture_failed(&e).await;
                Err(e)
            }
        }
    }

    async fn capture_failed(&self, e: &CaptureError) {
        match e {
            CaptureError::NotReady => self.set_status(AgentStatus::NotReady),
            CaptureError::Busy => self.set_status(AgentStatus::Busy),
            CaptureError::Cancelled => {
                if *self.status.borrow() == AgentStatus::Saving {
                    self.set_status(self.idle_status());
                }
            }
            // the buffer already rebuilt itself and may be ready again
            CaptureError::Restarted => {
                self.set_status(AgentStatus::UploadFailed);
                self.refresh_status();
            }
            CaptureError::Timeout | CaptureError::Source(_) | CaptureError::Upload(_) => {
                if self.buffer.is_running() {
                    self.buffer.restart().await;
                    self.set_status(AgentStatus::UploadFailed);
                } else {
                    // stopped meanwhile (new session): nothing to rebuild
                    self.set_status(self.idle_status());
                }
            }
        }
    }

    fn pulse_light(self: &Arc<Self>) {
        let agent = Arc::clone(self);
        let pulse = self.settings.light_pulse;
        tokio::spawn(async move {
            let source = agent.buffer.source();
            if let Err(e) = source.set_light(true).await {
                warn!("Cannot switch aux light on: {e:#}");
                return;
            }
            tokio::time::sleep(pulse).await;
            if let Err(e) = source.set_light(false).await {
                warn!("Cannot switch aux light off: {e:#}");
            }
        });
    }

    // ── conductor commands ───────────────────────────────────────────────

    /// Ask the coordinator to start the countdown.  Only the conductor of
    /// a session that has not started may do this.
    pub fn request_start(&self) -> bool {
        let view = self.view().clone();
        if !view.is_conductor() {
            debug!("Only the conductor can start the session");
            return false;
        }
        if view.sync_started {
            debug!("Session already started");
            return false;
        }
        self.send(ClientMessage::RequestSynchronizedStart)
    }

    pub fn trigger_capture(&self) -> bool {
        if !self.view().is_conductor() {
            debug!("Only the conductor can trigger a capture");
            return false;
        }
        self.send(ClientMessage::TriggerCapture)
    }

    /// Designate the aux-light device, or clear the designation.
    pub fn select_aux(&self, target_id: Option<String>) -> bool {
        if !self.view().is_conductor() {
            debug!("Only the conductor can select the aux-light device");
            return false;
        }
        self.send(ClientMessage::SelectAuxDevice { target_id })
    }
}

impl<S: CaptureSource, U: Uploader> Drop for DeviceAgent<S, U> {
    fn drop(&mut self) {
        self.capture_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::tests::{buffer, FakeDevice, OVERLAP, W};
    use crate::buffer::Segment;
    use bytes::Bytes;
    use tokio::sync::mpsc::UnboundedReceiver;

    #[derive(Debug, Clone)]
    struct Upload {
        folder: String,
        filename: String,
        data: Bytes,
        metadata: SegmentMetadata,
    }

    #[derive(Clone, Default)]
    struct FakeUploader {
        uploads: Arc<Mutex<Vec<Upload>>>,
        fail: Arc<AtomicBool>,
    }

    impl Uploader for FakeUploader {
        async fn upload(
            &self,
            folder: &str,
            filename: &str,
            data: Bytes,
            _content_type: &str,
            metadata: &SegmentMetadata,
        ) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("storage unreachable");
            }
            self.uploads.lock().unwrap().push(Upload {
                folder: folder.into(),
                filename: filename.into(),
                data,
                metadata: metadata.clone(),
            });
            Ok(())
        }
    }

    type TestAgent = DeviceAgent<crate::buffer::tests::FakeSource, FakeUploader>;

    struct Harness {
        agent: Arc<TestAgent>,
        device: Arc<FakeDevice>,
        uploader: FakeUploader,
        outbound: UnboundedReceiver<ClientMessage>,
    }

    fn harness(settings: AgentSettings) -> Harness {
        let (buf, device) = buffer();
        let uploader = FakeUploader::default();
        let (tx, outbound) = mpsc::unbounded_channel();
        let agent = Arc::new(DeviceAgent::new(buf, uploader.clone(), settings, tx));
        Harness {
            agent,
            device,
            uploader,
            outbound,
        }
    }

    fn role(device_id: &str, role: Role, session: &str, started: bool) -> ServerMessage {
        ServerMessage::RoleAssigned {
            device_id: device_id.into(),
            role,
            session_id: session.into(),
            sync_started: started,
        }
    }

    fn event(ts: i64) -> CaptureEvent {
        CaptureEvent {
            logical_timestamp: ts,
            session_id: "s1".into(),
            folder_id: format!("00_20240101_120000_{ts}"),
        }
    }

    fn drain(rx: &mut UnboundedReceiver<ClientMessage>) -> Vec<ClientMessage> {
        let mut out = vec![];
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    fn started(outcome: CaptureOutcome) -> JoinHandle<Result<String, CaptureError>> {
        match outcome {
            CaptureOutcome::Started(h) => h,
            CaptureOutcome::Busy => panic!("capture unexpectedly busy"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_uploads_marked_segment() {
        let mut h = harness(AgentSettings::default());
        h.agent.handle(role("dev-1", Role::Conductor, "s1", false)).await;
        assert_eq!(h.agent.status(), AgentStatus::Waiting);
        assert!(!h.agent.buffer().is_running());

        h.agent.handle(ServerMessage::Go).await;
        assert!(h.agent.buffer().is_running());
        tokio::time::sleep(W + W / 2).await;
        let before: Arc<Segment> = h.agent.buffer().latest().unwrap();

        let task = started(h.agent.on_capture(event(1700)));
        // second trigger while the first is in flight
        assert!(matches!(h.agent.on_capture(event(1701)), CaptureOutcome::Busy));

        let filename = task.await.unwrap().unwrap();
        assert_eq!(filename, "1700_conductor_dev1.bin");
        assert!(!h.agent.capture_in_flight());

        let uploads = h.uploader.uploads.lock().unwrap().clone();
        assert_eq!(uploads.len(), 1);
        let up = &uploads[0];
        assert_eq!(up.folder, "00_20240101_120000_1700");
        assert_eq!(up.filename, filename);
        assert_ne!(&up.data[..], &before.data[..]);
        assert_eq!(up.metadata.capture_logical_timestamp, 1700);
        assert_eq!(up.metadata.device_id, "dev-1");
        assert_eq!(up.metadata.role, Role::Conductor);
        assert_eq!(up.metadata.nominal_duration_ms, W.as_millis() as u64);
        assert_eq!(up.metadata.byte_size, up.data.len() as u64);
        assert_eq!(h.device.markers_in(1), 1);

        assert_eq!(
            drain(&mut h.outbound),
            vec![ClientMessage::NotifyUploaded { filename: filename.clone() }]
        );
        assert_eq!(h.agent.status(), AgentStatus::Saved(filename));

        // rotation resumed after the handoff
        tokio::time::sleep(W + OVERLAP).await;
        assert!(h.agent.buffer().latest().unwrap().seq >= 2);
        // and another capture is accepted
        assert!(matches!(h.agent.on_capture(event(1800)), CaptureOutcome::Started(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_before_first_segment_is_not_ready() {
        let h = harness(AgentSettings::default());
        h.agent.handle(role("dev-1", Role::Participant, "s1", true)).await;
        assert!(h.agent.buffer().is_running());

        let err = started(h.agent.on_capture(event(5))).await.unwrap().unwrap_err();
        assert!(matches!(err, CaptureError::NotReady));
        assert_eq!(h.agent.status().to_string(), "not ready yet");
        assert!(h.uploader.uploads.lock().unwrap().is_empty());
        assert!(!h.agent.capture_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_failure_restarts_buffer() {
        let mut h = harness(AgentSettings::default());
        let follow = CancellationToken::new();
        tokio::spawn(Arc::clone(&h.agent).follow_buffer(follow.clone()));
        h.agent.handle(role("dev-2", Role::Participant, "s1", true)).await;
        tokio::time::sleep(W + W / 2).await;
        h.uploader.fail.store(true, Ordering::SeqCst);

        let err = started(h.agent.on_capture(event(9))).await.unwrap().unwrap_err();
        assert!(matches!(err, CaptureError::Upload(_)));
        assert_eq!(h.agent.status().to_string(), "upload failed — retrying buffer");
        // fresh rotation: nothing stale to upload
        assert!(h.agent.buffer().is_running());
        assert!(h.agent.buffer().latest().is_none());
        assert!(drain(&mut h.outbound).is_empty());
        assert!(!h.agent.capture_in_flight());

        h.uploader.fail.store(false, Ordering::SeqCst);
        tokio::time::sleep(W / 2).await;
        assert_eq!(h.agent.status(), AgentStatus::UploadFailed);

        // the rebuilt buffer becomes ready and the notice clears
        tokio::time::sleep(W / 2 + OVERLAP).await;
        tokio::task::yield_now().await;
        assert!(h.agent.buffer().latest().is_some());
        assert_eq!(h.agent.status(), AgentStatus::Ready);
        follow.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_abandons_wait() {
        let h = harness(AgentSettings::default());
        h.agent.handle(role("dev-3", Role::Participant, "s1", true)).await;
        tokio::time::sleep(W + W / 2).await;

        let task = started(h.agent.on_capture(event(11)));
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.agent.on_disconnected();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, CaptureError::Cancelled));
        assert!(h.uploader.uploads.lock().unwrap().is_empty());
        assert!(!h.agent.capture_in_flight());
        // buffer survives the disconnect
        assert!(h.agent.buffer().is_running());
        assert_eq!(h.agent.session().role, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_session_abandons_wait() {
        let h = harness(AgentSettings::default());
        h.agent.handle(role("dev-5", Role::Participant, "s1", true)).await;
        tokio::time::sleep(W + W / 2).await;

        let task = started(h.agent.on_capture(event(12)));
        tokio::time::sleep(Duration::from_secs(1)).await;
        // everyone else left; a fresh session that has not had its go
        h.agent.handle(role("dev-5", Role::Conductor, "s2", false)).await;

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, CaptureError::Cancelled));
        assert!(h.uploader.uploads.lock().unwrap().is_empty());
        assert!(!h.agent.capture_in_flight());
        // no recording before the new session's go
        tokio::time::sleep(W * 2).await;
        assert!(!h.agent.buffer().is_running());
        assert_eq!(h.agent.status(), AgentStatus::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_selected_aux_light_pulses() {
        let settings = AgentSettings {
            has_aux_light: true,
            light_pulse: Duration::from_millis(200),
            ..AgentSettings::default()
        };
        let h = harness(settings);
        h.agent.handle(role("dev-4", Role::Participant, "s1", true)).await;
        tokio::time::sleep(W + W / 2).await;

        // not selected: no pulse
        started(h.agent.on_capture(event(1))).await.unwrap().unwrap();
        assert!(h.device.light.lock().unwrap().is_empty());

        h.agent
            .handle(ServerMessage::AuxSelected { is_selected: true })
            .await;
        started(h.agent.on_capture(event(2))).await.unwrap().unwrap();
        assert_eq!(*h.device.light.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test]
    async fn test_conductor_only_commands() {
        let mut h = harness(AgentSettings::default());
        assert!(!h.agent.request_start());

        h.agent.handle(role("p", Role::Participant, "s1", false)).await;
        assert!(!h.agent.request_start());
        assert!(!h.agent.trigger_capture());
        assert!(!h.agent.select_aux(Some("x".into())));
        assert!(drain(&mut h.outbound).is_empty());

        // promotion
        h.agent.handle(role("p", Role::Conductor, "s1", false)).await;
        assert!(h.agent.request_start());
        assert!(h.agent.trigger_capture());
        assert!(h.agent.select_aux(None));
        assert_eq!(
            drain(&mut h.outbound),
            vec![
                ClientMessage::RequestSynchronizedStart,
                ClientMessage::TriggerCapture,
                ClientMessage::SelectAuxDevice { target_id: None },
            ]
        );

        h.agent.handle(ServerMessage::Go).await;
        assert!(!h.agent.request_start());
        h.agent.buffer().stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_and_new_session() {
        let h = harness(AgentSettings::default());
        h.agent.handle(role("d", Role::Conductor, "s1", false)).await;
        for remaining in [3, 2, 1] {
            h.agent
                .handle(ServerMessage::CountdownTick { remaining })
                .await;
            assert_eq!(h.agent.status().to_string(), format!("counting down {remaining}"));
        }
        h.agent.handle(ServerMessage::Go).await;
        assert_eq!(h.agent.status(), AgentStatus::Recording);
        assert!(h.agent.session().sync_started);

        // same session re-announced (promotion): buffer keeps running
        h.agent.handle(role("d", Role::Conductor, "s1", true)).await;
        assert!(h.agent.buffer().is_running());

        // everyone left and a fresh session began
        h.agent.handle(role("d", Role::Conductor, "s2", false)).await;
        assert!(!h.agent.buffer().is_running());
        assert_eq!(h.agent.status(), AgentStatus::Waiting);
    }

    #[tokio::test]
    async fn test_conductor_summary_lists_aux_devices() {
        let h = harness(AgentSettings::default());
        h.agent.handle(role("c", Role::Participant, "s1", false)).await;
        assert_eq!(
            h.agent.session().summary(&h.agent.status()),
            "participant | 0 device(s) | waiting"
        );

        h.agent.handle(role("c", Role::Conductor, "s1", false)).await;
        h.agent
            .handle(ServerMessage::DeviceCount {
                total_connected: 3,
                session_id: "s1".into(),
            })
            .await;
        assert_eq!(
            h.agent.session().summary(&h.agent.status()),
            "conductor | 3 device(s) | waiting | aux: none"
        );

        h.agent
            .handle(ServerMessage::AuxCapableList {
                devices: vec![
                    AuxCapableDevice {
                        device_id: "c".into(),
                        role: Role::Conductor,
                    },
                    AuxCapableDevice {
                        device_id: "7e1f".into(),
                        role: Role::Participant,
                    },
                ],
            })
            .await;
        assert_eq!(
            h.agent.session().summary(&h.agent.status()),
            "conductor | 3 device(s) | waiting | aux: c (conductor), 7e1f (participant)"
        );
    }

    #[test]
    fn test_hello_frames() {
        let settings = AgentSettings {
            label: Some("cam-left".into()),
            has_aux_light: true,
            ..AgentSettings::default()
        };
        let h = harness(settings);
        assert_eq!(
            h.agent.hello(),
            vec![
                ClientMessage::Join {
                    label: Some("cam-left".into())
                },
                ClientMessage::RegisterAuxCapability {
                    has_capability: true
                },
            ]
        );
    }
}
