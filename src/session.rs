//! Voice-session controller.
//!
//! Mediates between user actions (start/stop/toggle) and the vendor voice
//! client, maintaining a small connection state machine: Idle, Connecting,
//! Listening, with a transient error message overlaid on Idle. The four
//! observable fields the control screen binds to are published as a
//! [`SessionSnapshot`] on a watch channel.
//!
//! All transitions run on the tokio event loop, driven either by a direct
//! user action or by one event from the client's subscription at a time;
//! there is no parallel mutation.

use crate::client::{ClientEvent, VoiceClient};
use crate::config::{AgentConfig, AssistantConfig};
use crate::mic;
use crate::vapi::VapiClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;

/// Liveness guard for the vendor's asynchronous connection callback: if the
/// call has not come up after this long, the attempt is abandoned. Not a
/// retry mechanism.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

const MSG_KEY_MISSING: &str = "API key is missing or invalid";
const MSG_INIT_FAILED: &str = "Failed to initialize voice assistant. Please check your API key.";
const MSG_NOT_INITIALIZED: &str = "Voice assistant not initialized. Please check your API key.";
const MSG_NO_MICROPHONE: &str = "Microphone capture is not available on this device.";
const MSG_CONNECT_TIMEOUT: &str =
    "Connection timeout. Please check your internet connection and try again.";

/// Connection phase of the session. Listening and Connecting are distinct
/// variants of one value, so they can never both hold at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    Idle,
    Connecting,
    Listening,
}

/// The session state value: a phase plus a transient error overlay.
/// A failure is not a sticky state, it is Idle carrying a message.
#[derive(Debug, Clone, PartialEq)]
struct SessionState {
    phase: Phase,
    error: Option<String>,
}

impl SessionState {
    fn idle() -> Self {
        Self {
            phase: Phase::Idle,
            error: None,
        }
    }

    fn connecting() -> Self {
        Self {
            phase: Phase::Connecting,
            error: None,
        }
    }

    fn listening() -> Self {
        Self {
            phase: Phase::Listening,
            error: None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            phase: Phase::Idle,
            error: Some(message.into()),
        }
    }
}

/// The observable fields the control screen binds to.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub is_initialized: bool,
    pub is_listening: bool,
    pub is_connecting: bool,
    pub error_message: String,
}

/// Owns the vendor client handle for its entire lifetime and translates
/// client events and user actions into state transitions.
pub struct SessionController {
    client: Option<Arc<dyn VoiceClient>>,
    assistant: AssistantConfig,
    initialized: bool,
    state: Mutex<SessionState>,
    /// Explicit handle for the connect timer, cancelled on every
    /// transition out of Connecting so a stale timer can never fire late.
    connect_timer: Mutex<Option<CancellationToken>>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    mic_probe: fn() -> bool,
}

impl SessionController {
    /// Build the controller from configuration, constructing the vendor
    /// client. Construction failure is terminal for the controller's
    /// lifetime: the session stays uninitialized with a user-facing
    /// message, and no retry is attempted.
    pub fn initialize(config: &AgentConfig) -> Arc<Self> {
        let Some(api_key) = config.api_key() else {
            log::warn!("no API key configured");
            return Self::uninitialized(MSG_KEY_MISSING, config.assistant.clone());
        };

        match VapiClient::new(api_key) {
            Ok(client) => {
                log::info!("✅ voice client initialized");
                Self::with_client(Arc::new(client), config.assistant.clone())
            }
            Err(e) => {
                log::error!("❌ voice client initialization failed: {e}");
                Self::uninitialized(MSG_INIT_FAILED, config.assistant.clone())
            }
        }
    }

    /// Build an initialized controller around an existing client.
    pub fn with_client(client: Arc<dyn VoiceClient>, assistant: AssistantConfig) -> Arc<Self> {
        Self::build(Some(client), assistant, true, None, mic::microphone_available)
    }

    /// Like [`with_client`](Self::with_client) but with a custom
    /// microphone-availability probe.
    pub fn with_mic_probe(
        client: Arc<dyn VoiceClient>,
        assistant: AssistantConfig,
        mic_probe: fn() -> bool,
    ) -> Arc<Self> {
        Self::build(Some(client), assistant, true, None, mic_probe)
    }

    fn uninitialized(message: &str, assistant: AssistantConfig) -> Arc<Self> {
        Self::build(
            None,
            assistant,
            false,
            Some(message.to_string()),
            mic::microphone_available,
        )
    }

    fn build(
        client: Option<Arc<dyn VoiceClient>>,
        assistant: AssistantConfig,
        initialized: bool,
        error: Option<String>,
        mic_probe: fn() -> bool,
    ) -> Arc<Self> {
        let state = SessionState {
            phase: Phase::Idle,
            error,
        };
        let snapshot = SessionSnapshot {
            is_initialized: initialized,
            is_listening: false,
            is_connecting: false,
            error_message: state.error.clone().unwrap_or_default(),
        };
        let (snapshot_tx, _) = watch::channel(snapshot);

        Arc::new(Self {
            client,
            assistant,
            initialized,
            state: Mutex::new(state),
            connect_timer: Mutex::new(None),
            snapshot_tx,
            mic_probe,
        })
    }

    /// Subscribe to snapshot updates (the control screen binding).
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Current snapshot of the observable fields.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Start a voice conversation with the assistant.
    ///
    /// No-op while already listening. Surfaces a message instead of
    /// starting when the controller is uninitialized or no microphone is
    /// available.
    pub async fn start_conversation(self: &Arc<Self>) {
        let Some(client) = self.client.clone().filter(|_| self.initialized) else {
            log::warn!("start requested but the voice client is not initialized");
            self.set_state(SessionState::failed(MSG_NOT_INITIALIZED)).await;
            return;
        };

        {
            let state = self.state.lock().await;
            if state.phase == Phase::Listening {
                log::debug!("already listening");
                return;
            }
        }

        if !(self.mic_probe)() {
            log::warn!("no capture device available");
            self.set_state(SessionState::failed(MSG_NO_MICROPHONE)).await;
            return;
        }

        log::info!("🚀 starting conversation");
        self.set_state(SessionState::connecting()).await;

        if let Err(e) = client.start(&self.assistant).await {
            log::error!("❌ start dispatch failed: {e}");
            self.cancel_connect_timer().await;
            self.set_state(SessionState::failed(format!(
                "Failed to start voice conversation: {e}"
            )))
            .await;
            return;
        }

        self.arm_connect_timer().await;
    }

    /// Stop the conversation. The session always ends up Idle, even when
    /// the vendor stop call fails; the failure is reported in the error
    /// message.
    pub async fn stop_conversation(&self) {
        self.cancel_connect_timer().await;

        let Some(client) = self.client.clone() else {
            log::debug!("stop requested but the voice client is not initialized");
            return;
        };

        log::info!("stopping conversation");
        match client.stop().await {
            Ok(()) => self.set_state(SessionState::idle()).await,
            Err(e) => {
                log::error!("❌ stop failed: {e}");
                self.set_state(SessionState::failed(format!(
                    "Failed to stop voice conversation: {e}"
                )))
                .await;
            }
        }
    }

    /// Dispatch to start or stop depending on whether a call is active or
    /// being established.
    pub async fn toggle_conversation(self: &Arc<Self>) {
        let active = {
            let state = self.state.lock().await;
            matches!(state.phase, Phase::Listening | Phase::Connecting)
        };
        if active {
            self.stop_conversation().await;
        } else {
            self.start_conversation().await;
        }
    }

    /// Component deactivation: force a stop if a call is active or being
    /// established.
    pub async fn shutdown(&self) {
        let active = {
            let state = self.state.lock().await;
            matches!(state.phase, Phase::Listening | Phase::Connecting)
        };
        if active {
            log::info!("shutting down with an active call, forcing stop");
            self.stop_conversation().await;
        }
    }

    /// Consume the client's event stream until `shutdown` is cancelled,
    /// applying one transition at a time.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let Some(client) = self.client.clone() else {
            // Initialization failed; there will never be any events.
            shutdown.cancelled().await;
            return;
        };

        let mut events = client.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("dropped {n} client events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    async fn handle_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::CallStart => {
                log::info!("✅ call started, connection established");
                self.cancel_connect_timer().await;
                // A call that comes up after the timeout already gave up
                // still wins: the session reflects the live call.
                self.set_state(SessionState::listening()).await;
            }
            ClientEvent::CallEnd => {
                log::info!("📞 call ended");
                self.cancel_connect_timer().await;
                // Phase resets but any reported error stays visible.
                let mut state = self.state.lock().await;
                state.phase = Phase::Idle;
                self.publish(&state);
            }
            ClientEvent::SpeechStart => log::debug!("🎤 assistant speaking"),
            ClientEvent::SpeechEnd => log::debug!("🔇 assistant finished speaking"),
            ClientEvent::Error { message } => {
                log::error!("❌ vendor error: {message}");
                self.cancel_connect_timer().await;
                self.set_state(SessionState::failed(format!(
                    "Voice assistant error: {message}"
                )))
                .await;
            }
            ClientEvent::CallStartFailed { message } => {
                log::error!("❌ call start failed: {message}");
                self.cancel_connect_timer().await;
                self.set_state(SessionState::failed(format!(
                    "Failed to start call: {message}"
                )))
                .await;
            }
        }
    }

    async fn arm_connect_timer(self: &Arc<Self>) {
        let token = CancellationToken::new();
        {
            let mut timer = self.connect_timer.lock().await;
            if let Some(previous) = timer.replace(token.clone()) {
                previous.cancel();
            }
        }

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(CONNECT_TIMEOUT) => {
                    controller.on_connect_timeout().await;
                }
            }
        });
    }

    async fn cancel_connect_timer(&self) {
        if let Some(token) = self.connect_timer.lock().await.take() {
            token.cancel();
        }
    }

    async fn on_connect_timeout(&self) {
        let mut state = self.state.lock().await;
        // Guard kept alongside the explicit cancellation: only an attempt
        // that is still connecting can time out.
        if state.phase != Phase::Connecting {
            return;
        }
        log::warn!("⏱️ connection attempt timed out");
        *state = SessionState::failed(MSG_CONNECT_TIMEOUT);
        self.publish(&state);
    }

    async fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock().await;
        log::debug!("session {} → {}", state.phase, next.phase);
        *state = next;
        self.publish(&state);
    }

    fn publish(&self, state: &SessionState) {
        self.snapshot_tx.send_replace(SessionSnapshot {
            is_initialized: self.initialized,
            is_listening: state.phase == Phase::Listening,
            is_connecting: state.phase == Phase::Connecting,
            error_message: state.error.clone().unwrap_or_default(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockClient {
        events: broadcast::Sender<ClientEvent>,
        started: AtomicUsize,
        stopped: AtomicUsize,
        fail_stop: bool,
    }

    impl MockClient {
        fn new() -> Arc<Self> {
            Self::with_fail_stop(false)
        }

        fn with_fail_stop(fail_stop: bool) -> Arc<Self> {
            let (events, _) = broadcast::channel(16);
            Arc::new(Self {
                events,
                started: AtomicUsize::new(0),
                stopped: AtomicUsize::new(0),
                fail_stop,
            })
        }

        fn starts(&self) -> usize {
            self.started.load(Ordering::SeqCst)
        }

        fn stops(&self) -> usize {
            self.stopped.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl VoiceClient for MockClient {
        async fn start(&self, _assistant: &AssistantConfig) -> Result<(), ClientError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), ClientError> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            if self.fail_stop {
                Err(ClientError::Api {
                    status: 500,
                    message: "meeting already ended".to_string(),
                })
            } else {
                Ok(())
            }
        }

        fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
            self.events.subscribe()
        }
    }

    fn controller(client: Arc<MockClient>) -> Arc<SessionController> {
        SessionController::with_mic_probe(client, AssistantConfig::default(), || true)
    }

    #[tokio::test]
    async fn start_moves_to_connecting_and_dispatches() {
        let client = MockClient::new();
        let controller = controller(client.clone());

        controller.start_conversation().await;

        let snap = controller.snapshot();
        assert!(snap.is_connecting);
        assert!(!snap.is_listening);
        assert!(snap.error_message.is_empty());
        assert_eq!(client.starts(), 1);
    }

    #[tokio::test]
    async fn missing_api_key_leaves_session_uninitialized() {
        let config = AgentConfig {
            api_key: None,
            assistant: AssistantConfig::default(),
        };
        let controller = SessionController::initialize(&config);

        let snap = controller.snapshot();
        assert!(!snap.is_initialized);
        assert_eq!(snap.error_message, MSG_KEY_MISSING);

        // Starting never reaches a vendor client and reports a message.
        controller.start_conversation().await;
        let snap = controller.snapshot();
        assert!(!snap.is_connecting);
        assert_eq!(snap.error_message, MSG_NOT_INITIALIZED);
    }

    #[tokio::test]
    async fn start_while_listening_is_idempotent() {
        let client = MockClient::new();
        let controller = controller(client.clone());
        controller.handle_event(ClientEvent::CallStart).await;

        controller.start_conversation().await;

        assert_eq!(client.starts(), 0);
        let snap = controller.snapshot();
        assert!(snap.is_listening);
        assert!(!snap.is_connecting);
    }

    #[tokio::test]
    async fn start_without_microphone_reports_capability_error() {
        let client = MockClient::new();
        let controller =
            SessionController::with_mic_probe(client.clone(), AssistantConfig::default(), || false);

        controller.start_conversation().await;

        assert_eq!(client.starts(), 0);
        let snap = controller.snapshot();
        assert!(!snap.is_connecting);
        assert_eq!(snap.error_message, MSG_NO_MICROPHONE);
    }

    #[tokio::test]
    async fn call_start_moves_to_listening_and_clears_error() {
        let client = MockClient::new();
        let controller = controller(client.clone());
        controller.start_conversation().await;

        controller.handle_event(ClientEvent::CallStart).await;

        let snap = controller.snapshot();
        assert!(snap.is_listening);
        assert!(!snap.is_connecting);
        assert_eq!(snap.error_message, "");
    }

    #[tokio::test]
    async fn call_end_returns_to_idle() {
        let client = MockClient::new();
        let controller = controller(client.clone());
        controller.handle_event(ClientEvent::CallStart).await;

        controller.handle_event(ClientEvent::CallEnd).await;

        let snap = controller.snapshot();
        assert!(!snap.is_listening);
        assert!(!snap.is_connecting);
    }

    #[tokio::test]
    async fn vendor_error_forces_idle_with_message() {
        let client = MockClient::new();
        let controller = controller(client.clone());
        controller.handle_event(ClientEvent::CallStart).await;

        controller
            .handle_event(ClientEvent::Error {
                message: "daily room dropped".to_string(),
            })
            .await;

        let snap = controller.snapshot();
        assert!(!snap.is_listening);
        assert!(!snap.is_connecting);
        assert_eq!(snap.error_message, "Voice assistant error: daily room dropped");
    }

    #[tokio::test]
    async fn call_start_failure_forces_idle_with_message() {
        let client = MockClient::new();
        let controller = controller(client.clone());
        controller.start_conversation().await;

        controller
            .handle_event(ClientEvent::CallStartFailed {
                message: "no media route".to_string(),
            })
            .await;

        let snap = controller.snapshot();
        assert!(!snap.is_connecting);
        assert!(!snap.is_listening);
        assert_eq!(snap.error_message, "Failed to start call: no media route");
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_abandons_the_attempt() {
        let client = MockClient::new();
        let controller = controller(client.clone());
        controller.start_conversation().await;

        tokio::time::sleep(CONNECT_TIMEOUT + Duration::from_secs(1)).await;

        let snap = controller.snapshot();
        assert!(!snap.is_connecting);
        assert!(!snap.is_listening);
        assert!(snap.error_message.starts_with("Connection timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_is_cancelled_once_the_call_is_up() {
        let client = MockClient::new();
        let controller = controller(client.clone());
        controller.start_conversation().await;
        controller.handle_event(ClientEvent::CallStart).await;

        tokio::time::sleep(CONNECT_TIMEOUT + Duration::from_secs(5)).await;

        let snap = controller.snapshot();
        assert!(snap.is_listening);
        assert_eq!(snap.error_message, "");
    }

    #[tokio::test(start_paused = true)]
    async fn late_call_start_after_timeout_still_wins() {
        let client = MockClient::new();
        let controller = controller(client.clone());
        controller.start_conversation().await;
        tokio::time::sleep(CONNECT_TIMEOUT + Duration::from_secs(1)).await;
        assert!(controller.snapshot().error_message.starts_with("Connection timeout"));

        controller.handle_event(ClientEvent::CallStart).await;

        let snap = controller.snapshot();
        assert!(snap.is_listening);
        assert_eq!(snap.error_message, "");
    }

    #[tokio::test]
    async fn stop_forces_idle_from_every_phase() {
        for prime in [None, Some(ClientEvent::CallStart)] {
            let client = MockClient::new();
            let controller = controller(client.clone());
            controller.start_conversation().await;
            if let Some(event) = prime {
                controller.handle_event(event).await;
            }

            controller.stop_conversation().await;

            let snap = controller.snapshot();
            assert!(!snap.is_listening);
            assert!(!snap.is_connecting);
            assert_eq!(snap.error_message, "");
            assert_eq!(client.stops(), 1);
        }
    }

    #[tokio::test]
    async fn stop_failure_is_reported_but_still_forces_idle() {
        let client = MockClient::with_fail_stop(true);
        let controller = controller(client.clone());
        controller.handle_event(ClientEvent::CallStart).await;

        controller.stop_conversation().await;

        let snap = controller.snapshot();
        assert!(!snap.is_listening);
        assert!(!snap.is_connecting);
        assert!(snap
            .error_message
            .starts_with("Failed to stop voice conversation"));
    }

    #[tokio::test]
    async fn toggle_dispatches_on_session_activity() {
        let client = MockClient::new();
        let controller = controller(client.clone());

        // Idle: toggle starts.
        controller.toggle_conversation().await;
        assert_eq!(client.starts(), 1);
        assert!(controller.snapshot().is_connecting);

        // Connecting: toggle stops.
        controller.toggle_conversation().await;
        assert_eq!(client.stops(), 1);
        assert!(!controller.snapshot().is_connecting);

        // Listening: toggle stops.
        controller.toggle_conversation().await;
        controller.handle_event(ClientEvent::CallStart).await;
        controller.toggle_conversation().await;
        assert_eq!(client.stops(), 2);
        assert!(!controller.snapshot().is_listening);
    }

    #[tokio::test]
    async fn shutdown_stops_an_active_call() {
        let client = MockClient::new();
        let controller = controller(client.clone());
        controller.handle_event(ClientEvent::CallStart).await;

        controller.shutdown().await;
        assert_eq!(client.stops(), 1);

        // Idle shutdown does not call the vendor again.
        controller.shutdown().await;
        assert_eq!(client.stops(), 1);
    }
}
