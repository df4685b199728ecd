//! Production [`VoiceClient`] over the Vapi hosted voice platform.
//!
//! A call is created with a REST request carrying the assistant
//! configuration; live call events are then consumed from the call's
//! monitor WebSocket and mapped onto [`ClientEvent`]s.

use crate::client::{ClientError, ClientEvent, VoiceClient};
use crate::config::AssistantConfig;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://api.vapi.ai";
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Book-keeping for the call currently in flight.
///
/// `control_url` is filled in once the vendor has acknowledged the call;
/// a stop before that point only has the cancellation token to work with.
/// The generation ties the record to the monitor task that created it, so
/// a superseded task can never clear a newer call's record.
struct ActiveCall {
    generation: u64,
    control_url: Option<String>,
    cancel: CancellationToken,
}

pub struct VapiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    events: broadcast::Sender<ClientEvent>,
    active: Arc<Mutex<Option<ActiveCall>>>,
    generation: AtomicU64,
}

impl VapiClient {
    pub fn new(api_key: &str) -> Result<Self, ClientError> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Result<Self, ClientError> {
        if api_key.trim().is_empty() {
            return Err(ClientError::InvalidApiKey);
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            http,
            api_key: api_key.trim().to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            events,
            active: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl VoiceClient for VapiClient {
    async fn start(&self, assistant: &AssistantConfig) -> Result<(), ClientError> {
        let cancel = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut active = self.active.lock().await;
            if let Some(previous) = active.take() {
                previous.cancel.cancel();
            }
            *active = Some(ActiveCall {
                generation,
                control_url: None,
                cancel: cancel.clone(),
            });
        }

        let ctx = CallContext {
            http: self.http.clone(),
            api_key: self.api_key.clone(),
            url: format!("{}/call/web", self.base_url),
            payload: json!({ "assistant": assistant }),
            events: self.events.clone(),
            active: Arc::clone(&self.active),
            generation,
            cancel,
        };

        tokio::spawn(run_call(ctx));

        Ok(())
    }

    async fn stop(&self) -> Result<(), ClientError> {
        let call = self.active.lock().await.take();
        let Some(call) = call else {
            log::debug!("stop requested with no active call");
            return Ok(());
        };

        call.cancel.cancel();

        if let Some(control_url) = call.control_url {
            let response = self
                .http
                .post(&control_url)
                .bearer_auth(&self.api_key)
                .json(&json!({ "type": "end-call" }))
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                return Err(ClientError::Api {
                    status: status.as_u16(),
                    message,
                });
            }
        }

        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

#[derive(Debug, Deserialize)]
struct WebCallResponse {
    id: String,
    monitor: CallMonitor,
}

#[derive(Debug, Deserialize)]
struct CallMonitor {
    #[serde(rename = "listenUrl")]
    listen_url: String,
    #[serde(rename = "controlUrl")]
    control_url: String,
}

#[derive(Debug, Deserialize)]
struct MonitorMessage {
    #[serde(rename = "type")]
    kind: String,
    status: Option<String>,
    message: Option<String>,
}

/// Everything one monitor task needs to create a call and pump its events.
struct CallContext {
    http: reqwest::Client,
    api_key: String,
    url: String,
    payload: serde_json::Value,
    events: broadcast::Sender<ClientEvent>,
    active: Arc<Mutex<Option<ActiveCall>>>,
    generation: u64,
    cancel: CancellationToken,
}

impl CallContext {
    /// Fill in the control URL, unless a stop or a newer start already
    /// replaced this call's record. Returns false in that case.
    async fn record_control_url(&self, control_url: &str) -> bool {
        let mut slot = self.active.lock().await;
        match slot.as_mut() {
            Some(record) if record.generation == self.generation => {
                record.control_url = Some(control_url.to_string());
                true
            }
            _ => false,
        }
    }

    /// Drop this call's record, leaving a newer call's record alone.
    async fn clear(&self) {
        let mut slot = self.active.lock().await;
        if matches!(slot.as_ref(), Some(record) if record.generation == self.generation) {
            slot.take();
        }
    }

    async fn fail_start(&self, message: String) {
        log::error!("❌ call start failed: {message}");
        let _ = self.events.send(ClientEvent::call_start_failed(Some(message)));
        self.clear().await;
    }
}

/// Create the call, attach to its monitor socket, and pump events until
/// the call ends or the client cancels it.
async fn run_call(ctx: CallContext) {
    let call = match create_call(&ctx.http, &ctx.api_key, &ctx.url, &ctx.payload).await {
        Ok(call) => call,
        Err(message) => {
            ctx.fail_start(message).await;
            return;
        }
    };
    log::info!("🚀 call {} created", call.id);

    if !ctx.record_control_url(&call.monitor.control_url).await {
        // A stop raced the start request; abandon the call quietly.
        return;
    }

    let listen_url = match Url::parse(&call.monitor.listen_url) {
        Ok(url) => url,
        Err(e) => {
            ctx.fail_start(format!("invalid monitor URL: {e}")).await;
            return;
        }
    };

    let mut ws = match connect_async(listen_url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            ctx.fail_start(e.to_string()).await;
            return;
        }
    };

    let _ = ctx.events.send(ClientEvent::CallStart);

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            frame = ws.next() => match frame {
                None => {
                    let _ = ctx.events.send(ClientEvent::CallEnd);
                    break;
                }
                Some(Err(e)) => {
                    let _ = ctx.events.send(ClientEvent::error(Some(e.to_string())));
                    break;
                }
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = parse_monitor_message(text.as_str()) {
                        let ended = event == ClientEvent::CallEnd;
                        let _ = ctx.events.send(event);
                        if ended {
                            break;
                        }
                    }
                }
                // Raw audio frames and pings are not interesting here.
                Some(Ok(_)) => {}
            }
        }
    }

    ctx.clear().await;
    log::debug!("monitor loop for call {} finished", call.id);
}

async fn create_call(
    http: &reqwest::Client,
    api_key: &str,
    url: &str,
    payload: &serde_json::Value,
) -> Result<WebCallResponse, String> {
    let response = http
        .post(url)
        .bearer_auth(api_key)
        .json(payload)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(format!("{} - {}", status.as_u16(), body));
    }

    response.json::<WebCallResponse>().await.map_err(|e| e.to_string())
}

/// Map one monitor-socket JSON message onto a [`ClientEvent`].
/// Messages this adapter does not care about map to `None`.
fn parse_monitor_message(text: &str) -> Option<ClientEvent> {
    let message: MonitorMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            log::debug!("unparseable monitor message ({e}): {text}");
            return None;
        }
    };

    match message.kind.as_str() {
        "speech-update" => match message.status.as_deref() {
            Some("started") => Some(ClientEvent::SpeechStart),
            Some("stopped") => Some(ClientEvent::SpeechEnd),
            _ => None,
        },
        "status-update" => match message.status.as_deref() {
            Some("ended") => Some(ClientEvent::CallEnd),
            _ => None,
        },
        "error" => Some(ClientEvent::error(message.message)),
        _ => None,
    }
}
