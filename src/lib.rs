pub mod client;
pub mod config;
pub mod mic;
pub mod server;
pub mod session;
pub mod vapi;

pub use client::{ClientError, ClientEvent, VoiceClient};
pub use config::{AgentConfig, AssistantConfig};
pub use session::{SessionController, SessionSnapshot};
