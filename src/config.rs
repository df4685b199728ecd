use secrecy::{ExposeSecret, SecretBox};
use serde::Serialize;
use std::env;
use std::fmt;

/// System prompt defining the assistant's persona as a football analyst.
/// Used as the default; override with `ANALYST_SYSTEM_PROMPT`.
pub const FOOTBALL_ANALYST_PROMPT: &str = "You are a knowledgeable and friendly football analyst with access to current information up to 2024. You provide accurate, insightful football facts, match analyses, player statistics, and tactical insights. Speak naturally like an experienced sports commentator or pundit.

Key areas of expertise:
- Current player performances and statistics
- Recent match results and analysis
- Tactical formations and strategies
- Transfer news and rumors
- Historical football moments and records
- League standings and competitions

Always provide up-to-date information when possible. If asked about anything outside football, politely guide the conversation back to football topics while maintaining your friendly, professional demeanor.";

/// One message in the model's priming conversation.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

/// Language-model selection sent at call start.
#[derive(Debug, Clone, Serialize)]
pub struct ModelConfig {
    pub provider: String,
    pub model: String,
    pub messages: Vec<Message>,
}

/// Voice-synthesis selection sent at call start.
#[derive(Debug, Clone, Serialize)]
pub struct VoiceConfig {
    pub provider: String,
    #[serde(rename = "voiceId")]
    pub voice_id: String,
}

/// The static call-start configuration, serialized to the vendor wire shape:
/// `{model: {provider, model, messages}, voice: {provider, voiceId}}`.
/// No dynamic negotiation happens after this is sent.
#[derive(Debug, Clone, Serialize)]
pub struct AssistantConfig {
    pub model: ModelConfig,
    pub voice: VoiceConfig,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig {
                provider: "openai".to_string(),
                model: "gpt-4o-mini".to_string(),
                messages: vec![Message {
                    role: "system".to_string(),
                    content: FOOTBALL_ANALYST_PROMPT.to_string(),
                }],
            },
            voice: VoiceConfig {
                provider: "playht".to_string(),
                voice_id: "jennifer".to_string(),
            },
        }
    }
}

/// Runtime configuration for the agent.
///
/// A missing or blank `VAPI_API_KEY` is not an error here: the session
/// controller surfaces it as an uninitialized session with a user-facing
/// message, matching how every other failure in this crate is reported.
pub struct AgentConfig {
    pub api_key: Option<SecretBox<String>>,
    pub assistant: AssistantConfig,
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("assistant", &self.assistant)
            .finish()
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// Recognized variables: `VAPI_API_KEY`, `ANALYST_MODEL`,
    /// `ANALYST_VOICE_ID`, `ANALYST_SYSTEM_PROMPT`. Blank values are
    /// treated as unset.
    pub fn load() -> Self {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        let api_key = env::var("VAPI_API_KEY")
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .map(|k| SecretBox::new(Box::new(k)));

        let mut assistant = AssistantConfig::default();
        if let Some(model) = non_blank_env("ANALYST_MODEL") {
            assistant.model.model = model;
        }
        if let Some(voice_id) = non_blank_env("ANALYST_VOICE_ID") {
            assistant.voice.voice_id = voice_id;
        }
        if let Some(prompt) = non_blank_env("ANALYST_SYSTEM_PROMPT") {
            assistant.model.messages = vec![Message {
                role: "system".to_string(),
                content: prompt,
            }];
        }

        Self { api_key, assistant }
    }

    /// The vendor API key, if one was configured (use only when
    /// constructing the vendor client).
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_ref().map(|k| k.expose_secret().as_str())
    }
}

fn non_blank_env(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_assistant_matches_wire_shape() {
        let assistant = AssistantConfig::default();
        let value = serde_json::to_value(&assistant).unwrap();

        assert_eq!(value["model"]["provider"], "openai");
        assert_eq!(value["model"]["model"], "gpt-4o-mini");
        assert_eq!(value["model"]["messages"][0]["role"], "system");
        assert_eq!(value["voice"]["provider"], "playht");
        // Vendor expects camelCase on the wire
        assert_eq!(value["voice"]["voiceId"], "jennifer");
        assert!(value["voice"].get("voice_id").is_none());
    }

    #[test]
    fn default_prompt_defines_the_persona() {
        let assistant = AssistantConfig::default();
        let content = &assistant.model.messages[0].content;
        assert!(content.contains("football analyst"));
    }

    #[test]
    fn debug_output_redacts_the_api_key() {
        let config = AgentConfig {
            api_key: Some(SecretBox::new(Box::new("sk-very-secret".to_string()))),
            assistant: AssistantConfig::default(),
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-very-secret"));
        assert!(rendered.contains("REDACTED"));
    }
}
