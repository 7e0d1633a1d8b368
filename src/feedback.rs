use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use minijinja::{context, Environment};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument};

use crate::message::Message;
use crate::transcript::render_transcript;

const PROMPT_TEMPLATE_NAME: &str = "feedback_prompt.txt";

const FEEDBACK_PROMPT_TEMPLATE: &str = "\
You are a mental health therapy assistant. Analyze the user's chat messages and provide supportive and personalized feedback, offering insights and coping strategies.

Please format your response to be easy to read. Use paragraphs and insert double newlines (\\n\\n) after every few sentences or where a natural break occurs. Avoid dense blocks of text.

Chat Messages:
{{ chatMessages }}

Formatted Feedback:";

const FEEDBACK_FIELD_DESCRIPTION: &str = "Supportive and personalized feedback based on the user's chat messages, offering insights and coping strategies. Format the response with double newlines (\\n\\n) between paragraphs or after every few sentences for better readability.";

/// What the collaborator receives: the rendered transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackInput {
    #[serde(rename = "chatMessages")]
    pub chat_messages: String,
}

/// What the collaborator must answer with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackOutput {
    pub feedback: String,
}

impl FeedbackOutput {
    /// JSON schema handed to the model so it answers with this shape.
    pub fn json_schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "feedback": {
                    "type": "string",
                    "description": FEEDBACK_FIELD_DESCRIPTION,
                }
            },
            "required": ["feedback"],
        })
    }
}

/// Ways a collaborator call can go wrong. Only ever logged; callers of
/// [`FeedbackClient`] see a single [`FeedbackError`].
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("failed to render prompt: {0}")]
    Prompt(#[from] minijinja::Error),

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("provider returned {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// The external text-generation service.
#[async_trait]
pub trait Collaborator: Send + Sync {
    async fn generate(&self, input: &FeedbackInput) -> Result<FeedbackOutput, CollaboratorError>;
}

/// The fixed prompt the transcript is rendered into.
#[derive(Debug)]
pub struct FeedbackPrompt {
    env: Environment<'static>,
}

impl FeedbackPrompt {
    pub fn new() -> Result<Self, minijinja::Error> {
        let mut env = Environment::new();
        env.add_template(PROMPT_TEMPLATE_NAME, FEEDBACK_PROMPT_TEMPLATE)?;
        Ok(Self { env })
    }

    pub fn render(&self, input: &FeedbackInput) -> Result<String, minijinja::Error> {
        self.env
            .get_template(PROMPT_TEMPLATE_NAME)?
            .render(context! { chatMessages => input.chat_messages })
    }
}

// Structures matching Ollama's /api/generate endpoint
#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool, // We want the full response, not a stream
    format: serde_json::Value,
}

#[derive(Deserialize, Debug)]
struct OllamaResponse {
    #[serde(default)]
    model: String,
    response: String, // The generated text, JSON matching FeedbackOutput
    #[serde(default)]
    done: bool,
}

/// [`Collaborator`] backed by an Ollama server.
pub struct OllamaCollaborator {
    client: Client,
    generate_url: String,
    model: String,
    prompt: FeedbackPrompt,
}

impl OllamaCollaborator {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, CollaboratorError> {
        let generate_url = format!("{}/api/generate", base_url.trim_end_matches('/'));
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| CollaboratorError::Transport {
                url: generate_url.clone(),
                source,
            })?;
        Ok(Self {
            client,
            generate_url,
            model: model.into(),
            prompt: FeedbackPrompt::new()?,
        })
    }
}

#[async_trait]
impl Collaborator for OllamaCollaborator {
    #[instrument(skip(self, input), fields(model = %self.model))]
    async fn generate(&self, input: &FeedbackInput) -> Result<FeedbackOutput, CollaboratorError> {
        let prompt = self.prompt.render(input)?;
        debug!(?prompt, "Constructed Ollama prompt for feedback");

        let request_payload = OllamaRequest {
            model: self.model.clone(),
            prompt,
            stream: false,
            format: FeedbackOutput::json_schema(),
        };

        let transport = |source| CollaboratorError::Transport {
            url: self.generate_url.clone(),
            source,
        };

        let response = self
            .client
            .post(&self.generate_url)
            .json(&request_payload)
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(CollaboratorError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let ollama_response = response
            .json::<OllamaResponse>()
            .await
            .map_err(|e| CollaboratorError::MalformedResponse(e.to_string()))?;

        debug!(
            model = %ollama_response.model,
            done = ollama_response.done,
            response = ?ollama_response.response,
            "Received Ollama response"
        );

        serde_json::from_str::<FeedbackOutput>(&ollama_response.response)
            .map_err(|e| CollaboratorError::MalformedResponse(e.to_string()))
    }
}

/// The one failure callers see.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("feedback generation failed")]
pub struct FeedbackError;

/// Turns a session into feedback text. Stateless, nothing is cached.
#[derive(Clone)]
pub struct FeedbackClient {
    collaborator: Arc<dyn Collaborator>,
}

impl FeedbackClient {
    pub fn new(collaborator: Arc<dyn Collaborator>) -> Self {
        Self { collaborator }
    }

    #[instrument(skip(self, messages), fields(messages = messages.len()))]
    pub async fn provide_feedback(&self, messages: &[Message]) -> Result<String, FeedbackError> {
        let input = FeedbackInput {
            chat_messages: render_transcript(messages),
        };
        match self.collaborator.generate(&input).await {
            Ok(output) => {
                info!(chars = output.feedback.len(), "Feedback received");
                Ok(output.feedback)
            }
            Err(e) => {
                error!(error = %e, "Error getting AI feedback");
                Err(FeedbackError)
            }
        }
    }
}
