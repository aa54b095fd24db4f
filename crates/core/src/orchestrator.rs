use crate::config::AgentConfig;
use crate::llm::{
    ContentBlock, LanguageModel, Message, MessageRequest, MessageRole, StopReason,
};
use crate::models::{Citation, ConversationTurn, Role, TraceEntry};
use crate::tools::{RunOutcome, Toolset};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use serde_with::skip_serializing_none;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

pub const CEILING_NOTICE: &str =
    "Searching is taking longer than expected. Answering from the information gathered so far.";

pub const APOLOGY: &str =
    "An error occurred while communicating with the AI service. Please try again later.";

pub const QUERY_SYSTEM_PROMPT: &str = "You are an internal FAQ assistant. Answer employees' questions accurately by searching the knowledge base with your tools.

Procedure:
1. Start with search_knowledge to find information related to the question.
2. If the results are not enough, search again from a different angle or read the whole document with get_document_detail.
3. Once you have enough information, call register_citations and suggest_followups, then write the answer.

Answering rules:
1. Answer only from information found by searching. Do not fill gaps with guesses or general knowledge.
2. If nothing relevant is found, say the registered documents do not cover it and suggest contacting the administrator.
3. Be concise and clear. Use bullet or numbered lists where helpful.

Citations (required):
- Always call register_citations with the documents and passages you relied on before answering.
- Mention the sources naturally in the answer, e.g. \"According to **Work Rules (Article 20)**, ...\".
- Name every document you used.

Applying rules to individuals:
- Explain the policy without asserting that it applies to the user personally.
- State eligibility conditions such as tenure or employment type.
- Ask for missing details when they decide eligibility, and point to HR for the final decision.

Use the conversation history to resolve pronouns and keep context.";

pub const AUTHORING_SYSTEM_PROMPT: &str = "You are an assistant that helps administrators improve the internal knowledge base.

Your role:
- Analyse answer quality data (unanswered and badly rated questions) to find gaps in the knowledge base.
- Propose missing documents or additions to existing ones.
- Work out the content of new documents together with the administrator.
- Generate a Word document when the administrator asks for it.

Procedure:
1. Fetch quality data with get_quality_issues and analyse the trends.
2. Check what is already covered with get_existing_documents.
3. Identify gaps and make concrete proposals.
4. After agreeing on the content, create the document with generate_document.

Rules:
- Only call generate_document after an explicit request such as \"create it\".
- Keep analyses short and use bullet lists.
- Avoid duplicating existing documents.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Done,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    pub tool: String,
    pub status: StepStatus,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DonePayload {
    pub citations: Vec<Citation>,
    pub mean_similarity: f64,
    pub followups: Vec<String>,
    pub trace: Vec<TraceEntry>,
    /// Documents seen in search results. Lets a caller rebuild degraded
    /// citations when the model never registered any.
    pub referenced_document_ids: Vec<String>,
}

impl DonePayload {
    fn from_outcome(outcome: RunOutcome, trace: Vec<TraceEntry>) -> Self {
        Self {
            citations: outcome.citations,
            mean_similarity: outcome.mean_similarity,
            followups: outcome.followups,
            trace,
            referenced_document_ids: outcome.referenced_document_ids,
        }
    }
}

/// One line of the NDJSON answer stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEvent {
    Token(String),
    Step(StepEvent),
    Download { filename: String },
    Done(DonePayload),
}

impl AgentEvent {
    pub fn to_ndjson(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Answered,
    CeilingReached,
    ModelFailed,
    Cancelled,
}

/// What differs between the question-answering and authoring loops.
#[derive(Debug, Clone)]
pub struct LoopProfile {
    pub system: String,
    pub ceiling: usize,
    pub history_turns: usize,
}

impl LoopProfile {
    pub fn query(config: &AgentConfig) -> Self {
        Self {
            system: QUERY_SYSTEM_PROMPT.to_string(),
            ceiling: config.query_ceiling,
            history_turns: config.query_history_turns,
        }
    }

    pub fn authoring(config: &AgentConfig) -> Self {
        Self {
            system: AUTHORING_SYSTEM_PROMPT.to_string(),
            ceiling: config.authoring_ceiling,
            history_turns: config.authoring_history_turns,
        }
    }
}

fn history_messages(history: &[ConversationTurn], window: usize) -> Vec<Message> {
    let skip = history.len().saturating_sub(window);
    history
        .iter()
        .skip(skip)
        .filter(|turn| !turn.content.trim().is_empty())
        .map(|turn| match turn.role {
            Role::User => Message::user_text(turn.content.clone()),
            Role::Assistant => Message::assistant_text(turn.content.clone()),
        })
        .collect()
}

/// Drives the model through tool rounds until it answers in prose, the
/// iteration ceiling is hit, the model fails, or the receiver goes away.
pub struct AgentLoop {
    model: Arc<dyn LanguageModel>,
    config: AgentConfig,
}

impl AgentLoop {
    pub fn new(model: Arc<dyn LanguageModel>, config: AgentConfig) -> Self {
        Self { model, config }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub async fn run(
        &self,
        profile: &LoopProfile,
        tools: &mut dyn Toolset,
        history: &[ConversationTurn],
        question: &str,
        events: &UnboundedSender<AgentEvent>,
    ) -> RunStatus {
        let mut messages = history_messages(history, profile.history_turns);
        messages.push(Message::user_text(question));

        let definitions = tools.definitions();
        let mut trace = Vec::new();
        let emit = |event: AgentEvent| {
            // A send error means the receiver is gone; the next closed() check stops the run.
            let _ = events.send(event);
        };
        let on_text = |text: &str| emit(AgentEvent::Token(text.to_string()));

        for iteration in 1..=profile.ceiling {
            if events.is_closed() {
                info!(iteration, "event receiver closed, stopping");
                return RunStatus::Cancelled;
            }

            let request = MessageRequest {
                system: Some(profile.system.clone()),
                messages: messages.clone(),
                tools: definitions.clone(),
                max_tokens: self.config.max_tokens,
                temperature: Some(self.config.temperature),
            };

            let response = tokio::select! {
                _ = events.closed() => {
                    info!(iteration, "event receiver closed during model call");
                    return RunStatus::Cancelled;
                }
                response = self.model.stream(&request, &on_text) => response,
            };

            let response = match response {
                Ok(response) => response,
                Err(model_error) => {
                    error!(iteration, error = %model_error, "model call failed");
                    emit(AgentEvent::Token(APOLOGY.to_string()));
                    emit(AgentEvent::Done(DonePayload {
                        trace,
                        referenced_document_ids: tools.outcome().referenced_document_ids,
                        ..DonePayload::default()
                    }));
                    return RunStatus::ModelFailed;
                }
            };

            let calls = response.tool_uses();
            if response.stop_reason != StopReason::ToolUse || calls.is_empty() {
                debug!(iteration, "model answered");
                emit(AgentEvent::Done(DonePayload::from_outcome(tools.outcome(), trace)));
                return RunStatus::Answered;
            }

            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                let visible = tools.is_visible(&call.name);
                if visible {
                    emit(AgentEvent::Step(StepEvent {
                        tool: call.name.clone(),
                        status: StepStatus::Running,
                        input: Some(call.input.clone()),
                        summary: None,
                    }));
                }

                let executed = tokio::select! {
                    _ = events.closed() => {
                        info!(iteration, tool = %call.name, "event receiver closed during tool call");
                        return RunStatus::Cancelled;
                    }
                    executed = tools.execute(&call.name, &call.input) => executed,
                };

                let (content, summary, is_error) = match executed {
                    Ok(output) => {
                        if let Some(filename) = output.download {
                            emit(AgentEvent::Download { filename });
                        }
                        (output.content.to_string(), output.summary, false)
                    }
                    Err(tool_error) => {
                        warn!(iteration, tool = %call.name, error = %tool_error, "tool failed");
                        let message = tool_error.to_string();
                        (json!({ "error": message }).to_string(), message, true)
                    }
                };
                debug!(iteration, tool = %call.name, %summary, "tool finished");

                if visible {
                    emit(AgentEvent::Step(StepEvent {
                        tool: call.name.clone(),
                        status: StepStatus::Done,
                        input: None,
                        summary: Some(summary.clone()),
                    }));
                }

                trace.push(TraceEntry {
                    iteration,
                    tool: call.name,
                    input: call.input,
                    summary,
                });
                results.push(ContentBlock::ToolResult {
                    tool_use_id: call.id,
                    content,
                    is_error,
                });
            }

            messages.push(Message {
                role: MessageRole::Assistant,
                content: response.content,
            });
            messages.push(Message {
                role: MessageRole::User,
                content: results,
            });
        }

        warn!(ceiling = profile.ceiling, "iteration ceiling reached without an answer");
        emit(AgentEvent::Token(CEILING_NOTICE.to_string()));
        emit(AgentEvent::Done(DonePayload::from_outcome(tools.outcome(), trace)));
        RunStatus::CeilingReached
    }
}
