//! Capability Registry and Executor
//!
//! Every capability publishes a declaration (name, parameter schema,
//! history policy) and is dispatched through a closed `Capability`
//! variant resolved once at startup, keeping the match exhaustive. The
//! bodies are thin: media tools call the generation gateway through the
//! provider-fallback coordinator, data tools read the boundary stores or
//! the planner model.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::AgentError;
use crate::fallback::try_with_fallback;
use crate::history::HistoryStore;
use crate::lease::ScheduleDedup;
use crate::llm::PlannerModel;
use crate::providers::{candidates_for, GenerationClient, GenerationRequest, MediaKind};
use crate::transport::{ChatTransport, LocationPayload, NormalizedRequest, PollPayload, QuotedMessage};

/// Parameter value types in a tool schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Number,
    Boolean,
    StringList,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::StringList => "string list",
        }
    }
}

/// One named parameter in a tool schema
#[derive(Debug, Clone)]
pub struct ParameterSpec {
    pub kind: ParamType,
    pub required: bool,
    pub description: &'static str,
}

fn param(kind: ParamType, required: bool, description: &'static str) -> ParameterSpec {
    ParameterSpec {
        kind,
        required,
        description,
    }
}

/// Whether conversation history is supplied when invoking a capability
#[derive(Debug, Clone, Copy)]
pub struct HistoryPolicy {
    pub ignore: bool,
    pub reason: &'static str,
}

const HISTORY_DEFAULT: HistoryPolicy = HistoryPolicy {
    ignore: false,
    reason: "history may refine the request",
};

const HISTORY_IGNORED: HistoryPolicy = HistoryPolicy {
    ignore: true,
    reason: "the arguments are self-contained",
};

const HISTORY_IS_INPUT: HistoryPolicy = HistoryPolicy {
    ignore: false,
    reason: "operates on the conversation itself",
};

/// Immutable description of one capability, created at startup
#[derive(Debug, Clone)]
pub struct ToolDeclaration {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: BTreeMap<&'static str, ParameterSpec>,
    pub history: HistoryPolicy,
}

/// Closed set of capability variants; dispatch is by name, resolution
/// happens once per step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    CreateImage,
    EditImage,
    ImageToVideo,
    CreateVideo,
    CreateMusic,
    TextToSpeech,
    TranslateText,
    TranscribeAudio,
    DescribeImage,
    WebSearch,
    ChatHistory,
    ChatSummary,
    MemoryStore,
    MemoryLookup,
    CreatePoll,
    SendLocation,
    ScheduleTask,
    CancelTask,
    ListTasks,
    RetryLast,
}

impl Capability {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "create_image" => Self::CreateImage,
            "edit_image" => Self::EditImage,
            "image_to_video" => Self::ImageToVideo,
            "create_video" => Self::CreateVideo,
            "create_music" => Self::CreateMusic,
            "text_to_speech" => Self::TextToSpeech,
            "translate_text" => Self::TranslateText,
            "transcribe_audio" => Self::TranscribeAudio,
            "describe_image" => Self::DescribeImage,
            "web_search" => Self::WebSearch,
            "chat_history" => Self::ChatHistory,
            "chat_summary" => Self::ChatSummary,
            "memory_store" => Self::MemoryStore,
            "memory_lookup" => Self::MemoryLookup,
            "create_poll" => Self::CreatePoll,
            "send_location" => Self::SendLocation,
            "schedule_task" => Self::ScheduleTask,
            "cancel_task" => Self::CancelTask,
            "list_tasks" => Self::ListTasks,
            "retry_last" => Self::RetryLast,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateImage => "create_image",
            Self::EditImage => "edit_image",
            Self::ImageToVideo => "image_to_video",
            Self::CreateVideo => "create_video",
            Self::CreateMusic => "create_music",
            Self::TextToSpeech => "text_to_speech",
            Self::TranslateText => "translate_text",
            Self::TranscribeAudio => "transcribe_audio",
            Self::DescribeImage => "describe_image",
            Self::WebSearch => "web_search",
            Self::ChatHistory => "chat_history",
            Self::ChatSummary => "chat_summary",
            Self::MemoryStore => "memory_store",
            Self::MemoryLookup => "memory_lookup",
            Self::CreatePoll => "create_poll",
            Self::SendLocation => "send_location",
            Self::ScheduleTask => "schedule_task",
            Self::CancelTask => "cancel_task",
            Self::ListTasks => "list_tasks",
            Self::RetryLast => "retry_last",
        }
    }
}

/// Build the full declaration list; called once at startup
pub fn declarations() -> Vec<ToolDeclaration> {
    vec![
        ToolDeclaration {
            name: "create_image",
            description: "Generate an image from a text prompt",
            parameters: BTreeMap::from([
                ("prompt", param(ParamType::String, true, "What the image should show")),
                ("provider", param(ParamType::String, false, "Specific image backend to use")),
            ]),
            history: HISTORY_IGNORED,
        },
        ToolDeclaration {
            name: "edit_image",
            description: "Edit the attached or most recent image per the prompt",
            parameters: BTreeMap::from([
                ("prompt", param(ParamType::String, true, "The edit to apply")),
                ("provider", param(ParamType::String, false, "Specific image backend to use")),
            ]),
            history: HISTORY_IGNORED,
        },
        ToolDeclaration {
            name: "image_to_video",
            description: "Animate an image into a short video",
            parameters: BTreeMap::from([
                ("prompt", param(ParamType::String, false, "How the image should move")),
                ("provider", param(ParamType::String, false, "Specific video backend to use")),
            ]),
            history: HISTORY_IGNORED,
        },
        ToolDeclaration {
            name: "create_video",
            description: "Generate a short video from a text prompt",
            parameters: BTreeMap::from([
                ("prompt", param(ParamType::String, true, "What the video should show")),
                ("provider", param(ParamType::String, false, "Specific video backend to use")),
            ]),
            history: HISTORY_IGNORED,
        },
        ToolDeclaration {
            name: "create_music",
            description: "Generate a music track from a description",
            parameters: BTreeMap::from([
                ("prompt", param(ParamType::String, true, "Style and subject of the track")),
                ("provider", param(ParamType::String, false, "Specific music backend to use")),
            ]),
            history: HISTORY_IGNORED,
        },
        ToolDeclaration {
            name: "text_to_speech",
            description: "Read a text out loud as a voice message",
            parameters: BTreeMap::from([
                ("text", param(ParamType::String, true, "The text to speak")),
                ("provider", param(ParamType::String, false, "Specific speech backend to use")),
            ]),
            history: HISTORY_IGNORED,
        },
        ToolDeclaration {
            name: "translate_text",
            description: "Translate a text into another language",
            parameters: BTreeMap::from([
                ("text", param(ParamType::String, true, "The text to translate")),
                ("target_language", param(ParamType::String, true, "Language to translate into")),
            ]),
            history: HISTORY_IGNORED,
        },
        ToolDeclaration {
            name: "transcribe_audio",
            description: "Transcribe the attached voice message",
            parameters: BTreeMap::new(),
            history: HISTORY_IGNORED,
        },
        ToolDeclaration {
            name: "describe_image",
            description: "Describe what the attached image shows",
            parameters: BTreeMap::new(),
            history: HISTORY_IGNORED,
        },
        ToolDeclaration {
            name: "web_search",
            description: "Search the web for current information",
            parameters: BTreeMap::from([
                ("query", param(ParamType::String, true, "What to search for")),
            ]),
            history: HISTORY_DEFAULT,
        },
        ToolDeclaration {
            name: "chat_history",
            description: "Retrieve recent messages from this chat",
            parameters: BTreeMap::from([
                ("limit", param(ParamType::Number, false, "How many messages to fetch")),
            ]),
            history: HISTORY_IS_INPUT,
        },
        ToolDeclaration {
            name: "chat_summary",
            description: "Summarize the recent conversation in this chat",
            parameters: BTreeMap::new(),
            history: HISTORY_IS_INPUT,
        },
        ToolDeclaration {
            name: "memory_store",
            description: "Remember a fact about this chat for later",
            parameters: BTreeMap::from([
                ("fact", param(ParamType::String, true, "The fact to remember")),
            ]),
            history: HISTORY_IGNORED,
        },
        ToolDeclaration {
            name: "memory_lookup",
            description: "Look up previously remembered facts",
            parameters: BTreeMap::from([
                ("query", param(ParamType::String, false, "What to look for")),
            ]),
            history: HISTORY_IGNORED,
        },
        ToolDeclaration {
            name: "create_poll",
            description: "Send a poll to the chat",
            parameters: BTreeMap::from([
                ("question", param(ParamType::String, true, "The poll question")),
                ("options", param(ParamType::StringList, false, "Answer options (2-10)")),
            ]),
            history: HISTORY_DEFAULT,
        },
        ToolDeclaration {
            name: "send_location",
            description: "Send a map location to the chat",
            parameters: BTreeMap::from([
                ("latitude", param(ParamType::Number, true, "Latitude in degrees")),
                ("longitude", param(ParamType::Number, true, "Longitude in degrees")),
                ("description", param(ParamType::String, false, "Name of the place")),
            ]),
            history: HISTORY_IGNORED,
        },
        ToolDeclaration {
            name: "schedule_task",
            description: "Schedule a recurring command for this chat",
            parameters: BTreeMap::from([
                ("command", param(ParamType::String, true, "The command to run")),
                ("schedule", param(ParamType::String, true, "Cron-style schedule")),
            ]),
            history: HISTORY_IGNORED,
        },
        ToolDeclaration {
            name: "cancel_task",
            description: "Cancel a scheduled task by number",
            parameters: BTreeMap::from([
                ("task_id", param(ParamType::Number, true, "The task number to cancel")),
            ]),
            history: HISTORY_IGNORED,
        },
        ToolDeclaration {
            name: "list_tasks",
            description: "List the scheduled tasks for this chat",
            parameters: BTreeMap::new(),
            history: HISTORY_IGNORED,
        },
        ToolDeclaration {
            name: "retry_last",
            description: "Run the previous command again",
            parameters: BTreeMap::new(),
            history: HISTORY_DEFAULT,
        },
    ]
}

/// Read-only lookup over the declaration list
pub struct ToolRegistry {
    decls: Vec<ToolDeclaration>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            decls: declarations(),
        }
    }

    pub fn declarations(&self) -> &[ToolDeclaration] {
        &self.decls
    }

    /// Resolve a name to its declaration and variant. Never invokes
    /// anything; an unknown name is `UnknownTool`.
    pub fn resolve(&self, name: &str) -> Result<(&ToolDeclaration, Capability), AgentError> {
        let capability =
            Capability::from_name(name).ok_or_else(|| AgentError::UnknownTool(name.to_string()))?;
        let decl = self
            .decls
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| AgentError::UnknownTool(name.to_string()))?;
        Ok((decl, capability))
    }

    pub fn effective_history_policy(&self, name: &str) -> HistoryPolicy {
        self.decls
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.history)
            .unwrap_or(HISTORY_DEFAULT)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-request mutable scratch state passed into every capability call.
/// Owned exclusively by one in-flight request.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub chat_id: i64,
    pub user_text: String,
    pub sender_name: String,
    pub language: String,
    pub is_group: bool,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub audio_url: Option<String>,
    pub quoted: Option<QuotedMessage>,
    pub media_allowed: bool,
    pub search_allowed: bool,
    /// Set around one capability call to bias downstream validation
    pub expected_media: Option<MediaKind>,
    /// Image produced by an earlier step of the same plan
    pub chained_image_url: Option<String>,
    /// A live lease already existed when this request started
    pub stale_history: bool,
}

impl ExecutionContext {
    pub fn from_request(req: &NormalizedRequest) -> Self {
        Self {
            chat_id: req.chat_id,
            user_text: req.text.clone(),
            sender_name: req.sender_name.clone(),
            language: req.language.clone(),
            is_group: req.chat_kind == crate::transport::ChatKind::Group,
            image_url: req.image_url.clone(),
            video_url: req.video_url.clone(),
            audio_url: req.audio_url.clone(),
            quoted: req.quoted.clone(),
            media_allowed: req.media_allowed,
            search_allowed: req.search_allowed,
            expected_media: None,
            chained_image_url: None,
            stale_history: false,
        }
    }

    /// Best available source image: the current message, the quoted one,
    /// or an image produced earlier in the same plan
    fn source_image(&self) -> Option<String> {
        self.chained_image_url
            .clone()
            .or_else(|| self.image_url.clone())
            .or_else(|| {
                self.quoted
                    .as_ref()
                    .and_then(|q| q.media_url.clone())
            })
    }
}

/// Outcome of one capability invocation; immutable once returned
#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    pub success: bool,
    /// Human-readable status text
    pub data: Option<String>,
    pub error: Option<AgentError>,
    pub image_url: Option<String>,
    pub image_caption: Option<String>,
    pub video_url: Option<String>,
    pub video_caption: Option<String>,
    pub audio_url: Option<String>,
    pub poll: Option<PollPayload>,
    pub location: Option<LocationPayload>,
    /// Provider that actually fulfilled the call
    pub provider_used: Option<String>,
    /// The capability already pushed its own error to the chat
    pub errors_already_sent: bool,
}

impl ToolResult {
    pub fn ok(data: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data.into()),
            ..Self::default()
        }
    }

    /// Capability-specific refusal or precondition miss; the message
    /// becomes the step's narrative
    pub fn denied(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn failed(error: AgentError) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Self::default()
        }
    }

    /// Media artifact produced by this result, as (kind, url)
    pub fn produced_asset(&self) -> Option<(&'static str, &str)> {
        if let Some(url) = &self.image_url {
            return Some(("image", url));
        }
        if let Some(url) = &self.video_url {
            return Some(("video", url));
        }
        if let Some(url) = &self.audio_url {
            return Some(("audio", url));
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Shared service handles plus the capability bodies
pub struct Toolbox {
    pub config: Config,
    pub history: Arc<HistoryStore>,
    pub llm: Arc<dyn PlannerModel>,
    pub generation: GenerationClient,
    pub transport: Arc<dyn ChatTransport>,
    pub dedup: ScheduleDedup,
    http: reqwest::Client,
}

impl Toolbox {
    pub fn new(
        config: Config,
        history: Arc<HistoryStore>,
        llm: Arc<dyn PlannerModel>,
        generation: GenerationClient,
        transport: Arc<dyn ChatTransport>,
        dedup: ScheduleDedup,
    ) -> Self {
        Self {
            config,
            history,
            llm,
            generation,
            transport,
            dedup,
            http: reqwest::Client::new(),
        }
    }

    /// Execute one capability. Parameter and precondition problems come
    /// back as failed results, never as panics.
    pub async fn execute(
        &self,
        capability: Capability,
        ctx: &mut ExecutionContext,
        args: &Map<String, Value>,
    ) -> ToolResult {
        info!("Tool call: {} (chat {})", capability.name(), ctx.chat_id);

        match capability {
            Capability::CreateImage => {
                if !ctx.media_allowed {
                    return ToolResult::denied(media_not_allowed(&ctx.language));
                }
                let prompt = match require_str(args, "prompt") {
                    Ok(p) => p,
                    Err(e) => return ToolResult::failed(e),
                };
                self.generate_media(ctx, MediaKind::Image, args, prompt, None)
                    .await
            }

            Capability::EditImage => {
                if !ctx.media_allowed {
                    return ToolResult::denied(media_not_allowed(&ctx.language));
                }
                let prompt = match require_str(args, "prompt") {
                    Ok(p) => p,
                    Err(e) => return ToolResult::failed(e),
                };
                let input = match self.find_image(ctx) {
                    Some(url) => url,
                    None => return ToolResult::denied("I need an image to edit. Attach one or reply to one."),
                };
                self.generate_media(ctx, MediaKind::Image, args, prompt, Some(input))
                    .await
            }

            Capability::ImageToVideo => {
                if !ctx.media_allowed {
                    return ToolResult::denied(media_not_allowed(&ctx.language));
                }
                let prompt = opt_str(args, "prompt")
                    .unwrap_or_else(|| "Animate this image naturally".to_string());
                let input = match self.find_image(ctx) {
                    Some(url) => url,
                    None => {
                        return ToolResult::denied(
                            "I need an image to animate. Attach one or create one first.",
                        )
                    }
                };
                self.generate_media(ctx, MediaKind::Video, args, prompt, Some(input))
                    .await
            }

            Capability::CreateVideo => {
                if !ctx.media_allowed {
                    return ToolResult::denied(media_not_allowed(&ctx.language));
                }
                let prompt = match require_str(args, "prompt") {
                    Ok(p) => p,
                    Err(e) => return ToolResult::failed(e),
                };
                self.generate_media(ctx, MediaKind::Video, args, prompt, None)
                    .await
            }

            Capability::CreateMusic => {
                if !ctx.media_allowed {
                    return ToolResult::denied(media_not_allowed(&ctx.language));
                }
                let prompt = match require_str(args, "prompt") {
                    Ok(p) => p,
                    Err(e) => return ToolResult::failed(e),
                };
                self.generate_media(ctx, MediaKind::Music, args, prompt, None)
                    .await
            }

            Capability::TextToSpeech => {
                let text = match require_str(args, "text") {
                    Ok(t) => t,
                    Err(e) => return ToolResult::failed(e),
                };
                self.generate_media(ctx, MediaKind::Speech, args, text, None)
                    .await
            }

            Capability::TranslateText => {
                let text = match opt_str(args, "text")
                    .or_else(|| ctx.quoted.as_ref().map(|q| q.text.clone()))
                {
                    Some(t) if !t.is_empty() => t,
                    _ => {
                        return ToolResult::failed(AgentError::RequiredParameterMissing {
                            param: "text".into(),
                        })
                    }
                };
                let target = match require_str(args, "target_language") {
                    Ok(t) => t,
                    Err(e) => return ToolResult::failed(e),
                };

                let prompt = format!(
                    "Translate the following text into {}. Reply with the translation only.\n\n{}",
                    target, text
                );
                match self.llm.generate(&prompt).await {
                    Ok(translated) => ToolResult::ok(translated.trim().to_string()),
                    Err(e) => {
                        warn!("Translation failed: {}", e);
                        ToolResult::denied("Translation is unavailable right now.")
                    }
                }
            }

            Capability::TranscribeAudio => {
                let input = match ctx
                    .audio_url
                    .clone()
                    .or_else(|| ctx.quoted.as_ref().and_then(|q| q.media_url.clone()))
                {
                    Some(url) => url,
                    None => return ToolResult::denied("I need a voice message to transcribe."),
                };

                let request = GenerationRequest {
                    prompt: "transcribe".to_string(),
                    input_url: Some(input),
                    language: Some(ctx.language.clone()),
                };
                // Transcription is a data capability; only the speech
                // backend that supports it is eligible.
                let candidates = vec!["openai".to_string()];
                let result = try_with_fallback(&candidates, |provider| {
                    let request = request.clone();
                    async move {
                        match self
                            .generation
                            .generate(MediaKind::Speech, &provider, &request)
                            .await
                        {
                            Ok(asset) => {
                                ToolResult::ok(asset.caption.unwrap_or_default())
                            }
                            Err(e) => ToolResult::failed(AgentError::AllProvidersFailed {
                                details: e.to_string(),
                            }),
                        }
                    }
                })
                .await;
                result
            }

            Capability::DescribeImage => {
                let input = match self.find_image(ctx) {
                    Some(url) => url,
                    None => return ToolResult::denied("I need an image to describe."),
                };
                let prompt = format!(
                    "Describe briefly, in {}, the image at this URL: {}",
                    ctx.language, input
                );
                match self.llm.generate(&prompt).await {
                    Ok(description) => ToolResult::ok(description.trim().to_string()),
                    Err(e) => {
                        warn!("Image description failed: {}", e);
                        ToolResult::denied("I could not look at that image right now.")
                    }
                }
            }

            Capability::WebSearch => {
                if !ctx.search_allowed {
                    return ToolResult::denied("Search is not enabled for this chat.");
                }
                let query = match require_str(args, "query") {
                    Ok(q) => q,
                    Err(e) => return ToolResult::failed(e),
                };
                let base = match &self.config.search_url {
                    Some(url) => url.clone(),
                    None => return ToolResult::denied("Search is not configured."),
                };

                match self
                    .http
                    .get(&base)
                    .query(&[("q", query.as_str())])
                    .send()
                    .await
                {
                    Ok(response) => match response.text().await {
                        Ok(body) => {
                            let snippet = truncate(&body, 1200);
                            ToolResult::ok(format!("Results for \"{}\":\n{}", query, snippet))
                        }
                        Err(e) => {
                            warn!("Search body read failed: {}", e);
                            ToolResult::denied("Search did not return a readable result.")
                        }
                    },
                    Err(e) => {
                        warn!("Search request failed: {}", e);
                        ToolResult::denied("Search is unavailable right now.")
                    }
                }
            }

            Capability::ChatHistory => {
                let limit = opt_u64(args, "limit").unwrap_or(10) as usize;
                match self.history.history_as_context(ctx.chat_id, limit) {
                    Ok(context) if context.is_empty() => {
                        ToolResult::ok("There is no conversation history yet.")
                    }
                    Ok(context) => ToolResult::ok(context),
                    Err(e) => {
                        warn!("History read failed: {}", e);
                        ToolResult::denied("I could not read the chat history.")
                    }
                }
            }

            Capability::ChatSummary => {
                let context = match self
                    .history
                    .history_as_context(ctx.chat_id, self.config.history_limit)
                {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("History read failed: {}", e);
                        return ToolResult::denied("I could not read the chat history.");
                    }
                };
                if context.is_empty() {
                    return ToolResult::denied("There is nothing to summarize yet.");
                }

                let prompt = format!(
                    "Summarize this conversation in a few sentences, in {}:\n\n{}",
                    ctx.language, context
                );
                match self.llm.generate(&prompt).await {
                    Ok(summary) => {
                        ToolResult::ok(format!("Here is the summary: {}", summary.trim()))
                    }
                    Err(e) => {
                        warn!("Summary failed: {}", e);
                        ToolResult::denied("I could not produce a summary right now.")
                    }
                }
            }

            Capability::MemoryStore => {
                let fact = match require_str(args, "fact") {
                    Ok(f) => f,
                    Err(e) => return ToolResult::failed(e),
                };
                match self.history.remember(ctx.chat_id, &fact) {
                    Ok(_) => ToolResult::ok("Noted. I will remember that."),
                    Err(e) => {
                        warn!("Memory write failed: {}", e);
                        ToolResult::denied("I could not store that right now.")
                    }
                }
            }

            Capability::MemoryLookup => {
                let query = opt_str(args, "query").unwrap_or_default();
                match self.history.recall(ctx.chat_id, &query, 10) {
                    Ok(facts) if facts.is_empty() => {
                        ToolResult::ok("I have nothing stored about that.")
                    }
                    Ok(facts) => {
                        let listing = facts
                            .iter()
                            .map(|f| format!("- {}", f))
                            .collect::<Vec<_>>()
                            .join("\n");
                        ToolResult::ok(listing)
                    }
                    Err(e) => {
                        warn!("Memory read failed: {}", e);
                        ToolResult::denied("I could not look that up right now.")
                    }
                }
            }

            Capability::CreatePoll => {
                let question = match require_str(args, "question") {
                    Ok(q) => q,
                    Err(e) => return ToolResult::failed(e),
                };
                let options = opt_string_list(args, "options")
                    .filter(|o| o.len() >= 2)
                    .unwrap_or_else(|| vec!["Yes".to_string(), "No".to_string()]);

                let mut result = ToolResult::ok(format!("Poll created: {}", question));
                result.poll = Some(PollPayload { question, options });
                result
            }

            Capability::SendLocation => {
                let latitude = match require_f64(args, "latitude") {
                    Ok(v) => v,
                    Err(e) => return ToolResult::failed(e),
                };
                let longitude = match require_f64(args, "longitude") {
                    Ok(v) => v,
                    Err(e) => return ToolResult::failed(e),
                };
                let description = opt_str(args, "description");

                let mut result = ToolResult::ok(
                    description
                        .clone()
                        .unwrap_or_else(|| format!("{}, {}", latitude, longitude)),
                );
                result.location = Some(LocationPayload {
                    latitude,
                    longitude,
                    description,
                });
                result
            }

            Capability::ScheduleTask => {
                let command = match require_str(args, "command") {
                    Ok(c) => c,
                    Err(e) => return ToolResult::failed(e),
                };
                let schedule = match require_str(args, "schedule") {
                    Ok(s) => s,
                    Err(e) => return ToolResult::failed(e),
                };

                if !self.dedup.first_seen(ctx.chat_id, &command) {
                    return ToolResult::ok("That task is already scheduled.");
                }
                match self.history.add_task(ctx.chat_id, &command, &schedule) {
                    Ok(id) => ToolResult::ok(format!("Scheduled task #{} ({}).", id, schedule)),
                    Err(e) => {
                        warn!("Task write failed: {}", e);
                        ToolResult::denied("I could not schedule that right now.")
                    }
                }
            }

            Capability::CancelTask => {
                let task_id = match require_f64(args, "task_id") {
                    Ok(v) => v as i64,
                    Err(e) => return ToolResult::failed(e),
                };
                match self.history.cancel_task(ctx.chat_id, task_id) {
                    Ok(true) => ToolResult::ok(format!("Task #{} cancelled.", task_id)),
                    Ok(false) => {
                        ToolResult::denied(format!("There is no active task #{}.", task_id))
                    }
                    Err(e) => {
                        warn!("Task cancel failed: {}", e);
                        ToolResult::denied("I could not cancel that right now.")
                    }
                }
            }

            Capability::ListTasks => {
                match self.history.list_tasks(ctx.chat_id) {
                    Ok(tasks) if tasks.is_empty() => ToolResult::ok("No scheduled tasks."),
                    Ok(tasks) => {
                        let listing = tasks
                            .iter()
                            .map(|t| format!("- #{}: {} ({})", t.id, t.command, t.schedule))
                            .collect::<Vec<_>>()
                            .join("\n");
                        ToolResult::ok(listing)
                    }
                    Err(e) => {
                        warn!("Task read failed: {}", e);
                        ToolResult::denied("I could not read the task list.")
                    }
                }
            }

            // The agent intercepts retry before dispatch; reaching this
            // arm means there was nothing to retry.
            Capability::RetryLast => match self.history.last_command(ctx.chat_id) {
                Ok(Some(command)) => ToolResult::ok(format!("Retrying: {}", command)),
                _ => ToolResult::denied("There is no previous command to retry."),
            },
        }
    }

    /// Shared body of the media-producing capabilities: resolve the
    /// candidate list, run the fallback coordinator, and on exhaustion
    /// push a formatted error to the chat directly.
    async fn generate_media(
        &self,
        ctx: &mut ExecutionContext,
        kind: MediaKind,
        args: &Map<String, Value>,
        prompt: String,
        input_url: Option<String>,
    ) -> ToolResult {
        let explicit = opt_str(args, "provider");
        let candidates = match candidates_for(kind, explicit.as_deref()) {
            Ok(c) => c,
            Err(e) => return ToolResult::failed(e),
        };

        let request = GenerationRequest {
            prompt: prompt.clone(),
            input_url,
            language: Some(ctx.language.clone()),
        };

        ctx.expected_media = Some(kind);
        let mut result = try_with_fallback(&candidates, |provider| {
            let request = request.clone();
            let prompt = prompt.clone();
            async move {
                match self.generation.generate(kind, &provider, &request).await {
                    Ok(asset) => {
                        let mut r = ToolResult::ok(format!(
                            "{} generated with {}",
                            capitalize(kind.as_str()),
                            provider
                        ));
                        let caption = asset.caption.or_else(|| Some(prompt));
                        match kind {
                            MediaKind::Image => {
                                r.image_url = Some(asset.url);
                                r.image_caption = caption;
                            }
                            MediaKind::Video => {
                                r.video_url = Some(asset.url);
                                r.video_caption = caption;
                            }
                            MediaKind::Music | MediaKind::Speech => {
                                r.audio_url = Some(asset.url);
                            }
                        }
                        r
                    }
                    Err(e) => ToolResult::failed(AgentError::AllProvidersFailed {
                        details: e.to_string(),
                    }),
                }
            }
        })
        .await;
        ctx.expected_media = None;

        // Exhausted fallback: deliver the failure to the chat directly so
        // the narrative layer does not repeat it.
        if matches!(result.error, Some(AgentError::AllProvidersFailed { .. })) {
            let message = media_failure_message(kind, &ctx.language);
            match self.transport.send_text(ctx.chat_id, &message, None).await {
                Ok(()) => result.errors_already_sent = true,
                Err(e) => warn!("Could not deliver provider failure notice: {}", e),
            }
        }

        result
    }

    fn find_image(&self, ctx: &ExecutionContext) -> Option<String> {
        if let Some(url) = ctx.source_image() {
            return Some(url);
        }
        self.history
            .latest_asset(ctx.chat_id, "image")
            .ok()
            .flatten()
    }
}

fn media_not_allowed(language: &str) -> String {
    if language.starts_with("es") {
        "La creación de contenido no está habilitada en este chat.".to_string()
    } else {
        "Media creation is not enabled for this chat.".to_string()
    }
}

fn media_failure_message(kind: MediaKind, language: &str) -> String {
    if language.starts_with("es") {
        format!(
            "No pude generar el {} en este momento. Inténtalo de nuevo más tarde.",
            match kind {
                MediaKind::Image => "imagen",
                MediaKind::Video => "video",
                MediaKind::Music => "audio",
                MediaKind::Speech => "audio",
            }
        )
    } else {
        format!(
            "I could not generate the {} right now. Please try again later.",
            kind.as_str()
        )
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let end = s
        .char_indices()
        .take_while(|(i, _)| *i < max)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    &s[..end]
}

// Argument extraction helpers; missing required keys surface as
// RequiredParameterMissing, never as panics.

fn require_str(args: &Map<String, Value>, key: &str) -> Result<String, AgentError> {
    opt_str(args, key).ok_or_else(|| AgentError::RequiredParameterMissing {
        param: key.to_string(),
    })
}

fn opt_str(args: &Map<String, Value>, key: &str) -> Option<String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn require_f64(args: &Map<String, Value>, key: &str) -> Result<f64, AgentError> {
    args.get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| AgentError::RequiredParameterMissing {
            param: key.to_string(),
        })
}

fn opt_u64(args: &Map<String, Value>, key: &str) -> Option<u64> {
    args.get(key).and_then(|v| v.as_u64())
}

fn opt_string_list(args: &Map<String, Value>, key: &str) -> Option<Vec<String>> {
    let values = args.get(key)?.as_array()?;
    let list: Vec<String> = values
        .iter()
        .filter_map(|v| v.as_str())
        .map(|s| s.to_string())
        .collect();
    if list.is_empty() {
        None
    } else {
        Some(list)
    }
}
