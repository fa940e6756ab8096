//! Response Assembly / Suppression Engine
//!
//! Consumes the aggregate outcome of one or more tool executions and
//! decides exactly what reaches the user. Emission order is fixed:
//! location, poll, image, video, audio, text. Narrative text is dropped
//! when it would duplicate a caption, dress a success up as an apology,
//! or leak a pipeline-intermediate artifact; if nothing survives at all a
//! generic failure notice is synthesized so the user is never left
//! without a reply (a provider error already pushed to the chat counts as
//! that reply).

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::tools::ToolResult;
use crate::transport::{LocationPayload, OutboundItem, PollPayload};

/// Generic failure notice, emitted only when literally nothing else was
/// produced or said
pub const FAILURE_NOTICE: &str =
    "I could not complete that request. Please try again.";

/// Tools whose output feeds later steps rather than the user
static DATA_TOOLS: &[&str] = &[
    "chat_history",
    "chat_summary",
    "web_search",
    "translate_text",
    "transcribe_audio",
    "describe_image",
    "memory_lookup",
    "list_tasks",
];

/// Tools that produce a user-facing artifact
static OUTPUT_TOOLS: &[&str] = &[
    "create_image",
    "edit_image",
    "create_video",
    "image_to_video",
    "create_music",
    "text_to_speech",
    "create_poll",
    "send_location",
];

pub fn is_data_tool(name: &str) -> bool {
    DATA_TOOLS.contains(&name)
}

pub fn is_output_tool(name: &str) -> bool {
    OUTPUT_TOOLS.contains(&name)
}

/// Accumulated outcome across all steps of one request.
///
/// Steps execute sequentially, so each media slot holds at most one value;
/// a later step's payload of the same kind overwrites the slot only when
/// the plan chained that kind.
#[derive(Debug, Clone, Default)]
pub struct AggregateResult {
    /// Ordered record of the tools actually invoked
    pub tools_used: Vec<String>,
    /// Final textual narrative (last non-empty step text wins)
    pub response_text: String,
    pub image_url: Option<String>,
    pub image_caption: Option<String>,
    pub video_url: Option<String>,
    pub video_caption: Option<String>,
    pub audio_url: Option<String>,
    pub poll: Option<PollPayload>,
    pub location: Option<LocationPayload>,
    /// A capability already pushed its own error message to the chat
    pub errors_already_sent: bool,
}

impl AggregateResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one step's result into the aggregate
    pub fn absorb(&mut self, tool: &str, result: &ToolResult) {
        self.tools_used.push(tool.to_string());

        if let Some(data) = &result.data {
            if !data.trim().is_empty() {
                self.response_text = data.clone();
            }
        }
        if let Some(err) = &result.error {
            // A failed step's message becomes the narrative unless the
            // capability already delivered it.
            if !result.errors_already_sent {
                self.response_text = err.to_string();
            }
        }

        if result.image_url.is_some() {
            self.image_url = result.image_url.clone();
            self.image_caption = result.image_caption.clone();
        }
        if result.video_url.is_some() {
            self.video_url = result.video_url.clone();
            self.video_caption = result.video_caption.clone();
        }
        if result.audio_url.is_some() {
            self.audio_url = result.audio_url.clone();
        }
        if result.poll.is_some() {
            self.poll = result.poll.clone();
        }
        if result.location.is_some() {
            self.location = result.location.clone();
        }
        self.errors_already_sent |= result.errors_already_sent;
    }

    /// Any media artifact present (image, video, or audio)
    pub fn has_media(&self) -> bool {
        self.image_url.is_some() || self.video_url.is_some() || self.audio_url.is_some()
    }
}

// ---------------------------------------------------------------------------
// Text classification
// ---------------------------------------------------------------------------

static APOLOGY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(sorry|i apologi[sz]e|unfortunately|i (could|was) not|lo siento|disculpa|perd[oó]n|lamentablemente|no (pude|he podido))\b",
    )
    .unwrap()
});

static IMAGE_SUCCESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(here('s| is) (your |the )?image!?|(your |the )?image (was |has been )?(generated|created)( successfully)?!?|done!?|aqu[ií] (est[aá]|tienes) (tu |la )?imagen!?|imagen (generada|creada)( con [eé]xito)?!?)$",
    )
    .unwrap()
});

static VIDEO_SUCCESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(here('s| is) (your |the )?video!?|(your |the )?video (was |has been )?(generated|created)( successfully)?!?|done!?|aqu[ií] (est[aá]|tienes) (tu |el )?v[ií]deo!?|v[ií]deo (generado|creado)( con [eé]xito)?!?)$",
    )
    .unwrap()
});

static DATA_OUTPUT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?im)(found \d+ (result|item|message)|here (is|are) (the|your|a) (summary|results?|messages)|https?://|^\s*[-•*]\s|^\s*\d+[.)]\s|summary:|results?:|se encontraron \d+|resumen:|resultados?:)",
    )
    .unwrap()
});

static DUAL_DELIVERABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(and (then |also )?(send|show|give) me (both|it|them)|also send|then (also )?send|and also|send both|y (luego|tambi[eé]n) env[ií]a|adem[aá]s env[ií]a|env[ií]a (ambos|las dos))\b",
    )
    .unwrap()
});

static CAPTION_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^\s*(caption|t[ií]tulo|pie de foto)\s*[:\-]\s*"#).unwrap()
});

/// Pluggable predicate set driving text suppression.
///
/// The engine's control flow never changes when phrasings are added; new
/// locales or test fixtures swap the predicates.
pub struct TextClassifier {
    /// Apologetic phrasing alongside a successful artifact
    pub apology: Box<dyn Fn(&str) -> bool + Send + Sync>,
    /// Generic "here is your X" phrasing for a media kind ("image"/"video")
    pub generic_success: Box<dyn Fn(&str, &str) -> bool + Send + Sync>,
    /// Typical data-tool output (listings, links, "found N items")
    pub data_tool_output: Box<dyn Fn(&str) -> bool + Send + Sync>,
    /// User explicitly asked for two independent deliverables
    pub dual_deliverable: Box<dyn Fn(&str) -> bool + Send + Sync>,
}

impl Default for TextClassifier {
    fn default() -> Self {
        Self {
            apology: Box::new(|text| APOLOGY.is_match(text)),
            generic_success: Box::new(|text, kind| match kind {
                "image" => IMAGE_SUCCESS.is_match(text),
                "video" => VIDEO_SUCCESS.is_match(text),
                _ => false,
            }),
            data_tool_output: Box::new(|text| DATA_OUTPUT.is_match(text)),
            dual_deliverable: Box::new(|text| DUAL_DELIVERABLE.is_match(text)),
        }
    }
}

/// Strip caption markers and normalize for duplicate comparison
fn normalize_for_caption_compare(text: &str) -> String {
    let stripped = CAPTION_MARKER.replace(text.trim(), "");
    stripped
        .trim()
        .trim_matches(['"', '\'', '*', '_', '[', ']'])
        .trim_end_matches(['.', '!'])
        .to_lowercase()
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Renders an `AggregateResult` into the final ordered emission list
pub struct ResponseAssembler {
    classifier: TextClassifier,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self {
            classifier: TextClassifier::default(),
        }
    }

    /// Substitute the predicate set (tests, new locales)
    pub fn with_classifier(classifier: TextClassifier) -> Self {
        Self { classifier }
    }

    /// Decide the final outbound message set.
    ///
    /// Returns at least one item unless a capability already delivered an
    /// error to the chat directly.
    pub fn assemble(&self, agg: &AggregateResult, user_text: &str) -> Vec<OutboundItem> {
        let mut items: Vec<OutboundItem> = Vec::new();

        if let Some(location) = &agg.location {
            items.push(OutboundItem::Location(location.clone()));
        }
        if let Some(poll) = &agg.poll {
            items.push(OutboundItem::Poll(poll.clone()));
        }
        if let Some(url) = &agg.image_url {
            items.push(OutboundItem::Image {
                url: url.clone(),
                caption: agg.image_caption.clone(),
            });
        }
        if let Some(url) = &agg.video_url {
            items.push(OutboundItem::Video {
                url: url.clone(),
                caption: agg.video_caption.clone(),
            });
        }
        if let Some(url) = &agg.audio_url {
            items.push(OutboundItem::Audio { url: url.clone() });
        }

        let narrative = agg.response_text.trim();
        if !narrative.is_empty() {
            match self.suppression_reason(agg, narrative, user_text) {
                Some(reason) => debug!("Narrative suppressed ({})", reason),
                None => items.push(OutboundItem::Text(narrative.to_string())),
            }
        }

        if items.is_empty() && !agg.errors_already_sent {
            debug!("Nothing survived assembly, emitting failure notice");
            items.push(OutboundItem::Text(FAILURE_NOTICE.to_string()));
        }

        items
    }

    /// First matching suppression rule wins; None means the narrative is
    /// emitted as-is
    fn suppression_reason(
        &self,
        agg: &AggregateResult,
        narrative: &str,
        user_text: &str,
    ) -> Option<&'static str> {
        // 1. Location carries its own description already.
        if agg.location.is_some() {
            return Some("location already describes itself");
        }

        // 2. A successful artifact must not read like a failure.
        if agg.has_media() && (self.classifier.apology)(narrative) {
            return Some("unnecessary apology next to produced media");
        }

        // 3. Redundant with the caption attached to the media message.
        let normalized = normalize_for_caption_compare(narrative);
        if agg.image_url.is_some() {
            if let Some(caption) = &agg.image_caption {
                if normalized == normalize_for_caption_compare(caption) {
                    return Some("duplicates image caption");
                }
            }
            if (self.classifier.generic_success)(narrative, "image") {
                return Some("generic image success phrase");
            }
        }
        if agg.video_url.is_some() {
            if let Some(caption) = &agg.video_caption {
                if normalized == normalize_for_caption_compare(caption) {
                    return Some("duplicates video caption");
                }
            }
            if (self.classifier.generic_success)(narrative, "video") {
                return Some("generic video success phrase");
            }
        }

        // 4. Audio output is itself the answer.
        if agg.audio_url.is_some() {
            return Some("audio output is the answer");
        }

        // 5. Pipeline-intermediate artifact feeding a later output tool.
        if self.is_pipeline(&agg.tools_used)
            && (self.classifier.data_tool_output)(narrative)
            && !(self.classifier.dual_deliverable)(user_text)
        {
            return Some("pipeline-intermediate data-tool output");
        }

        None
    }

    /// A data tool ran and an output tool ran after it
    fn is_pipeline(&self, tools_used: &[String]) -> bool {
        let first_data = tools_used.iter().position(|t| is_data_tool(t));
        match first_data {
            Some(i) => tools_used[i + 1..].iter().any(|t| is_output_tool(t)),
            None => false,
        }
    }
}

impl Default for ResponseAssembler {
    fn default() -> Self {
        Self::new()
    }
}
