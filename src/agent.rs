//! Request Orchestration
//!
//! One entry point, `Agent::handle_request`, drives a normalized inbound
//! message through lease acquisition, plan compilation, capability
//! execution, response assembly, and delivery. Tool and provider
//! failures stay inside the request as narrative; only a delivery
//! failure escapes as `Err`.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::assembly::{AggregateResult, ResponseAssembler};
use crate::config::Config;
use crate::error::AgentError;
use crate::history::HistoryStore;
use crate::lease::{ChatLeaseStore, ScheduleDedup};
use crate::llm::PlannerModel;
use crate::planner::{MultiStepPlan, PlanCompiler};
use crate::providers::GenerationClient;
use crate::tools::{ExecutionContext, ToolRegistry, ToolResult, Toolbox};
use crate::transport::{deliver, ChatTransport, NormalizedRequest, OutboundItem};

// Whole-message retry phrasings; anything longer is a fresh request.
static RETRY_HINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(again|retry|one more time|do it again|otra vez|de nuevo|rep[ií]telo|int[eé]ntalo de nuevo)\s*[.!]*\s*$",
    )
    .unwrap()
});

/// The orchestration core, shared across all chats
pub struct Agent {
    config: Config,
    registry: ToolRegistry,
    planner: PlanCompiler,
    assembler: ResponseAssembler,
    toolbox: Toolbox,
    leases: ChatLeaseStore,
    history: Arc<HistoryStore>,
    llm: Arc<dyn PlannerModel>,
    transport: Arc<dyn ChatTransport>,
}

impl Agent {
    pub fn new(
        config: Config,
        history: Arc<HistoryStore>,
        llm: Arc<dyn PlannerModel>,
        generation: GenerationClient,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        let leases = ChatLeaseStore::new(Duration::from_secs(config.lease_ttl_secs));
        let dedup = ScheduleDedup::new(Duration::from_secs(config.dedup_ttl_secs));
        let toolbox = Toolbox::new(
            config.clone(),
            history.clone(),
            llm.clone(),
            generation,
            transport.clone(),
            dedup,
        );

        Self {
            config,
            registry: ToolRegistry::new(),
            planner: PlanCompiler::new(llm.clone()),
            assembler: ResponseAssembler::new(),
            toolbox,
            leases,
            history,
            llm,
            transport,
        }
    }

    /// Handle one inbound request end to end.
    ///
    /// Returns the delivered items. `Err` means delivery itself broke;
    /// everything upstream of delivery degrades into the reply instead.
    pub async fn handle_request(
        &self,
        request: &NormalizedRequest,
    ) -> Result<Vec<OutboundItem>, AgentError> {
        let (token, already_held) = self.leases.acquire(request.chat_id);
        info!(
            "Handling request for chat {} ({} chars)",
            request.chat_id,
            request.text.len()
        );

        let mut ctx = ExecutionContext::from_request(request);
        ctx.stale_history = already_held;

        // "again" replays the stored command instead of being planned
        // on its own.
        let effective_text = self.resolve_retry(request);
        ctx.user_text = effective_text.clone();

        let mut agg = AggregateResult::new();

        let planned = if PlanCompiler::looks_multi_step(&effective_text) {
            self.run_plan(&effective_text, &mut ctx, &mut agg).await
        } else {
            false
        };
        if !planned {
            self.run_single(&effective_text, &mut ctx, &mut agg).await;
        }

        let items = self.assembler.assemble(&agg, &request.text);

        for item in &items {
            if let Err(e) = deliver(self.transport.as_ref(), request.chat_id, item).await {
                error!(
                    "Delivery failed for chat {} ({}): {}",
                    request.chat_id,
                    item.kind(),
                    e
                );
                self.leases.release(request.chat_id, token);
                return Err(AgentError::DownstreamTransportFailure(e.to_string()));
            }
        }

        if !ctx.stale_history {
            self.persist_exchange(request, &effective_text, &agg, &items);
        } else {
            debug!(
                "Chat {} had a live lease, skipping history write",
                request.chat_id
            );
        }

        self.leases.release(request.chat_id, token);
        Ok(items)
    }

    fn resolve_retry(&self, request: &NormalizedRequest) -> String {
        if RETRY_HINT.is_match(&request.text) {
            if let Ok(Some(command)) = self.history.last_command(request.chat_id) {
                info!("Chat {} retrying: {}", request.chat_id, command);
                return command;
            }
        }
        request.text.clone()
    }

    /// Compile and execute a multi-step plan. Returns false when the
    /// planner degraded to single-step, leaving the request untouched.
    async fn run_plan(
        &self,
        text: &str,
        ctx: &mut ExecutionContext,
        agg: &mut AggregateResult,
    ) -> bool {
        let plan = self.planner.plan(text, self.registry.declarations()).await;

        let (steps, reasoning) = match plan {
            MultiStepPlan::Multi { steps, reasoning } => (steps, reasoning),
            MultiStepPlan::Single { .. } => return false,
        };
        debug!("Executing {} plan steps ({})", steps.len(), reasoning);

        for step in steps {
            match &step.tool {
                Some(tool_name) => {
                    let result = match self.registry.resolve(tool_name) {
                        Ok((_, capability)) => {
                            self.toolbox.execute(capability, ctx, &step.parameters).await
                        }
                        Err(e) => {
                            warn!("Plan step {} failed to resolve: {}", step.step_number, e);
                            ToolResult::failed(e)
                        }
                    };

                    // Later steps may consume an image this one produced.
                    if let Some(("image", url)) = result.produced_asset() {
                        ctx.chained_image_url = Some(url.to_string());
                    }
                    self.record_tool_call(ctx, tool_name, &result);
                    agg.absorb(tool_name, &result);
                }
                None => {
                    // Narrative-only step: its action text is the message.
                    agg.absorb("narrate", &ToolResult::ok(step.action.clone()));
                }
            }
        }
        true
    }

    /// Single-tool dispatch, falling back to a conversational reply
    async fn run_single(&self, text: &str, ctx: &mut ExecutionContext, agg: &mut AggregateResult) {
        let declarations = self.registry.declarations();
        let mut choice = self.planner.choose_tool(text, declarations).await;

        // Re-ask with conversation context when the chosen tool benefits
        // from it, so pronouns in the request resolve to real values.
        if let Some(c) = &choice {
            let policy = self.registry.effective_history_policy(&c.tool);
            if !policy.ignore {
                if let Ok(context) = self
                    .history
                    .history_as_context(ctx.chat_id, self.config.history_limit)
                {
                    if !context.is_empty() {
                        let enriched = format!("{}\n{}", context, text);
                        if let Some(better) =
                            self.planner.choose_tool(&enriched, declarations).await
                        {
                            choice = Some(better);
                        }
                    }
                }
            }
        }

        match choice {
            Some(choice) => {
                let result = match self.registry.resolve(&choice.tool) {
                    Ok((_, capability)) => {
                        self.toolbox
                            .execute(capability, ctx, &choice.parameters)
                            .await
                    }
                    Err(e) => {
                        warn!("Model chose an unknown tool: {}", e);
                        ToolResult::failed(e)
                    }
                };
                self.record_tool_call(ctx, &choice.tool, &result);
                agg.absorb(&choice.tool, &result);
            }
            None => {
                let reply = self.conversational_reply(ctx).await;
                agg.absorb("chat", &reply);
            }
        }
    }

    async fn conversational_reply(&self, ctx: &ExecutionContext) -> ToolResult {
        let context = self
            .history
            .history_as_context(ctx.chat_id, self.config.history_limit)
            .unwrap_or_default();
        let recent = self
            .history
            .recent_tool_calls(ctx.chat_id, 5)
            .unwrap_or_default();
        let actions = if recent.is_empty() {
            String::new()
        } else {
            format!(
                "[Recent actions: {}]\n",
                recent
                    .iter()
                    .map(|c| c.tool.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };

        let prompt = format!(
            "{}{}\nUser ({}): {}\n\nReply briefly, in the user's language ({}).",
            context, actions, ctx.sender_name, ctx.user_text, ctx.language
        );

        match self.llm.generate(&prompt).await {
            Ok(reply) => ToolResult::ok(reply.trim().to_string()),
            Err(e) => {
                warn!("Conversational reply failed: {}", e);
                ToolResult::denied("I'm having trouble answering right now. Please try again.")
            }
        }
    }

    fn record_tool_call(&self, ctx: &ExecutionContext, tool: &str, result: &ToolResult) {
        if ctx.stale_history {
            return;
        }
        let (kind, url) = match result.produced_asset() {
            Some((kind, url)) => (Some(kind), Some(url.to_string())),
            None => (None, None),
        };
        if let Err(e) = self
            .history
            .record_tool_call(ctx.chat_id, tool, kind, url.as_deref())
        {
            warn!("Could not record tool call: {}", e);
        }
    }

    fn persist_exchange(
        &self,
        request: &NormalizedRequest,
        effective_text: &str,
        agg: &AggregateResult,
        items: &[OutboundItem],
    ) {
        if let Err(e) = self
            .history
            .add_message(request.chat_id, "user", &request.text, None)
        {
            warn!("Could not persist user message: {}", e);
        }

        let media_kind = items
            .iter()
            .map(|i| i.kind())
            .find(|k| matches!(*k, "image" | "video" | "audio"));
        let reply_text = items
            .iter()
            .find_map(|i| match i {
                OutboundItem::Text(t) => Some(t.clone()),
                OutboundItem::Image {
                    caption: Some(c), ..
                } => Some(c.clone()),
                _ => None,
            })
            .unwrap_or_else(|| format!("[{}]", items.first().map(|i| i.kind()).unwrap_or("reply")));
        if let Err(e) =
            self.history
                .add_message(request.chat_id, "assistant", &reply_text, media_kind)
        {
            warn!("Could not persist assistant message: {}", e);
        }

        // The effective text is what "again" should replay.
        if !agg.tools_used.is_empty() {
            if let Err(e) = self.history.set_last_command(request.chat_id, effective_text) {
                warn!("Could not persist last command: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::path::PathBuf;

    use crate::transport::DryRunTransport;

    /// Planner model that pops canned responses in order
    struct CannedModel {
        responses: Mutex<VecDeque<String>>,
    }

    impl CannedModel {
        fn new(responses: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
            })
        }
    }

    #[async_trait]
    impl PlannerModel for CannedModel {
        async fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
            self.responses
                .lock()
                .pop_front()
                .ok_or_else(|| anyhow!("no canned response left"))
        }
    }

    fn test_config(name: &str) -> Config {
        let db_path = PathBuf::from(format!("/tmp/mediabot_agent_test_{}.db", name));
        let _ = std::fs::remove_file(&db_path);
        Config {
            model_api_key: None,
            model_url: None,
            generation_url: "http://localhost:1".to_string(),
            generation_api_key: None,
            search_url: None,
            db_path,
            history_limit: 20,
            lease_ttl_secs: 60,
            dedup_ttl_secs: 60,
        }
    }

    fn build_agent(name: &str, model: Arc<dyn PlannerModel>) -> Agent {
        let config = test_config(name);
        let history = Arc::new(HistoryStore::open(&config.db_path).unwrap());
        let generation = GenerationClient::from_config(&config);
        Agent::new(config, history, model, generation, Arc::new(DryRunTransport))
    }

    fn kinds(items: &[OutboundItem]) -> Vec<&'static str> {
        items.iter().map(|i| i.kind()).collect()
    }

    #[tokio::test]
    async fn test_single_tool_dispatch() {
        let model = CannedModel::new(&[
            r#"{"tool": "create_poll", "parameters": {"question": "Cats or dogs?", "options": ["cats", "dogs"]}}"#,
        ]);
        let agent = build_agent("poll", model);

        let request = NormalizedRequest::text(1, "make a poll about pets");
        let items = agent.handle_request(&request).await.unwrap();

        assert_eq!(kinds(&items), vec!["poll", "text"]);
        match &items[0] {
            OutboundItem::Poll(p) => assert_eq!(p.question, "Cats or dogs?"),
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_location_reply_is_location_only() {
        let model = CannedModel::new(&[
            r#"{"tool": "send_location", "parameters": {"latitude": 40.4, "longitude": -3.7, "description": "Madrid"}}"#,
        ]);
        let agent = build_agent("location", model);

        let request = NormalizedRequest::text(1, "where is Madrid?");
        let items = agent.handle_request(&request).await.unwrap();

        // The location card is self-describing; no companion text.
        assert_eq!(kinds(&items), vec!["location"]);
    }

    #[tokio::test]
    async fn test_conversational_fallback() {
        // choose_tool gets unusable output, then the chat reply succeeds.
        let model = CannedModel::new(&["not json at all and no braces", "Hello there!"]);
        let agent = build_agent("chat", model);

        let request = NormalizedRequest::text(1, "hi");
        let items = agent.handle_request(&request).await.unwrap();

        assert_eq!(items, vec![OutboundItem::Text("Hello there!".to_string())]);
    }

    #[tokio::test]
    async fn test_model_down_still_replies() {
        let model = CannedModel::new(&[]);
        let agent = build_agent("down", model);

        let request = NormalizedRequest::text(1, "hi");
        let items = agent.handle_request(&request).await.unwrap();

        assert_eq!(items.len(), 1);
        match &items[0] {
            OutboundItem::Text(t) => assert!(t.contains("trouble")),
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_from_model() {
        let model = CannedModel::new(&[r#"{"tool": "summon_dragon", "parameters": {}}"#]);
        let agent = build_agent("unknown", model);

        let request = NormalizedRequest::text(1, "summon a dragon");
        let items = agent.handle_request(&request).await.unwrap();

        assert_eq!(items.len(), 1);
        match &items[0] {
            OutboundItem::Text(t) => assert!(t.contains("summon_dragon")),
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multi_step_plan_execution() {
        let plan = r#"{
            "isMultiStep": true,
            "reasoning": "poll then location",
            "steps": [
                {"stepNumber": 1, "tool": "create_poll", "action": "ask",
                 "parameters": {"question": "Meet where?", "options": ["park", "cafe"]}},
                {"stepNumber": 2, "tool": "send_location", "action": "point",
                 "parameters": {"latitude": 1.0, "longitude": 2.0, "description": "the park"}}
            ]
        }"#;
        let model = CannedModel::new(&[plan]);
        let agent = build_agent("plan", model);

        let request = NormalizedRequest::text(1, "make a poll and then send the location");
        let items = agent.handle_request(&request).await.unwrap();

        // Fixed emission order regardless of step order, and the location
        // suppresses the trailing narrative.
        assert_eq!(kinds(&items), vec!["location", "poll"]);
    }

    #[tokio::test]
    async fn test_retry_replays_last_command() {
        let model = CannedModel::new(&[
            r#"{"tool": "create_poll", "parameters": {"question": "Round one?", "options": ["a", "b"]}}"#,
            r#"{"tool": "create_poll", "parameters": {"question": "Round one?", "options": ["a", "b"]}}"#,
        ]);
        let agent = build_agent("retry", model);

        let first = NormalizedRequest::text(1, "poll: round one?");
        agent.handle_request(&first).await.unwrap();
        assert_eq!(
            agent.history.last_command(1).unwrap().as_deref(),
            Some("poll: round one?")
        );

        let again = NormalizedRequest::text(1, "again");
        let items = agent.handle_request(&again).await.unwrap();
        assert_eq!(kinds(&items), vec!["poll", "text"]);

        // Retrying must not overwrite the stored command with "again".
        assert_eq!(
            agent.history.last_command(1).unwrap().as_deref(),
            Some("poll: round one?")
        );
    }

    #[tokio::test]
    async fn test_stale_lease_skips_history() {
        let model = CannedModel::new(&["plain reply", "reply one", "reply two"]);
        let agent = build_agent("stale", model);

        // Simulate an in-flight request for the same chat.
        let (_token, _) = agent.leases.acquire(1);

        let request = NormalizedRequest::text(1, "hello?");
        agent.handle_request(&request).await.unwrap();

        // The reply was delivered but nothing was persisted.
        assert!(agent.history.get_history(1, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exchange_persisted() {
        let model = CannedModel::new(&["not json", "Nice to meet you!"]);
        let agent = build_agent("persist", model);

        let request = NormalizedRequest::text(7, "hello, I am Ana");
        agent.handle_request(&request).await.unwrap();

        let history = agent.history.get_history(7, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, "user");
        assert_eq!(history[0].content, "hello, I am Ana");
        assert_eq!(history[1].role, "assistant");
        assert_eq!(history[1].content, "Nice to meet you!");
    }
}
