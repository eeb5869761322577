use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::budget::TokenBudgetManager;
use crate::channels::ChannelHub;
use crate::invoker::{send_once, ResilientInvoker};
use crate::traits::{MessageStore, StateStore, Tool};
use crate::types::{
    estimate_tokens, ContextItem, ContextKind, CycleOutcome, GenerationOutcome, GenerationRequest,
    TriggerKind,
};

/// The decision engine for one claimed cycle: assemble context (after the
/// claim, with the in-flight exclusion filter applied), trim to budget,
/// run the bounded tool loop, and deliver at most one message.
pub struct Agent {
    invoker: Arc<ResilientInvoker>,
    hub: Arc<ChannelHub>,
    messages: Arc<dyn MessageStore>,
    store: Arc<dyn StateStore>,
    budget: TokenBudgetManager,
    tools: Vec<Arc<dyn Tool>>,
    context_messages: usize,
    tool_loop_cap: usize,
    max_tokens: u32,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        invoker: Arc<ResilientInvoker>,
        hub: Arc<ChannelHub>,
        messages: Arc<dyn MessageStore>,
        store: Arc<dyn StateStore>,
        budget: TokenBudgetManager,
        tools: Vec<Arc<dyn Tool>>,
        context_messages: usize,
        tool_loop_cap: usize,
        max_tokens: u32,
    ) -> Self {
        Self {
            invoker,
            hub,
            messages,
            store,
            budget,
            tools,
            context_messages,
            tool_loop_cap,
            max_tokens,
        }
    }

    /// Run one decision-and-act cycle on an already-claimed channel.
    ///
    /// `exclusions` is the guard's in-flight filter; `note` carries extra
    /// context for follow-up and proactive triggers; `send_key` identifies
    /// the logical send in the idempotency ledger. Returns the terminal
    /// outcome; transient generator failures have already been retried
    /// inside the invoker by the time an error surfaces here.
    pub async fn run_cycle(
        &self,
        channel_id: &str,
        trigger: TriggerKind,
        exclusions: &HashSet<u64>,
        note: Option<String>,
        send_key: &str,
    ) -> anyhow::Result<CycleOutcome> {
        let mut items = self.assemble_context(channel_id, exclusions, note).await;
        if items.is_empty() {
            debug!(channel = %channel_id, trigger = %trigger, "No context to act on");
            return Ok(CycleOutcome::Declined);
        }

        let total: usize = items.iter().map(|i| i.tokens).sum();
        if self.budget.should_trim(total) {
            self.budget.trim(&mut items);
        }
        debug!(
            channel = %channel_id,
            utilization_pct = self.budget.utilization_pct(items.iter().map(|i| i.tokens).sum()),
            "Context assembled"
        );

        let tool_specs = self.tools.iter().map(|t| t.spec()).collect::<Vec<_>>();
        let mut iterations = 0usize;
        let text = loop {
            if iterations >= self.tool_loop_cap {
                warn!(
                    channel = %channel_id,
                    cap = self.tool_loop_cap,
                    "Tool loop cap reached without a final answer"
                );
                return Ok(CycleOutcome::Declined);
            }
            iterations += 1;

            let request = GenerationRequest {
                channel_id: channel_id.to_string(),
                items: items.clone(),
                tools: tool_specs.clone(),
                max_tokens: self.max_tokens,
            };
            match self.invoker.invoke(&request).await? {
                GenerationOutcome::Final { text, citations } => {
                    if !citations.is_empty() {
                        debug!(channel = %channel_id, count = citations.len(), "Citations attached");
                    }
                    break text;
                }
                GenerationOutcome::ToolRequest {
                    id,
                    name,
                    arguments,
                } => {
                    let output = self.execute_tool(&name, &arguments).await;
                    debug!(channel = %channel_id, tool = %name, call_id = %id, "Tool executed");
                    items.push(ContextItem {
                        tokens: estimate_tokens(&output),
                        kind: tool_kind(&name),
                        content: format!("{}: {}", name, output),
                    });
                    self.budget.trim(&mut items);
                }
            }
        };

        let text = text.trim();
        if text.is_empty() {
            info!(channel = %channel_id, trigger = %trigger, outcome = %CycleOutcome::Declined, "Cycle finished");
            return Ok(CycleOutcome::Declined);
        }

        // The key is a stable function of the logical send, never minted
        // per attempt: a cycle re-run after a crash between send and
        // persist presents the same key and the ledger skips the re-send.
        send_once(self.store.as_ref(), send_key, || async {
            self.hub.send_message(channel_id, text).await
        })
        .await?;

        info!(channel = %channel_id, trigger = %trigger, outcome = %CycleOutcome::Responded, "Cycle finished");
        Ok(CycleOutcome::Responded)
    }

    async fn assemble_context(
        &self,
        channel_id: &str,
        exclusions: &HashSet<u64>,
        note: Option<String>,
    ) -> Vec<ContextItem> {
        let mut items: Vec<ContextItem> = self
            .messages
            .recent(channel_id, self.context_messages, exclusions)
            .await
            .into_iter()
            .map(|m| {
                let content = format!("{}: {}", m.author_id, m.content);
                ContextItem {
                    tokens: estimate_tokens(&content),
                    kind: ContextKind::Message,
                    content,
                }
            })
            .collect();

        if let Some(note) = note {
            items.push(ContextItem {
                tokens: estimate_tokens(&note),
                kind: ContextKind::Message,
                content: note,
            });
        }
        items
    }

    async fn execute_tool(&self, name: &str, arguments: &serde_json::Value) -> String {
        let Some(tool) = self.tools.iter().find(|t| t.name() == name) else {
            warn!(tool = %name, "Generator requested unknown tool");
            return format!("error: unknown tool '{}'", name);
        };
        match tool.execute(arguments).await {
            Ok(output) => output,
            Err(e) => {
                warn!(tool = %name, error = %e, "Tool execution failed");
                format!("error: {}", e)
            }
        }
    }
}

/// Memory-writing tools produce exempt context; everything else is a
/// trimmable tool result.
fn tool_kind(tool_name: &str) -> ContextKind {
    if tool_name.starts_with("remember") || tool_name.starts_with("schedule_follow_up") {
        ContextKind::Memory
    } else {
        ContextKind::ToolResult
    }
}
