use tracing::debug;

use crate::config::BudgetConfig;
use crate::types::{ContextItem, ContextKind};

/// Keeps assembled context under the configured token trigger before a
/// generator call. Trimming is strictly a pre-call step.
///
/// Oldest non-exempt structured results (tool outputs) go first. Memory
/// items are the exempt category: the most recent `min_exempt_keep` are
/// always preserved, and older ones are only touched after every tool
/// result is gone. Conversation messages are never trimmed.
pub struct TokenBudgetManager {
    config: BudgetConfig,
}

impl TokenBudgetManager {
    pub fn new(config: BudgetConfig) -> Self {
        Self { config }
    }

    pub fn should_trim(&self, current_tokens: usize) -> bool {
        current_tokens > self.config.trigger_tokens
    }

    pub fn utilization_pct(&self, current_tokens: usize) -> f64 {
        if self.config.trigger_tokens == 0 {
            return 100.0;
        }
        current_tokens as f64 / self.config.trigger_tokens as f64 * 100.0
    }

    /// Trim `items` in place until under the trigger (or nothing more is
    /// droppable). Returns how many items were removed.
    pub fn trim(&self, items: &mut Vec<ContextItem>) -> usize {
        let before = items.len();
        let mut total: usize = items.iter().map(|i| i.tokens).sum();

        if !self.should_trim(total) {
            return 0;
        }

        // Pass 1: oldest tool results.
        while total > self.config.trigger_tokens {
            let Some(pos) = items.iter().position(|i| i.kind == ContextKind::ToolResult) else {
                break;
            };
            total -= items[pos].tokens;
            items.remove(pos);
        }

        // Pass 2: oldest memory items beyond the protected recent tail.
        while total > self.config.trigger_tokens {
            let memory_count = items
                .iter()
                .filter(|i| i.kind == ContextKind::Memory)
                .count();
            if memory_count <= self.config.min_exempt_keep {
                break;
            }
            let Some(pos) = items.iter().position(|i| i.kind == ContextKind::Memory) else {
                break;
            };
            total -= items[pos].tokens;
            items.remove(pos);
        }

        let removed = before - items.len();
        if removed > 0 {
            debug!(
                removed,
                remaining_tokens = total,
                utilization_pct = self.utilization_pct(total),
                "Trimmed context before call"
            );
        }
        removed
    }
}
