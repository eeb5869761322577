use std::sync::Arc;

use tracing::{info, warn};

use crate::agent::Agent;
use crate::budget::TokenBudgetManager;
use crate::channels::{spawn_stdin_reader, ChannelHub, ConsoleChannel};
use crate::config::AppConfig;
use crate::engagement::EngagementTracker;
use crate::followup::FollowUpLifecycle;
use crate::guard::ConcurrencyGuard;
use crate::invoker::ResilientInvoker;
use crate::messages::InMemoryMessageStore;
use crate::momentum::MomentumTracker;
use crate::proactive::ProactiveOpportunityFinder;
use crate::providers::OpenAiCompatibleProvider;
use crate::scheduler::ActionScheduler;
use crate::state::SqliteStateStore;
use crate::tools::{ScheduleFollowUpTool, SearchHistoryTool};
use crate::traits::{event_bus, MessageStore, StateStore, Tool};

/// Wire everything together and run until interrupted.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::new(&config.state.db_path).await?);
    store.health_check().await?;

    let messages: Arc<dyn MessageStore> =
        Arc::new(InMemoryMessageStore::new(config.state.message_window));

    let momentum = Arc::new(MomentumTracker::new(config.momentum.clone()));
    let guard = Arc::new(ConcurrencyGuard::new());
    let engagement = Arc::new(EngagementTracker::new(
        store.clone(),
        config.engagement.clone(),
    ));
    let followups = Arc::new(FollowUpLifecycle::new(
        store.clone(),
        config.followups.clone(),
    ));
    let finder = Arc::new(ProactiveOpportunityFinder::new(
        store.clone(),
        engagement.clone(),
        messages.clone(),
        config.proactive.clone(),
    ));

    // Items claimed by a crashed process would otherwise stay stuck in
    // executing until the stuck sweep expires them.
    if let Err(e) = followups.recover_interrupted().await {
        warn!(error = %e, "Follow-up recovery failed");
    }

    let provider = OpenAiCompatibleProvider::new(&config.provider)
        .map_err(|e| anyhow::anyhow!("Provider setup failed: {}", e))?;
    let invoker = Arc::new(ResilientInvoker::new(
        Arc::new(provider),
        config.retry.clone(),
        config.breaker.clone(),
    ));

    let hub = Arc::new(ChannelHub::new(Vec::new()));
    hub.register_channel(Arc::new(ConsoleChannel)).await;

    let tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(ScheduleFollowUpTool::new(followups.clone())),
        Arc::new(SearchHistoryTool::new(messages.clone())),
    ];

    let agent = Arc::new(Agent::new(
        invoker,
        hub,
        messages.clone(),
        store.clone(),
        TokenBudgetManager::new(config.budget.clone()),
        tools,
        config.scheduler.context_messages,
        config.scheduler.tool_loop_cap,
        config.provider.max_tokens,
    ));

    let scheduler = Arc::new(ActionScheduler::new(
        config.scheduler.clone(),
        guard,
        momentum,
        engagement,
        followups,
        finder,
        agent,
        messages,
    ));

    let (sender, receiver) = event_bus(config.scheduler.event_capacity);
    spawn_stdin_reader(sender);
    scheduler.start(receiver);

    info!(
        model = %config.provider.model,
        tick_secs = config.scheduler.tick_interval_secs,
        "cadenced running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping");
    Ok(())
}
