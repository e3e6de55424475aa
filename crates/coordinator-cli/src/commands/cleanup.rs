//! `coordinatord cleanup` — run one dead-agent sweep (§4.8, §6).

use crate::output;
use coordinator_core::Context;
use serde_json::json;

pub async fn run(ctx: &Context, staleness_secs: i64) -> i32 {
    match ctx.agent_registry.cleanup_dead_agents(staleness_secs).await {
        Ok(report) => output::ok(
            format!(
                "cleaned {} agent(s), released {} lock(s)",
                report.agents_cleaned, report.locks_released
            ),
            json!({
                "agents_cleaned": report.agents_cleaned,
                "locks_released": report.locks_released,
            }),
        ),
        Err(err) => output::from_error(&err),
    }
}
