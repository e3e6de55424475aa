//! `coordinatord locks` — dump active (non-expired) leases (§6).

use crate::output;
use coordinator_core::Context;
use serde_json::json;

pub async fn run(ctx: &Context, holder: Option<String>) -> i32 {
    match ctx.locks.check(None, holder.as_deref()).await {
        Ok(leases) => {
            let rows: Vec<_> = leases
                .iter()
                .map(|lease| {
                    json!({
                        "key": lease.key,
                        "holder_id": lease.holder_id,
                        "holder_type": lease.holder_type,
                        "acquired_at": lease.acquired_at.to_rfc3339(),
                        "expires_at": lease.expires_at.to_rfc3339(),
                        "reason": lease.reason,
                    })
                })
                .collect();
            output::ok(format!("{} active lease(s)", rows.len()), json!({ "locks": rows }))
        }
        Err(err) => output::from_error(&err),
    }
}
