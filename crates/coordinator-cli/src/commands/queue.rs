//! `coordinatord queue` — list pending tasks within a priority window (§6).

use crate::output;
use coordinator_core::Context;
use serde_json::json;

pub async fn run(ctx: &Context, max_priority: i64, limit: usize) -> i32 {
    match ctx.work_queue.get_pending(None, limit).await {
        Ok(tasks) => {
            let rows: Vec<_> = tasks
                .into_iter()
                .filter(|task| task.priority <= max_priority)
                .map(|task| {
                    json!({
                        "id": task.id,
                        "type": task.task_type,
                        "description": task.description,
                        "priority": task.priority,
                        "depends_on": task.depends_on,
                        "created_at": task.created_at.to_rfc3339(),
                    })
                })
                .collect();
            output::ok(format!("{} pending task(s) within priority window", rows.len()), json!({ "tasks": rows }))
        }
        Err(err) => output::from_error(&err),
    }
}
