//! Lineage traversal over the `parent_task_id` forest.
//!
//! Both traversals bound their work by `max_depth` so that malformed data
//! (a cycle smuggled past the application-level guards) cannot make them
//! loop forever.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Task;
use crate::queries::tasks::get_task;

/// Walk the parent link upward from `task_id`, returning `(task, depth)`
/// pairs with depth starting at 1 for the immediate parent. The root task
/// itself is not included. Stops at a missing parent or at `max_depth`.
pub async fn list_ancestors(
    pool: &PgPool,
    task_id: Uuid,
    max_depth: i32,
) -> Result<Vec<(Task, i32)>> {
    let mut ancestors = Vec::new();

    let Some(current) = get_task(pool, task_id).await? else {
        return Ok(ancestors);
    };

    let mut parent_id = current.parent_task_id;
    let mut depth = 1;
    while let Some(id) = parent_id {
        if depth > max_depth {
            break;
        }
        let Some(parent) = get_task(pool, id).await? else {
            break;
        };
        parent_id = parent.parent_task_id;
        ancestors.push((parent, depth));
        depth += 1;
    }

    Ok(ancestors)
}

/// Breadth-first traversal of children below `task_id`, one query per depth
/// level. Returns `(task, depth)` pairs, depth 1 for direct children. Stops
/// when a level is empty or `max_depth` is reached.
pub async fn list_descendants(
    pool: &PgPool,
    task_id: Uuid,
    max_depth: i32,
) -> Result<Vec<(Task, i32)>> {
    let mut descendants = Vec::new();
    let mut frontier = vec![task_id];
    let mut depth = 1;

    while !frontier.is_empty() && depth <= max_depth {
        let children = sqlx::query_as::<_, Task>(
            "SELECT * FROM tasks \
             WHERE parent_task_id = ANY($1) \
             ORDER BY created_at ASC",
        )
        .bind(&frontier)
        .fetch_all(pool)
        .await
        .context("failed to fetch descendant level")?;

        if children.is_empty() {
            break;
        }

        frontier = children.iter().map(|child| child.id).collect();
        descendants.extend(children.into_iter().map(|child| (child, depth)));
        depth += 1;
    }

    Ok(descendants)
}

/// Return the subset of `ids` that exist in the `tasks` table. Used to
/// pre-validate parent references before a batch insert.
pub async fn list_existing_task_ids(pool: &PgPool, ids: &[Uuid]) -> Result<Vec<Uuid>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let rows: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM tasks WHERE id = ANY($1)")
        .bind(ids)
        .fetch_all(pool)
        .await
        .context("failed to check existing task ids")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}
