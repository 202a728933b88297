//! Fragment rendering seam for `htmx_update` envelopes.
//!
//! The realtime core never builds markup itself; it asks a
//! `FragmentRenderer` for a task card and decides only where the card goes
//! and how it is swapped in. `CardRenderer` is the minimal built-in
//! renderer used when no template layer is plugged in.

use uuid::Uuid;

use crate::envelope::{Envelope, SwapStrategy};
use crate::services::task::{Mutation, TaskOp};
use crate::store::Task;

pub trait FragmentRenderer: Send + Sync {
    /// Markup for one task card. The root element must carry
    /// `id="task-{task.id}"` so later fragments can target it.
    fn task_card(&self, task: &Task) -> String;
}

#[must_use]
pub fn task_target(task_id: Uuid) -> String {
    format!("#task-{task_id}")
}

#[must_use]
pub fn column_target(column_id: Uuid) -> String {
    format!("#column-{column_id}")
}

/// `htmx_update` envelopes that bring rendered markup in line with `mutation`.
///
/// `siblings` holds the current state of the other tasks the mutation
/// renumbered. Each gets its card re-rendered so `data-position` stays dense.
#[must_use]
pub fn fragments_for(
    renderer: &dyn FragmentRenderer,
    board_id: Uuid,
    mutation: &Mutation,
    siblings: &[Task],
) -> Vec<Envelope> {
    let task = &mutation.task;
    let mut fragments = match mutation.op {
        TaskOp::Deleted => vec![Envelope::htmx_update(board_id, task_target(task.id), "", SwapStrategy::Replace)],
        TaskOp::Created => vec![insertion(renderer, board_id, mutation)],
        TaskOp::Moved => vec![
            Envelope::htmx_update(board_id, task_target(task.id), "", SwapStrategy::Replace),
            insertion(renderer, board_id, mutation),
        ],
        TaskOp::Updated | TaskOp::Assigned | TaskOp::Unassigned | TaskOp::Completed | TaskOp::Reopened => {
            vec![Envelope::htmx_update(board_id, task_target(task.id), renderer.task_card(task), SwapStrategy::Replace)]
        }
    };
    fragments.extend(
        siblings
            .iter()
            .map(|sibling| Envelope::htmx_update(board_id, task_target(sibling.id), renderer.task_card(sibling), SwapStrategy::Replace)),
    );
    fragments
}

/// Head of the column when the card landed first ahead of others, tail
/// otherwise. A card landing mid-column is appended and placed by its
/// `data-position`.
fn insertion(renderer: &dyn FragmentRenderer, board_id: Uuid, mutation: &Mutation) -> Envelope {
    let task = &mutation.task;
    let last = mutation
        .positions
        .iter()
        .find(|p| p.column_id == task.column_id)
        .is_none_or(|p| p.task_ids.last() == Some(&task.id));
    let swap = if task.position == 0 && !last { SwapStrategy::InsertAtStart } else { SwapStrategy::InsertAtEnd };
    Envelope::htmx_update(board_id, column_target(task.column_id), renderer.task_card(task), swap)
}

/// Plain card markup. Clients order cards by `data-position`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CardRenderer;

impl FragmentRenderer for CardRenderer {
    fn task_card(&self, task: &Task) -> String {
        let mut html = format!(
            r#"<article id="task-{}" class="task-card{}" data-version="{}" data-position="{}"><h3>{}</h3>"#,
            task.id,
            if task.completed { " completed" } else { "" },
            task.version,
            task.position,
            escape(&task.title),
        );
        if let Some(description) = &task.description {
            html.push_str("<p>");
            html.push_str(&escape(description));
            html.push_str("</p>");
        }
        if !task.assignee_ids.is_empty() {
            html.push_str(r#"<ul class="assignees">"#);
            for id in &task.assignee_ids {
                html.push_str(&format!(r#"<li data-user="{id}"></li>"#));
            }
            html.push_str("</ul>");
        }
        html.push_str("</article>");
        html
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
#[path = "render_test.rs"]
mod tests;
