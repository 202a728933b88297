use super::*;
use crate::envelope::EnvelopeType;
use crate::services::task::ColumnPositions;
use serde_json::json;

fn task() -> Task {
    Task {
        id: Uuid::new_v4(),
        board_id: Uuid::new_v4(),
        column_id: Uuid::new_v4(),
        title: "Fix <script> & \"quotes\"".into(),
        description: Some("it's broken".into()),
        position: 2,
        version: 7,
        completed: true,
        assignee_ids: vec![Uuid::new_v4()],
        sub_board_id: None,
        created_by: None,
    }
}

fn mutation(op: TaskOp) -> Mutation {
    Mutation { op, task: task(), positions: Vec::new() }
}

#[test]
fn card_escapes_user_text_and_carries_ordering_attributes() {
    let t = task();
    let html = CardRenderer.task_card(&t);
    assert!(html.starts_with(&format!(r#"<article id="task-{}""#, t.id)));
    assert!(html.contains("Fix &lt;script&gt; &amp; &quot;quotes&quot;"));
    assert!(html.contains("it&#39;s broken"));
    assert!(html.contains(r#"data-position="2""#));
    assert!(html.contains(r#"data-version="7""#));
    assert!(html.contains("task-card completed"));
}

#[test]
fn deletion_replaces_card_with_nothing() {
    let m = mutation(TaskOp::Deleted);
    let fragments = fragments_for(&CardRenderer, m.task.board_id, &m, &[]);
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].kind, EnvelopeType::HtmxUpdate);
    assert_eq!(fragments[0].data["target"], json!(task_target(m.task.id)));
    assert_eq!(fragments[0].data["html"], json!(""));
    assert_eq!(fragments[0].data["swap"], json!("replace"));
}

#[test]
fn creation_appends_to_column() {
    let m = mutation(TaskOp::Created);
    let fragments = fragments_for(&CardRenderer, m.task.board_id, &m, &[]);
    assert_eq!(fragments[0].data["target"], json!(column_target(m.task.column_id)));
    assert_eq!(fragments[0].data["swap"], json!("beforeend"));
}

#[test]
fn move_removes_then_inserts() {
    let m = mutation(TaskOp::Moved);
    let fragments = fragments_for(&CardRenderer, m.task.board_id, &m, &[]);
    assert_eq!(fragments.len(), 2);
    assert_eq!(fragments[0].data["html"], json!(""));
    assert_eq!(fragments[1].data["target"], json!(column_target(m.task.column_id)));
}

#[test]
fn field_updates_replace_card_in_place() {
    for op in [TaskOp::Updated, TaskOp::Assigned, TaskOp::Completed] {
        let m = mutation(op);
        let fragments = fragments_for(&CardRenderer, m.task.board_id, &m, &[]);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].data["target"], json!(task_target(m.task.id)));
        assert_eq!(fragments[0].data["swap"], json!("replace"));
    }
}

fn placed(base: &Task, title: &str, position: i32) -> Task {
    Task { id: Uuid::new_v4(), title: title.into(), position, version: 1, ..base.clone() }
}

#[test]
fn move_to_head_inserts_first_and_renumbers_siblings() {
    let mut moved = task();
    moved.position = 0;
    let first = placed(&moved, "first", 1);
    let second = placed(&moved, "second", 2);
    let m = Mutation {
        op: TaskOp::Moved,
        task: moved.clone(),
        positions: vec![ColumnPositions { column_id: moved.column_id, task_ids: vec![moved.id, first.id, second.id] }],
    };

    let fragments = fragments_for(&CardRenderer, moved.board_id, &m, &[first.clone(), second.clone()]);

    assert_eq!(fragments.len(), 4);
    assert_eq!(fragments[0].data["target"], json!(task_target(moved.id)));
    assert_eq!(fragments[1].data["target"], json!(column_target(moved.column_id)));
    assert_eq!(fragments[1].data["swap"], json!("afterbegin"));
    for (fragment, sibling) in fragments[2..].iter().zip([&first, &second]) {
        assert_eq!(fragment.data["target"], json!(task_target(sibling.id)));
        assert_eq!(fragment.data["swap"], json!("replace"));
        let html = fragment.data["html"].as_str().expect("html");
        assert!(html.contains(&format!(r#"data-position="{}""#, sibling.position)));
    }
}

#[test]
fn move_to_tail_appends() {
    let mut moved = task();
    moved.position = 1;
    let first = placed(&moved, "first", 0);
    let m = Mutation {
        op: TaskOp::Moved,
        task: moved.clone(),
        positions: vec![ColumnPositions { column_id: moved.column_id, task_ids: vec![first.id, moved.id] }],
    };

    let fragments = fragments_for(&CardRenderer, moved.board_id, &m, &[first]);

    assert_eq!(fragments[1].data["swap"], json!("beforeend"));
    assert_eq!(fragments.len(), 3);
}

#[test]
fn first_card_in_empty_column_is_appended() {
    let mut created = task();
    created.position = 0;
    let m = Mutation { op: TaskOp::Created, task: created.clone(), positions: Vec::new() };

    let fragments = fragments_for(&CardRenderer, created.board_id, &m, &[]);

    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].data["swap"], json!("beforeend"));
}
