use super::*;

fn task() -> Task {
    Task {
        id: Uuid::new_v4(),
        board_id: Uuid::new_v4(),
        column_id: Uuid::new_v4(),
        title: "Write release notes".into(),
        description: Some("draft".into()),
        position: 2,
        version: 3,
        completed: false,
        assignee_ids: Vec::new(),
        sub_board_id: None,
        created_by: None,
    }
}

#[test]
fn empty_changes_detected() {
    assert!(TaskChanges::default().is_empty());
    let changes = TaskChanges { completed: Some(true), ..TaskChanges::default() };
    assert!(!changes.is_empty());
}

#[test]
fn apply_to_touches_only_named_fields() {
    let mut t = task();
    let column = Uuid::new_v4();
    let changes = TaskChanges { column_id: Some(column), position: Some(0), ..TaskChanges::default() };
    changes.apply_to(&mut t);

    assert_eq!(t.column_id, column);
    assert_eq!(t.position, 0);
    assert_eq!(t.title, "Write release notes");
    assert_eq!(t.description.as_deref(), Some("draft"));
    assert_eq!(t.version, 3, "apply_to never bumps the version");
}

#[test]
fn apply_to_can_clear_description() {
    let mut t = task();
    let changes = TaskChanges { description: Some(None), ..TaskChanges::default() };
    changes.apply_to(&mut t);
    assert!(t.description.is_none());
}

#[test]
fn conflict_error_carries_current_state() {
    let current = task();
    let err = StoreError::Conflict { expected: 2, current: Box::new(current.clone()) };

    assert_eq!(err.error_code(), "E_CONFLICT");
    assert!(!err.retryable());
    let state = err.current_state().expect("conflict exposes current task");
    assert_eq!(state["version"], 3);
    assert_eq!(state["id"], serde_json::json!(current.id));
    assert_eq!(err.to_string(), "version conflict: expected 2, current 3");
}

#[test]
fn upstream_errors_are_retryable() {
    let err = StoreError::Unavailable("pool closed".into());
    assert_eq!(err.error_code(), "E_UPSTREAM");
    assert!(err.retryable());
    assert!(err.current_state().is_none());

    let not_found = StoreError::TaskNotFound(Uuid::new_v4());
    assert_eq!(not_found.error_code(), "E_NOT_FOUND");
    assert!(!not_found.retryable());
}

#[test]
fn presence_key_from_record() {
    let record = PresenceRecord {
        user_id: Uuid::new_v4(),
        board_id: Uuid::new_v4(),
        display_name: "Ada".into(),
        last_seen_ms: 10,
        cursor: Some(Cursor { x: 1.0, y: 2.0 }),
        focused_element: None,
        is_typing: false,
    };
    let key = record.key();
    assert_eq!(key.user_id, record.user_id);
    assert_eq!(key.board_id, record.board_id);
}
