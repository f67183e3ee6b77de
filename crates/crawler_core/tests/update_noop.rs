use crawler_core::{update, Msg, SchedulerState};

#[test]
fn update_is_noop() {
    let state = SchedulerState::new();
    let (next, effects) = update(state.clone(), Msg::NoOp);

    assert_eq!(state, next);
    assert!(effects.is_empty());
}
