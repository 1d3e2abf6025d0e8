use crate::core::daemon::{DaemonState, can_transition};

#[test]
fn forward_transitions_are_allowed() {
    assert!(can_transition(DaemonState::Starting, DaemonState::Running));
    assert!(can_transition(DaemonState::Running, DaemonState::Draining));
    assert!(can_transition(DaemonState::Draining, DaemonState::Stopped));
}

#[test]
fn failed_startup_goes_straight_to_stopped() {
    assert!(can_transition(DaemonState::Starting, DaemonState::Stopped));
}

#[test]
fn running_cannot_skip_draining() {
    assert!(!can_transition(DaemonState::Running, DaemonState::Stopped));
    assert!(!can_transition(DaemonState::Running, DaemonState::Starting));
}

#[test]
fn stopped_is_terminal() {
    for to in [
        DaemonState::Starting,
        DaemonState::Running,
        DaemonState::Draining,
    ] {
        assert!(!can_transition(DaemonState::Stopped, to));
    }
    assert!(can_transition(DaemonState::Stopped, DaemonState::Stopped));
}
