//! The per-device idle-mode state machine.
//!
//! Pure transitions: the coordinator feeds sink edges and timer firings
//! in, executes the returned actions (timers, keep-alive, suspend,
//! disconnect), and stores the new phase. Keeping the machine free of
//! I/O makes the single-active-timer invariant directly testable.

use std::time::Duration;

use btaudio_core::IdleMode;

/// Where a connected device is in its idle lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdlePhase {
    /// Audio is flowing.
    Playing,
    /// Sink idle, nothing to do (mode `default`).
    #[default]
    IdleDefault,
    /// Sink idle, suspend timer armed.
    PowerSavePending,
    /// Sink suspended by us.
    PowerSaved,
    /// Sink idle, keep-alive bursts active.
    KeepAlive,
    /// Sink idle, auto-disconnect timer armed.
    AutoDisconnectPending,
}

/// Side effects the coordinator must execute after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleAction {
    /// Cancel any pending suspend and auto-disconnect timer.
    CancelTimers,
    StopKeepAlive,
    StartKeepAlive,
    StartSuspendTimer(Duration),
    SuspendSink,
    StartAutoDisconnectTimer(Duration),
    Disconnect,
}

/// Per-device timing knobs, read from the persisted settings.
#[derive(Debug, Clone, Copy)]
pub struct IdleConfig {
    pub mode: IdleMode,
    pub power_save_delay: Duration,
    pub auto_disconnect_after: Duration,
}

/// Sink transitioned to running.
pub fn on_sink_running(phase: IdlePhase) -> (IdlePhase, Vec<IdleAction>) {
    let mut actions = vec![IdleAction::CancelTimers];
    if phase == IdlePhase::KeepAlive {
        // real audio takes over from the keep-alive bursts
        actions.push(IdleAction::StopKeepAlive);
    }
    (IdlePhase::Playing, actions)
}

/// Sink transitioned from running to idle (or entered idle on connect).
pub fn on_sink_idle(phase: IdlePhase, config: &IdleConfig) -> (IdlePhase, Vec<IdleAction>) {
    // a phase that already reflects this idle mode keeps its timer;
    // re-arming on every poll tick would push the deadline forever
    match (phase, config.mode) {
        (IdlePhase::PowerSavePending | IdlePhase::PowerSaved, IdleMode::PowerSave)
        | (IdlePhase::KeepAlive, IdleMode::KeepAlive)
        | (IdlePhase::AutoDisconnectPending, IdleMode::AutoDisconnect)
        | (IdlePhase::IdleDefault, IdleMode::Default) => return (phase, Vec::new()),
        _ => {}
    }
    let mut actions = vec![IdleAction::CancelTimers];
    if phase == IdlePhase::KeepAlive {
        actions.push(IdleAction::StopKeepAlive);
    }
    let next = match config.mode {
        IdleMode::Default => IdlePhase::IdleDefault,
        IdleMode::PowerSave => {
            actions.push(IdleAction::StartSuspendTimer(config.power_save_delay));
            IdlePhase::PowerSavePending
        }
        IdleMode::KeepAlive => {
            actions.push(IdleAction::StartKeepAlive);
            IdlePhase::KeepAlive
        }
        IdleMode::AutoDisconnect => {
            actions.push(IdleAction::StartAutoDisconnectTimer(
                config.auto_disconnect_after,
            ));
            IdlePhase::AutoDisconnectPending
        }
    };
    (next, actions)
}

/// The armed suspend timer fired.
pub fn on_suspend_timer(phase: IdlePhase) -> (IdlePhase, Vec<IdleAction>) {
    if phase == IdlePhase::PowerSavePending {
        (IdlePhase::PowerSaved, vec![IdleAction::SuspendSink])
    } else {
        (phase, Vec::new())
    }
}

/// The armed auto-disconnect timer fired. The disconnect keeps
/// reconnect permitted — this is not a user-initiated disconnect.
pub fn on_auto_disconnect_timer(phase: IdlePhase) -> (IdlePhase, Vec<IdleAction>) {
    if phase == IdlePhase::AutoDisconnectPending {
        (IdlePhase::IdleDefault, vec![IdleAction::Disconnect])
    } else {
        (phase, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: IdleMode) -> IdleConfig {
        IdleConfig {
            mode,
            power_save_delay: Duration::from_secs(30),
            auto_disconnect_after: Duration::from_secs(30 * 60),
        }
    }

    const ALL_PHASES: [IdlePhase; 6] = [
        IdlePhase::Playing,
        IdlePhase::IdleDefault,
        IdlePhase::PowerSavePending,
        IdlePhase::PowerSaved,
        IdlePhase::KeepAlive,
        IdlePhase::AutoDisconnectPending,
    ];

    fn starts_timer(action: &IdleAction) -> bool {
        matches!(
            action,
            IdleAction::StartSuspendTimer(_) | IdleAction::StartAutoDisconnectTimer(_)
        )
    }

    #[test]
    fn running_always_reaches_playing_and_cancels_timers() {
        for phase in ALL_PHASES {
            let (next, actions) = on_sink_running(phase);
            assert_eq!(next, IdlePhase::Playing);
            assert_eq!(actions[0], IdleAction::CancelTimers);
        }
    }

    #[test]
    fn running_stops_keepalive_only_from_keepalive_phase() {
        let (_, actions) = on_sink_running(IdlePhase::KeepAlive);
        assert!(actions.contains(&IdleAction::StopKeepAlive));
        let (_, actions) = on_sink_running(IdlePhase::PowerSavePending);
        assert!(!actions.contains(&IdleAction::StopKeepAlive));
    }

    #[test]
    fn idle_transitions_per_mode() {
        let (next, actions) = on_sink_idle(IdlePhase::Playing, &config(IdleMode::Default));
        assert_eq!(next, IdlePhase::IdleDefault);
        assert!(!actions.iter().any(starts_timer));

        let (next, actions) = on_sink_idle(IdlePhase::Playing, &config(IdleMode::PowerSave));
        assert_eq!(next, IdlePhase::PowerSavePending);
        assert!(actions.contains(&IdleAction::StartSuspendTimer(Duration::from_secs(30))));

        let (next, actions) = on_sink_idle(IdlePhase::Playing, &config(IdleMode::KeepAlive));
        assert_eq!(next, IdlePhase::KeepAlive);
        assert!(actions.contains(&IdleAction::StartKeepAlive));

        let (next, actions) = on_sink_idle(IdlePhase::Playing, &config(IdleMode::AutoDisconnect));
        assert_eq!(next, IdlePhase::AutoDisconnectPending);
        assert!(actions
            .contains(&IdleAction::StartAutoDisconnectTimer(Duration::from_secs(1800))));
    }

    #[test]
    fn repeated_idle_does_not_rearm_timers() {
        let cfg = config(IdleMode::PowerSave);
        let (phase, _) = on_sink_idle(IdlePhase::Playing, &cfg);
        let (next, actions) = on_sink_idle(phase, &cfg);
        assert_eq!(next, IdlePhase::PowerSavePending);
        assert!(actions.is_empty());
    }

    #[test]
    fn every_timer_start_is_preceded_by_cancel() {
        // the single-active-timer law: any transition that arms a timer
        // cancels existing ones first, in the same action batch
        for phase in ALL_PHASES {
            for mode in [
                IdleMode::Default,
                IdleMode::PowerSave,
                IdleMode::KeepAlive,
                IdleMode::AutoDisconnect,
            ] {
                let (_, actions) = on_sink_idle(phase, &config(mode));
                if actions.iter().any(starts_timer) {
                    assert_eq!(
                        actions[0],
                        IdleAction::CancelTimers,
                        "timer armed without cancel from {phase:?} mode {mode:?}"
                    );
                    assert_eq!(actions.iter().filter(|a| starts_timer(a)).count(), 1);
                }
            }
        }
    }

    #[test]
    fn suspend_timer_only_acts_in_pending_phase() {
        let (next, actions) = on_suspend_timer(IdlePhase::PowerSavePending);
        assert_eq!(next, IdlePhase::PowerSaved);
        assert_eq!(actions, vec![IdleAction::SuspendSink]);

        // a stale firing in any other phase is ignored
        for phase in ALL_PHASES.iter().filter(|p| **p != IdlePhase::PowerSavePending) {
            let (next, actions) = on_suspend_timer(*phase);
            assert_eq!(next, *phase);
            assert!(actions.is_empty());
        }
    }

    #[test]
    fn auto_disconnect_timer_fires_once() {
        let (next, actions) = on_auto_disconnect_timer(IdlePhase::AutoDisconnectPending);
        assert_eq!(next, IdlePhase::IdleDefault);
        assert_eq!(actions, vec![IdleAction::Disconnect]);
        let (_, actions) = on_auto_disconnect_timer(next);
        assert!(actions.is_empty());
    }

    #[test]
    fn power_saved_wakes_to_playing() {
        let (next, actions) = on_sink_running(IdlePhase::PowerSaved);
        assert_eq!(next, IdlePhase::Playing);
        assert_eq!(actions, vec![IdleAction::CancelTimers]);
    }

    #[test]
    fn mode_change_while_idle_switches_phase() {
        // settings write flips power_save -> keep_alive while idle
        let (phase, _) = on_sink_idle(IdlePhase::Playing, &config(IdleMode::PowerSave));
        let (next, actions) = on_sink_idle(phase, &config(IdleMode::KeepAlive));
        assert_eq!(next, IdlePhase::KeepAlive);
        assert_eq!(actions[0], IdleAction::CancelTimers);
        assert!(actions.contains(&IdleAction::StartKeepAlive));
    }
}
