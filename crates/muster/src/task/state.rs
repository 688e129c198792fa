use serde::{Deserialize, Serialize};

/// Lifecycle states of a task inside the resource manager.
///
/// Three parties advance a task: the resource manager itself (admission and
/// placement), the launch side (job manager handing tasks to the fabric) and
/// the cluster fabric (status events). The transition table below is the
/// superset of what all three may do; anything else is rejected.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Initialized,
    Pending,
    Ready,
    Placing,
    Placed,
    Launching,
    Launched,
    Starting,
    Running,
    Killing,
    Killed,
    Failed,
    Lost,
    Succeeded,
    Preempting,
    Reserved,
}

impl TaskState {
    /// States a task never leaves (FAILED leaves only through the retry
    /// policy, LOST likewise; both are handled before the table check).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Killed | TaskState::Failed | TaskState::Lost
        )
    }

    /// States in which the task occupies (or is about to occupy) a host and
    /// therefore counts into its pool's allocation.
    pub fn holds_allocation(&self) -> bool {
        matches!(
            self,
            TaskState::Ready
                | TaskState::Placing
                | TaskState::Placed
                | TaskState::Launching
                | TaskState::Launched
                | TaskState::Starting
                | TaskState::Running
                | TaskState::Killing
                | TaskState::Preempting
                | TaskState::Reserved
        )
    }

    /// States from which a kill does not need a fabric round-trip: the task
    /// has not been handed over to a host yet.
    pub fn kill_is_local(&self) -> bool {
        matches!(
            self,
            TaskState::Initialized
                | TaskState::Pending
                | TaskState::Ready
                | TaskState::Placing
                | TaskState::Placed
                | TaskState::Reserved
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The transition table. Kills out of pre-launch states jump straight to
/// KILLED (there is nothing to stop on a host); launched tasks go through
/// KILLING and wait for the fabric ack.
pub fn transition_allowed(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;
    match (from, to) {
        (Initialized, Pending) => true,
        (Pending, Ready) => true,
        (Ready, Placing) => true,
        (Ready, Pending) => true,
        (Ready, Reserved) => true,
        (Placing, Ready) => true,
        (Placing, Placed) => true,
        (Placed, Launching) => true,
        (Placed, Pending) => true,
        (Launching, Launched) => true,
        (Launching, Pending) => true,
        (Launching, Lost) => true,
        (Launched, Starting) => true,
        (Launched, Running) => true,
        (Launched, Failed) => true,
        (Launched, Lost) => true,
        (Launched, Killing) => true,
        (Starting, Running) => true,
        (Starting, Failed) => true,
        (Starting, Lost) => true,
        (Starting, Killing) => true,
        (Running, Succeeded) => true,
        (Running, Failed) => true,
        (Running, Lost) => true,
        (Running, Killing) => true,
        (Running, Preempting) => true,
        (Preempting, Killing) => true,
        (Preempting, Killed) => true,
        (Preempting, Succeeded) => true,
        (Preempting, Failed) => true,
        (Preempting, Lost) => true,
        (Killing, Killed) => true,
        (Killing, Lost) => true,
        (Failed, Pending) => true,
        (Lost, Pending) => true,
        (Reserved, Placing) => true,
        (Reserved, Ready) => true,
        // Kills of tasks that never reached a host.
        (from, Killed) if from.kill_is_local() => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskState::*;

    #[test]
    fn happy_path_is_legal() {
        let path = [
            Initialized,
            Pending,
            Ready,
            Placing,
            Placed,
            Launching,
            Launched,
            Starting,
            Running,
            Succeeded,
        ];
        for pair in path.windows(2) {
            assert!(
                transition_allowed(pair[0], pair[1]),
                "{:?} -> {:?} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn terminal_states_are_sticky() {
        for from in [Succeeded, Killed] {
            for to in [Pending, Ready, Running, Killed, Succeeded] {
                assert!(!transition_allowed(from, to), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn retry_transitions() {
        assert!(transition_allowed(Failed, Pending));
        assert!(transition_allowed(Lost, Pending));
        assert!(!transition_allowed(Succeeded, Pending));
    }

    #[test]
    fn kill_paths() {
        // Queued work dies locally.
        assert!(transition_allowed(Pending, Killed));
        assert!(transition_allowed(Placed, Killed));
        // Launched work needs a fabric round-trip.
        assert!(!transition_allowed(Running, Killed));
        assert!(transition_allowed(Running, Killing));
        assert!(transition_allowed(Killing, Killed));
        assert!(transition_allowed(Killing, Lost));
    }

    #[test]
    fn out_of_order_status_events_are_illegal() {
        assert!(!transition_allowed(Running, Placing));
        assert!(!transition_allowed(Succeeded, Running));
        assert!(!transition_allowed(Pending, Running));
    }

    #[test]
    fn preemption_path() {
        assert!(transition_allowed(Running, Preempting));
        assert!(transition_allowed(Preempting, Killing));
        // A preempted task may still finish before the kill lands.
        assert!(transition_allowed(Preempting, Succeeded));
        assert!(!transition_allowed(Pending, Preempting));
    }
}
