//! Lifecycle states of a pooled instance.

/// State of a pooled instance.
///
/// There is no terminal state: a stopped instance is started again on the next
/// acquisition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum InstanceState {
    /// Not running. Tenants without a registry entry report this state.
    #[default]
    Stopped,
    /// Create/start/wait transition in flight.
    Starting,
    /// Ready for attached commands.
    Running,
    /// Stop transition in flight.
    Stopping,
}

impl InstanceState {
    /// Returns `true` while a start or stop transition is in flight.
    #[must_use]
    pub fn is_transitioning(self) -> bool {
        matches!(self, Self::Starting | Self::Stopping)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_state_display() {
        assert_eq!(format!("{}", InstanceState::Stopped), "stopped");
        assert_eq!(format!("{}", InstanceState::Starting), "starting");
        assert_eq!(format!("{}", InstanceState::Running), "running");
        assert_eq!(format!("{}", InstanceState::Stopping), "stopping");
    }

    #[test]
    fn test_transitioning_states() {
        assert_eq!(InstanceState::default(), InstanceState::Stopped);
        assert!(InstanceState::Starting.is_transitioning());
        assert!(InstanceState::Stopping.is_transitioning());
        assert!(!InstanceState::Running.is_transitioning());
        assert!(!InstanceState::Stopped.is_transitioning());
    }
}
