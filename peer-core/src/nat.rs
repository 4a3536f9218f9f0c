//! NAT traversal state machine.
//!
//! ```text
//! Idle -> Probing -> Mapped
//!            |
//!            +-> Unmapped -> RelayOnly
//! ```
//!
//! The node's driver performs the port-mapping requests and reachability
//! checks; this module only decides what to do next. A renewal failure
//! demotes `Mapped` to `RelayOnly` and never emits an action that touches
//! established sessions.

use crate::address_book::CandidatePolicy;
use peer_types::Endpoint;
use std::time::Duration;

/// Shortest delay before a renewal, whatever lease the gateway granted.
pub const MIN_RENEWAL: Duration = Duration::from_secs(1);

/// Where the node stands with respect to external reachability.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NatState {
    /// Not started.
    #[default]
    Idle,
    /// Waiting for a port-mapping reply.
    Probing,
    /// The gateway granted an external mapping.
    Mapped {
        /// Externally reachable endpoint.
        external: Endpoint,
        /// Granted lease.
        lease: Duration,
    },
    /// Mapping failed; waiting for the reachability check.
    Unmapped,
    /// Direct traversal given up; relay candidates preferred.
    RelayOnly,
}

/// Inputs to the NAT state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatEvent {
    /// Begin (or retry) traversal.
    Start,
    /// The gateway granted or renewed a mapping.
    MappingSucceeded {
        /// Externally reachable endpoint.
        external: Endpoint,
        /// Granted lease.
        lease: Duration,
    },
    /// The gateway refused or is absent.
    MappingFailed {
        /// Human-readable cause, for logs.
        reason: String,
    },
    /// No mapping reply within the probing timeout.
    MappingTimedOut,
    /// Result of the external reachability check; `None` if it failed.
    ReachabilityObserved {
        /// Address a registry observed us connecting from.
        observed: Option<Endpoint>,
    },
    /// Half the lease has elapsed.
    RenewalDue,
    /// Shut down traversal.
    Stop,
}

/// Side effects the driver must perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatAction {
    /// Ask the gateway for a mapping (also used for renewal).
    RequestMapping,
    /// Register the mapped address with the address book.
    RegisterExternal {
        /// Externally reachable endpoint.
        endpoint: Endpoint,
        /// Lifetime of the registration.
        ttl: Duration,
    },
    /// Drop the mapped address from the address book.
    WithdrawExternal,
    /// Run one external reachability check.
    CheckReachability,
    /// Register an observed address as a relay candidate.
    RegisterRelayCandidate {
        /// Observed endpoint.
        endpoint: Endpoint,
    },
    /// Fire `RenewalDue` after the given delay.
    ScheduleRenewal {
        /// Delay until renewal.
        after: Duration,
    },
    /// Switch the connection manager to relay candidates.
    PreferRelay,
    /// Allow direct candidates again.
    PreferDirect,
}

impl NatState {
    /// Create a machine in `Idle`.
    pub fn new() -> Self {
        Self::Idle
    }

    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(self, event: NatEvent) -> (Self, Vec<NatAction>) {
        match (self, event) {
            (_, NatEvent::Stop) => (Self::Idle, vec![NatAction::WithdrawExternal]),

            (Self::Idle | Self::RelayOnly, NatEvent::Start) => {
                (Self::Probing, vec![NatAction::RequestMapping])
            }

            // A zero lease maps nothing.
            (state @ (Self::Probing | Self::Mapped { .. }), NatEvent::MappingSucceeded { lease, .. })
                if lease.is_zero() =>
            {
                state.on_event(NatEvent::MappingFailed {
                    reason: "gateway granted a zero lease".to_string(),
                })
            }
            (Self::Probing | Self::Mapped { .. }, NatEvent::MappingSucceeded { external, lease }) => {
                let actions = vec![
                    NatAction::RegisterExternal {
                        endpoint: external.clone(),
                        ttl: lease,
                    },
                    NatAction::PreferDirect,
                    NatAction::ScheduleRenewal {
                        after: (lease / 2).max(MIN_RENEWAL),
                    },
                ];
                (Self::Mapped { external, lease }, actions)
            }
            (Self::Probing, NatEvent::MappingFailed { .. } | NatEvent::MappingTimedOut) => (
                Self::Unmapped,
                vec![NatAction::PreferRelay, NatAction::CheckReachability],
            ),

            (Self::Unmapped, NatEvent::ReachabilityObserved { observed }) => {
                let actions = observed
                    .map(|endpoint| vec![NatAction::RegisterRelayCandidate { endpoint }])
                    .unwrap_or_default();
                (Self::RelayOnly, actions)
            }

            (state @ Self::Mapped { .. }, NatEvent::RenewalDue) => {
                (state, vec![NatAction::RequestMapping])
            }
            (Self::Mapped { .. }, NatEvent::MappingFailed { .. } | NatEvent::MappingTimedOut) => (
                Self::RelayOnly,
                vec![NatAction::WithdrawExternal, NatAction::PreferRelay],
            ),

            (state, _) => (state, vec![]),
        }
    }

    /// Which candidates the connection manager should dial in this state.
    pub fn candidate_policy(&self) -> CandidatePolicy {
        match self {
            Self::Unmapped | Self::RelayOnly => CandidatePolicy::RelayOnly,
            Self::Idle | Self::Probing | Self::Mapped { .. } => CandidatePolicy::Direct,
        }
    }

    /// Short label for logs and status output.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Probing => "probing",
            Self::Mapped { .. } => "mapped",
            Self::Unmapped => "unmapped",
            Self::RelayOnly => "relay-only",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn external() -> Endpoint {
        Endpoint::tcp("203.0.113.10", 41000)
    }

    #[test]
    fn start_begins_probing() {
        let (state, actions) = NatState::new().on_event(NatEvent::Start);
        assert_eq!(state, NatState::Probing);
        assert_eq!(actions, vec![NatAction::RequestMapping]);
    }

    #[test]
    fn mapping_success_registers_and_schedules_renewal() {
        let (state, actions) = NatState::Probing.on_event(NatEvent::MappingSucceeded {
            external: external(),
            lease: Duration::from_secs(7200),
        });

        assert!(matches!(state, NatState::Mapped { .. }));
        assert_eq!(state.candidate_policy(), CandidatePolicy::Direct);
        assert!(actions.contains(&NatAction::RegisterExternal {
            endpoint: external(),
            ttl: Duration::from_secs(7200),
        }));
        assert!(actions.contains(&NatAction::ScheduleRenewal {
            after: Duration::from_secs(3600)
        }));
    }

    #[test]
    fn mapping_failure_walks_to_relay_only() {
        let (state, actions) = NatState::new().on_event(NatEvent::Start);
        assert_eq!(actions, vec![NatAction::RequestMapping]);

        let (state, actions) = state.on_event(NatEvent::MappingFailed {
            reason: "gateway refused".into(),
        });
        assert_eq!(state, NatState::Unmapped);
        assert_eq!(state.candidate_policy(), CandidatePolicy::RelayOnly);
        assert!(actions.contains(&NatAction::CheckReachability));

        let observed = Endpoint::tcp("198.51.100.3", 9999);
        let (state, actions) = state.on_event(NatEvent::ReachabilityObserved {
            observed: Some(observed.clone()),
        });
        assert_eq!(state, NatState::RelayOnly);
        assert_eq!(state.candidate_policy(), CandidatePolicy::RelayOnly);
        assert_eq!(actions, vec![NatAction::RegisterRelayCandidate { endpoint: observed }]);
    }

    #[test]
    fn timeout_is_treated_as_failure() {
        let (state, _) = NatState::Probing.on_event(NatEvent::MappingTimedOut);
        assert_eq!(state, NatState::Unmapped);

        let (state, actions) = state.on_event(NatEvent::ReachabilityObserved { observed: None });
        assert_eq!(state, NatState::RelayOnly);
        assert!(actions.is_empty());
    }

    #[test]
    fn renewal_failure_demotes_without_session_actions() {
        let mapped = NatState::Mapped {
            external: external(),
            lease: Duration::from_secs(60),
        };

        let (state, actions) = mapped.on_event(NatEvent::RenewalDue);
        assert_eq!(actions, vec![NatAction::RequestMapping]);

        let (state, actions) = state.on_event(NatEvent::MappingFailed {
            reason: "lease refused".into(),
        });
        assert_eq!(state, NatState::RelayOnly);
        assert_eq!(actions, vec![NatAction::WithdrawExternal, NatAction::PreferRelay]);
    }

    #[test]
    fn renewal_success_stays_mapped() {
        let mapped = NatState::Mapped {
            external: external(),
            lease: Duration::from_secs(60),
        };
        let (state, actions) = mapped.on_event(NatEvent::MappingSucceeded {
            external: external(),
            lease: Duration::from_secs(120),
        });
        assert_eq!(
            state,
            NatState::Mapped {
                external: external(),
                lease: Duration::from_secs(120)
            }
        );
        assert!(actions.contains(&NatAction::ScheduleRenewal {
            after: Duration::from_secs(60)
        }));
    }

    #[test]
    fn relay_only_can_retry_and_stop_resets() {
        let (state, _) = NatState::RelayOnly.on_event(NatEvent::Start);
        assert_eq!(state, NatState::Probing);

        let (state, actions) = state.on_event(NatEvent::Stop);
        assert_eq!(state, NatState::Idle);
        assert_eq!(actions, vec![NatAction::WithdrawExternal]);
    }

    #[test]
    fn zero_lease_is_a_mapping_failure() {
        let (state, actions) = NatState::Probing.on_event(NatEvent::MappingSucceeded {
            external: external(),
            lease: Duration::ZERO,
        });
        assert_eq!(state, NatState::Unmapped);
        assert!(actions.contains(&NatAction::CheckReachability));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, NatAction::ScheduleRenewal { .. })));

        let mapped = NatState::Mapped {
            external: external(),
            lease: Duration::from_secs(60),
        };
        let (state, actions) = mapped.on_event(NatEvent::MappingSucceeded {
            external: external(),
            lease: Duration::ZERO,
        });
        assert_eq!(state, NatState::RelayOnly);
        assert_eq!(actions, vec![NatAction::WithdrawExternal, NatAction::PreferRelay]);
    }

    #[test]
    fn short_lease_renewal_is_clamped() {
        let (_, actions) = NatState::Probing.on_event(NatEvent::MappingSucceeded {
            external: external(),
            lease: Duration::from_secs(1),
        });
        assert!(actions.contains(&NatAction::ScheduleRenewal { after: MIN_RENEWAL }));
    }

    #[test]
    fn unexpected_events_are_ignored() {
        let (state, actions) = NatState::Idle.on_event(NatEvent::RenewalDue);
        assert_eq!(state, NatState::Idle);
        assert!(actions.is_empty());

        let (state, actions) = NatState::RelayOnly.on_event(NatEvent::MappingTimedOut);
        assert_eq!(state, NatState::RelayOnly);
        assert!(actions.is_empty());
    }
}
