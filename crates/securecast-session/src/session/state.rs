//! Session lifecycle states

use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`PeerSession`](crate::peer::PeerSession)
///
/// ```text
/// idle ──► offer_created ──► answer_created ──► channel_open ──► closed
///   │            │                 ▲   │              │            ▲
///   └────────────┼─────────────────┘   │              │            │
///                └──────────► failed ◄─┴──────────────┘ ───────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Connection created, nothing negotiated yet
    Idle,
    /// Local offer produced, waiting for the remote answer
    OfferCreated,
    /// Both descriptors applied, waiting for the channel to open
    AnswerCreated,
    /// Data channel open, session usable
    ChannelOpen,
    /// Negotiation or connection failed
    Failed,
    /// Session torn down
    Closed,
}

impl SessionState {
    /// `failed` and `closed` end the lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (*self, next) {
            (Idle, OfferCreated) | (Idle, AnswerCreated) => true,
            (OfferCreated, AnswerCreated) => true,
            (AnswerCreated, ChannelOpen) => true,
            (ChannelOpen, Closed) | (Failed, Closed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::OfferCreated => "offer_created",
            SessionState::AnswerCreated => "answer_created",
            SessionState::ChannelOpen => "channel_open",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the handshake a session was created on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeRole {
    Offerer,
    Answerer,
}

#[cfg(test)]
mod tests {
    use super::SessionState::*;
    use super::*;

    const ALL: [SessionState; 6] = [Idle, OfferCreated, AnswerCreated, ChannelOpen, Failed, Closed];

    #[test]
    fn test_forward_path() {
        assert!(Idle.can_transition_to(OfferCreated));
        assert!(OfferCreated.can_transition_to(AnswerCreated));
        assert!(AnswerCreated.can_transition_to(ChannelOpen));
        assert!(ChannelOpen.can_transition_to(Closed));
    }

    #[test]
    fn test_answerer_skips_offer_created() {
        assert!(Idle.can_transition_to(AnswerCreated));
    }

    #[test]
    fn test_no_backwards_moves() {
        assert!(!OfferCreated.can_transition_to(Idle));
        assert!(!ChannelOpen.can_transition_to(AnswerCreated));
        assert!(!AnswerCreated.can_transition_to(OfferCreated));
        assert!(!OfferCreated.can_transition_to(ChannelOpen));
    }

    #[test]
    fn test_failed_reachable_from_non_terminal() {
        for state in ALL {
            assert_eq!(state.can_transition_to(Failed), !state.is_terminal(), "{}", state);
        }
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        for next in ALL {
            assert!(!Closed.can_transition_to(next), "closed -> {}", next);
            assert_eq!(Failed.can_transition_to(next), next == Closed, "failed -> {}", next);
        }
    }

    #[test]
    fn test_display_matches_serde() {
        let json = serde_json::to_string(&AnswerCreated).unwrap();
        assert_eq!(json, "\"answer_created\"");
        assert_eq!(AnswerCreated.to_string(), "answer_created");
    }
}
