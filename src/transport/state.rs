//! Transport lifecycle states and their derived predicates.
//!
//! ```text
//!  RawOpen ──────────────┬──> RawEofReceived ─────────────────────────┐
//!     │                  │                                            │
//!     │ start_tls        │                                            v
//!     v                  │                                         Closed
//!  TlsHandshaking ──> TlsOpen ──> TlsEofReceived ──> TlsShuttingDown ─┤
//!                        └─────────────────────────────┘       │      │
//!                                                              v      │
//!                                                         TlsShutDown ┘
//! ```
//!
//! Transitions only move forward; `Closed` is reachable from every state and
//! has no way out.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    RawOpen,
    RawEofReceived,
    TlsHandshaking,
    TlsOpen,
    TlsEofReceived,
    TlsShuttingDown,
    TlsShutDown,
    Closed,
}

impl TransportState {
    pub fn eof_received(self) -> bool {
        matches!(self, Self::RawEofReceived | Self::TlsEofReceived)
    }

    pub fn tls_started(self) -> bool {
        matches!(
            self,
            Self::TlsHandshaking
                | Self::TlsOpen
                | Self::TlsEofReceived
                | Self::TlsShuttingDown
                | Self::TlsShutDown
        )
    }

    pub fn tls_handshaking(self) -> bool {
        self == Self::TlsHandshaking
    }

    /// Half-open transports (peer sent EOF, we kept our side) stay writable.
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            Self::RawOpen | Self::RawEofReceived | Self::TlsOpen | Self::TlsEofReceived
        )
    }

    pub fn is_open(self) -> bool {
        matches!(
            self,
            Self::RawOpen
                | Self::RawEofReceived
                | Self::TlsHandshaking
                | Self::TlsOpen
                | Self::TlsEofReceived
        )
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: TransportState) -> bool {
        use TransportState::*;
        if next == Closed {
            return self != Closed;
        }
        matches!(
            (self, next),
            (RawOpen, RawEofReceived)
                | (RawOpen, TlsHandshaking)
                | (TlsHandshaking, TlsOpen)
                | (TlsOpen, TlsEofReceived)
                | (TlsOpen, TlsShuttingDown)
                | (TlsEofReceived, TlsShuttingDown)
                | (TlsShuttingDown, TlsShutDown)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TransportState::*;

    const ALL: [TransportState; 8] = [
        RawOpen,
        RawEofReceived,
        TlsHandshaking,
        TlsOpen,
        TlsEofReceived,
        TlsShuttingDown,
        TlsShutDown,
        Closed,
    ];

    #[test]
    fn test_writable_states() {
        let writable: Vec<_> = ALL.iter().copied().filter(|s| s.is_writable()).collect();
        assert_eq!(writable, vec![RawOpen, RawEofReceived, TlsOpen, TlsEofReceived]);
    }

    #[test]
    fn test_closed_is_terminal() {
        for state in ALL {
            assert!(!Closed.can_transition_to(state));
        }
        assert!(!Closed.is_open());
        assert!(!Closed.is_writable());
    }

    #[test]
    fn test_every_live_state_can_close() {
        for state in ALL.iter().copied().filter(|s| *s != Closed) {
            assert!(state.can_transition_to(Closed), "{state:?} -> Closed");
        }
    }

    #[test]
    fn test_no_state_is_revisited() {
        // Walk every legal path and make sure no state repeats.
        fn walk(path: &mut Vec<TransportState>) {
            let current = *path.last().unwrap();
            for next in ALL {
                if current.can_transition_to(next) {
                    assert!(!path.contains(&next), "revisited {next:?} via {path:?}");
                    path.push(next);
                    walk(path);
                    path.pop();
                }
            }
        }
        walk(&mut vec![RawOpen]);
    }

    #[test]
    fn test_handshake_only_entered_from_raw_open() {
        for state in ALL {
            assert_eq!(state.can_transition_to(TlsHandshaking), state == RawOpen);
        }
    }

    #[test]
    fn test_tls_predicates() {
        assert!(TlsHandshaking.tls_handshaking());
        assert!(TlsHandshaking.tls_started());
        assert!(!TlsHandshaking.is_writable());
        assert!(!RawOpen.tls_started());
        assert!(TlsShutDown.tls_started());
        assert!(!TlsShuttingDown.is_open());
        assert!(TlsEofReceived.eof_received());
        assert!(RawEofReceived.eof_received());
        assert!(!TlsOpen.eof_received());
    }
}
