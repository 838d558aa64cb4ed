//! Connection finite-state machine (FSM) types.
//!
//! Only the opening half of the TCP state diagram (RFC 793 §3.2) is modelled.
//! Teardown is implicit: the emulated connection disappears with the process,
//! so there are no FIN states.
//!
//! Transitions are driven by [`crate::endpoint::Endpoint`]; this module only
//! names the states.

/// All states an emulated TCP endpoint can occupy.
///
/// ```text
///  active:   CLOSED ──SYN sent──▶ SYN_SENT ──SYN-ACK rcvd, ACK sent──▶ ESTABLISHED
///  passive:  CLOSED ──SYN rcvd, SYN-ACK sent──▶ SYN_RECEIVED ──ACK rcvd──▶ ESTABLISHED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection exists; initial state.
    #[default]
    Closed,
    /// SYN has been sent; waiting for SYN-ACK.
    SynSent,
    /// SYN received and SYN-ACK sent; waiting for the final ACK.
    SynReceived,
    /// Handshake complete; segments flow and are acknowledged.
    Established,
}

impl ConnectionState {
    /// `true` once the three-way handshake has completed.
    pub fn is_established(self) -> bool {
        self == Self::Established
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RECEIVED",
            Self::Established => "ESTABLISHED",
        };
        f.write_str(name)
    }
}
