//! NAT classification
//!
//! Classification comes from an external reachability collaborator. The
//! core only needs it to decide whether a hole punch can possibly work.

use serde::{Deserialize, Serialize};

/// Mapping behaviour of the NAT in front of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NatType {
    /// Not yet classified
    #[default]
    Unknown,
    /// Publicly reachable, no NAT
    Public,
    /// Same external mapping regardless of destination (cone NAT)
    EndpointIndependent,
    /// Mapping depends on destination (symmetric NAT); the most restrictive class
    AddressDependent,
}

impl NatType {
    pub fn is_most_restrictive(&self) -> bool {
        matches!(self, NatType::AddressDependent)
    }

    /// Whether an inbound dial can reach this peer without any coordination
    pub fn is_publicly_reachable(&self) -> bool {
        matches!(self, NatType::Public)
    }
}

/// Whether a hole punch between peers behind `local` and `remote` is worth attempting
///
/// Two address-dependent mappings never line up, so that pairing is
/// rejected without touching the signaling channel. Unknown classes are
/// given the benefit of the doubt.
pub fn punch_feasible(local: NatType, remote: NatType) -> bool {
    !(local.is_most_restrictive() && remote.is_most_restrictive())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_pair_is_infeasible() {
        assert!(!punch_feasible(
            NatType::AddressDependent,
            NatType::AddressDependent
        ));
    }

    #[test]
    fn test_mixed_pairs_are_feasible() {
        assert!(punch_feasible(NatType::AddressDependent, NatType::EndpointIndependent));
        assert!(punch_feasible(NatType::EndpointIndependent, NatType::EndpointIndependent));
        assert!(punch_feasible(NatType::Unknown, NatType::AddressDependent));
        assert!(punch_feasible(NatType::Public, NatType::Public));
    }
}
