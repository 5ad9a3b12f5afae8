//! Punch protocol messages
//!
//! A round runs over a control circuit through the relay both peers share:
//!
//! ```text
//!   initiator                         responder
//!      | -- Connect{addrs, nat} ------->  |   (request, RTT measured)
//!      | <------------- ConnectAck -----  |
//!      | -- Sync ---------------------->  |   responder dials at once
//!   wait RTT/2, dial                      |
//!      |                                  |
//!      | == Selected (direct stream) ==>  |   responder adopts that path
//!      | <===================== Ack ====  |
//!      | -- Succeeded ----------------->  |
//! ```
//!
//! `Selected` and its acknowledgement travel on a fresh stream of the
//! candidate direct connection itself, so both sides agree on exactly one
//! path even when dials crossed.

use indras_core::{DialAddress, NatType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PunchMessage {
    Connect {
        round: u32,
        addresses: Vec<DialAddress>,
        nat: NatType,
    },
    ConnectAck {
        addresses: Vec<DialAddress>,
        nat: NatType,
    },
    Sync {
        round: u32,
    },
    Selected {
        round: u32,
    },
    SelectedAck,
    Succeeded {
        round: u32,
    },
    Failed {
        round: u32,
    },
}

impl PunchMessage {
    pub fn name(&self) -> &'static str {
        match self {
            PunchMessage::Connect { .. } => "connect",
            PunchMessage::ConnectAck { .. } => "connect-ack",
            PunchMessage::Sync { .. } => "sync",
            PunchMessage::Selected { .. } => "selected",
            PunchMessage::SelectedAck => "selected-ack",
            PunchMessage::Succeeded { .. } => "succeeded",
            PunchMessage::Failed { .. } => "failed",
        }
    }
}
