use crate::protocol::Message;
use crate::state::{ControlsState, FaultStatus, IpAddress, RealTimeData};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Signals emitted while talking to a charger.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Event {
    /// A datagram that failed header, length or checksum validation.
    Malformed(String),
    /// The charger answered with an error frame carrying this code.
    ChargerError(u8),
    /// Any valid frame.
    Message(Message),
    Heartbeat,
    PasswordChanged,
    IpResolved(IpAddress),
    FaultStatus(FaultStatus),
    RealTimeData(RealTimeData),
    ControlsState(ControlsState),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Malformed(_) => "malformed",
            Event::ChargerError(_) => "error",
            Event::Message(_) => "message",
            Event::Heartbeat => "heartbeat",
            Event::PasswordChanged => "password",
            Event::IpResolved(_) => "ip",
            Event::FaultStatus(_) => "fault-status",
            Event::RealTimeData(_) => "realtime-data",
            Event::ControlsState(_) => "controls-state",
        }
    }
}
