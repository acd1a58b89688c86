//! Fitness Machine Control Point (0x2AD9) state machine.
//!
//! Every write carries an opcode in its first byte. Opcodes other than
//! Request Control are refused until a client holds control, start/stop are
//! checked against the run state, and every accepted write yields exactly one
//! `[0x80, opcode, result]` response for the indication channel.

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::{
    error::{Result, ZwackError},
    protocol::{decode_control_request, encode_control_response, ControlRequest},
    types::{ControlOpcode, ControlSession, ControlState, DomainEvent, ResultCode},
};

/// Result of processing one control point write
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlOutcome {
    /// Opcode byte as received, echoed in the response
    pub opcode: u8,
    /// Result code for the response
    pub result: ResultCode,
    /// Event for downstream listeners, only set on success
    pub event: Option<DomainEvent>,
}

impl ControlOutcome {
    const fn rejected(opcode: u8, result: ResultCode) -> Self {
        Self {
            opcode,
            result,
            event: None,
        }
    }

    /// Response payload to indicate to the client
    #[must_use]
    pub fn response(&self) -> Bytes {
        encode_control_response(self.opcode, self.result)
    }
}

/// Apply a decoded request to a state
///
/// Returns the next state, the result code and the event to publish.
#[must_use]
pub const fn transition(
    state: ControlState,
    request: ControlRequest,
) -> (ControlState, ResultCode, Option<DomainEvent>) {
    use ControlState::{Controlled, Idle, Running};

    match (state, request) {
        (_, ControlRequest::RequestControl) => {
            (Controlled, ResultCode::Success, Some(DomainEvent::ControlAcquired))
        }
        (Idle, _) => (Idle, ResultCode::ControlNotPermitted, None),
        (_, ControlRequest::Reset) => (Idle, ResultCode::Success, Some(DomainEvent::Reset)),
        (current, ControlRequest::SetTargetPower(watts)) => (
            current,
            ResultCode::Success,
            Some(DomainEvent::TargetPowerSet(watts)),
        ),
        (Controlled, ControlRequest::StartOrResume) => {
            (Running, ResultCode::Success, Some(DomainEvent::Started))
        }
        (Running, ControlRequest::StartOrResume) => (Running, ResultCode::OperationFailed, None),
        (Running, ControlRequest::StopOrPause) => {
            (Controlled, ResultCode::Success, Some(DomainEvent::Stopped))
        }
        (Controlled, ControlRequest::StopOrPause) => {
            (Controlled, ResultCode::OperationFailed, None)
        }
        (current, ControlRequest::SetIndoorBikeSimulation(params)) => (
            current,
            ResultCode::Success,
            Some(DomainEvent::SimulationParamsSet(params)),
        ),
    }
}

/// Control point session for one peripheral
#[derive(Debug, Default)]
pub struct ControlPoint {
    state: ControlState,
}

impl ControlPoint {
    /// Create a control point with no client in control
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: ControlState::Idle,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> ControlState {
        self.state
    }

    /// Current session flags
    #[must_use]
    pub const fn session(&self) -> ControlSession {
        self.state.session()
    }

    /// Drop control and stop, as when a client (re)connects
    pub fn reset_session(&mut self) {
        if self.state != ControlState::Idle {
            info!("Control session reset from {}", self.state);
        }
        self.state = ControlState::Idle;
    }

    /// Process one control point write
    ///
    /// Control is checked before the payload is decoded, so a client without
    /// control always sees Control Not Permitted, whatever it sent.
    ///
    /// # Errors
    ///
    /// Returns [`ZwackError::Protocol`] for an empty write, which carries no
    /// opcode to answer. Every other input produces an outcome.
    pub fn handle_write(&mut self, data: &[u8]) -> Result<ControlOutcome> {
        let Some(&code) = data.first() else {
            return Err(ZwackError::Protocol(
                "Empty control point write".to_string(),
            ));
        };

        let Some(opcode) = ControlOpcode::from_u8(code) else {
            warn!("Unsupported control point opcode {code:02X}, data: {data:02X?}");
            return Ok(ControlOutcome::rejected(code, ResultCode::OpCodeNotSupported));
        };

        if opcode.requires_control() && !self.session().has_control {
            debug!("{opcode} refused: no control");
            return Ok(ControlOutcome::rejected(code, ResultCode::ControlNotPermitted));
        }

        let request = match decode_control_request(opcode, data) {
            Ok(request) => request,
            Err(e) => {
                warn!("{opcode} rejected: {e}");
                return Ok(ControlOutcome::rejected(code, ResultCode::InvalidParameter));
            }
        };

        let (next, result, event) = transition(self.state, request);
        if next != self.state {
            debug!("Control point {} -> {next}", self.state);
        }
        self.state = next;

        match event {
            Some(event) => info!("{opcode}: {event}"),
            None => debug!("{opcode}: {result} in state {}", self.state),
        }

        Ok(ControlOutcome {
            opcode: code,
            result,
            event,
        })
    }
}
