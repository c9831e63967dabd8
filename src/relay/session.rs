//! Pairing of one client leg with one agent leg.
//!
//! `RelaySession` is a pure state machine: each leg event returns the list of
//! actions the driver must perform, so transitions can be exercised without
//! sockets.

use bytes::Bytes;
use std::collections::VecDeque;
use uuid::Uuid;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Internal error, used when the agent leg fails.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// One relayed message, passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitDownstream,
    Ready,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    ToAgent(Frame),
    ToClient(Frame),
    /// Close the agent leg, or abandon the connect if it is still pending.
    CloseAgent,
    CloseClient(u16),
}

pub struct RelaySession {
    id: Uuid,
    state: SessionState,
    pending: VecDeque<Frame>,
    context: Option<Frame>,
}

impl RelaySession {
    /// `context` is sent once, ahead of everything else, when the agent leg
    /// comes up.
    pub fn new(context: Option<Frame>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::AwaitDownstream,
            pending: VecDeque::new(),
            context,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn on_client_frame(&mut self, frame: Frame) -> Vec<Action> {
        match self.state {
            SessionState::AwaitDownstream => {
                self.pending.push_back(frame);
                Vec::new()
            }
            SessionState::Ready => vec![Action::ToAgent(frame)],
            SessionState::Closed => Vec::new(),
        }
    }

    pub fn on_agent_frame(&mut self, frame: Frame) -> Vec<Action> {
        match self.state {
            SessionState::Ready => vec![Action::ToClient(frame)],
            _ => Vec::new(),
        }
    }

    pub fn on_downstream_ready(&mut self) -> Vec<Action> {
        if self.state != SessionState::AwaitDownstream {
            return Vec::new();
        }
        self.state = SessionState::Ready;

        let mut actions = Vec::with_capacity(self.pending.len() + 1);
        if let Some(context) = self.context.take() {
            actions.push(Action::ToAgent(context));
        }
        actions.extend(self.pending.drain(..).map(Action::ToAgent));
        actions
    }

    pub fn on_client_closed(&mut self) -> Vec<Action> {
        if self.close() {
            vec![Action::CloseAgent]
        } else {
            Vec::new()
        }
    }

    /// `code` is the agent's close code, if its close frame carried one.
    pub fn on_agent_closed(&mut self, code: Option<u16>) -> Vec<Action> {
        if self.close() {
            vec![Action::CloseClient(sanitize_close_code(code))]
        } else {
            Vec::new()
        }
    }

    pub fn on_agent_error(&mut self) -> Vec<Action> {
        if self.close() {
            vec![Action::CloseClient(CLOSE_INTERNAL_ERROR)]
        } else {
            Vec::new()
        }
    }

    fn close(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.state = SessionState::Closed;
        self.pending.clear();
        true
    }
}

/// Codes that may not appear in a close frame (1005, 1006, 1015, ...) become
/// a normal closure.
fn sanitize_close_code(code: Option<u16>) -> u16 {
    match code {
        Some(c) if (1000..=1003).contains(&c) || (1007..=1014).contains(&c) => c,
        Some(c) if (3000..=4999).contains(&c) => c,
        _ => CLOSE_NORMAL,
    }
}
