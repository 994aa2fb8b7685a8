//! Keep-alive loop for an established session. One heartbeat per third of
//! the device's heartbeat timeout, each carrying a fresh 16-bit challenge
//! that must differ from the previous one so a frozen responder replaying
//! the last answer is caught.

use log::{debug, warn};

use crate::codec::Codec;
use crate::dispatcher::RequestOutcome;
use crate::protocol::{Request, ResponseCode, challenge_response_u16};

pub const CONSECUTIVE_FAILURE_LIMIT: u32 = 3;

#[derive(Debug)]
pub struct HeartbeatGenerator {
    enabled: bool,
    session_id: u32,
    timeout_us: u64,
    last_sent_us: u64,
    last_valid_us: u64,
    sent_once: bool,
    challenge: Option<u16>,
    pending: bool,
    consecutive_failures: u32,
}

impl HeartbeatGenerator {
    pub fn new() -> Self {
        HeartbeatGenerator {
            enabled: false,
            session_id: 0,
            timeout_us: 0,
            last_sent_us: 0,
            last_valid_us: 0,
            sent_once: false,
            challenge: None,
            pending: false,
            consecutive_failures: 0,
        }
    }

    pub fn start(&mut self, session_id: u32, timeout_us: u64, now_us: u64) {
        self.enabled = true;
        self.session_id = session_id;
        self.timeout_us = timeout_us.max(1);
        self.last_valid_us = now_us;
        self.sent_once = false;
        self.challenge = None;
        self.pending = false;
        self.consecutive_failures = 0;
    }

    pub fn stop(&mut self) {
        self.enabled = false;
        self.pending = false;
    }

    fn interval_us(&self) -> u64 {
        (self.timeout_us / 3).max(1)
    }

    pub fn poll(&mut self, now_us: u64, codec: &Codec) -> Option<Request> {
        if !self.enabled || self.pending {
            return None;
        }
        if self.sent_once && now_us.saturating_sub(self.last_sent_us) < self.interval_us() {
            return None;
        }
        let challenge = self.roll_challenge();
        self.last_sent_us = now_us;
        self.sent_once = true;
        self.pending = true;
        codec.heartbeat_request(self.session_id, challenge).ok()
    }

    fn roll_challenge(&mut self) -> u16 {
        let challenge = loop {
            let candidate: u16 = rand::random();
            if Some(candidate) != self.challenge {
                break candidate;
            }
        };
        self.challenge = Some(challenge);
        challenge
    }

    pub fn handle(&mut self, outcome: &RequestOutcome, codec: &Codec, now_us: u64) {
        if !self.pending {
            return;
        }
        self.pending = false;
        let valid = match outcome {
            RequestOutcome::Response(response) if response.code == ResponseCode::Ok => {
                match codec.decode_heartbeat_response(response) {
                    Ok(payload) if payload.session_id != self.session_id => {
                        // a stale or foreign session must not refresh the deadline
                        warn!(
                            "heartbeat answered for session {:#010X}, expected {:#010X}",
                            payload.session_id, self.session_id
                        );
                        false
                    }
                    Ok(payload) => {
                        let expected = challenge_response_u16(self.challenge.unwrap_or(0));
                        if payload.challenge_response == expected {
                            true
                        } else {
                            warn!("heartbeat challenge response mismatch");
                            false
                        }
                    }
                    Err(e) => {
                        warn!("undecodable heartbeat response: {e}");
                        false
                    }
                }
            }
            RequestOutcome::Response(response) => {
                warn!("heartbeat refused with {:?}", response.code);
                false
            }
            RequestOutcome::Timeout => {
                debug!("heartbeat timed out");
                false
            }
            RequestOutcome::Cancelled(_) => return,
        };
        if valid {
            self.last_valid_us = now_us;
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
    }

    /// The session is gone after three consecutive bad beats or a full
    /// heartbeat timeout without a valid reply.
    pub fn session_lost(&self, now_us: u64) -> bool {
        self.enabled
            && (self.consecutive_failures >= CONSECUTIVE_FAILURE_LIMIT
                || now_us.saturating_sub(self.last_valid_us) > self.timeout_us)
    }
}

impl Default for HeartbeatGenerator {
    fn default() -> Self {
        Self::new()
    }
}
