//! Discover loop: while the phase is Discovering, send a Discover request
//! every second and validate the challenge response. Retries forever.

use log::{debug, info, warn};

use crate::codec::Codec;
use crate::dispatcher::RequestOutcome;
use crate::protocol::{Request, ResponseCode, challenge_response_u8x4};

pub const DISCOVER_INTERVAL_US: u64 = 1_000_000;

#[derive(Debug)]
pub struct Searcher {
    enabled: bool,
    pending: bool,
    last_attempt_us: Option<u64>,
    challenge: [u8; 4],
    device_found: bool,
}

impl Searcher {
    pub fn new() -> Self {
        Searcher {
            enabled: false,
            pending: false,
            last_attempt_us: None,
            challenge: [0; 4],
            device_found: false,
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
        self.pending = false;
        self.last_attempt_us = None;
        self.device_found = false;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.pending = false;
    }

    pub fn device_found(&self) -> bool {
        self.device_found
    }

    pub fn poll(&mut self, now_us: u64, codec: &Codec) -> Option<Request> {
        if !self.enabled || self.pending || self.device_found {
            return None;
        }
        if let Some(last) = self.last_attempt_us
            && now_us.saturating_sub(last) < DISCOVER_INTERVAL_US
        {
            return None;
        }
        self.challenge = rand::random();
        self.last_attempt_us = Some(now_us);
        self.pending = true;
        codec.discover_request(self.challenge).ok()
    }

    pub fn handle(&mut self, outcome: &RequestOutcome, codec: &Codec) {
        self.pending = false;
        match outcome {
            RequestOutcome::Response(response) if response.code == ResponseCode::Ok => {
                match codec.decode_discover_response(response) {
                    Ok(payload)
                        if payload.challenge_response
                            == challenge_response_u8x4(self.challenge) =>
                    {
                        info!("device discovered");
                        self.device_found = true;
                    }
                    Ok(_) => warn!("discover challenge response mismatch, ignoring device"),
                    Err(e) => warn!("undecodable discover response: {e}"),
                }
            }
            RequestOutcome::Response(response) => {
                debug!("discover refused with {:?}", response.code)
            }
            RequestOutcome::Timeout => debug!("no device answered discover"),
            RequestOutcome::Cancelled(_) => {}
        }
    }
}

impl Default for Searcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandId, CommControlSubfn, DISCOVER_MAGIC, Response};

    fn codec() -> Codec {
        Codec::new(1, 0).unwrap()
    }

    fn good_response(request: &Request) -> Response {
        let mut data = DISCOVER_MAGIC.to_vec();
        let challenge: [u8; 4] = request.data[4..8].try_into().unwrap();
        data.extend_from_slice(&challenge_response_u8x4(challenge));
        Response {
            command: CommandId::CommControl,
            subfunction: CommControlSubfn::Discover.into(),
            code: ResponseCode::Ok,
            data,
        }
    }

    #[test]
    fn test_paced_at_one_second() {
        let mut searcher = Searcher::new();
        searcher.enable();
        let codec = codec();
        let request = searcher.poll(0, &codec).unwrap();
        assert_eq!(request.command, CommandId::CommControl);
        // nothing more until the outstanding attempt resolves
        assert!(searcher.poll(DISCOVER_INTERVAL_US * 2, &codec).is_none());

        searcher.handle(&RequestOutcome::Timeout, &codec);
        assert!(searcher.poll(DISCOVER_INTERVAL_US - 1, &codec).is_none());
        assert!(searcher.poll(DISCOVER_INTERVAL_US, &codec).is_some());
    }

    #[test]
    fn test_valid_challenge_response_finds_device() {
        let mut searcher = Searcher::new();
        searcher.enable();
        let codec = codec();
        let request = searcher.poll(0, &codec).unwrap();
        let response = good_response(&request);
        searcher.handle(&RequestOutcome::Response(response), &codec);
        assert!(searcher.device_found());
    }

    #[test]
    fn test_wrong_challenge_response_keeps_searching() {
        let mut searcher = Searcher::new();
        searcher.enable();
        let codec = codec();
        let request = searcher.poll(0, &codec).unwrap();
        let mut response = good_response(&request);
        response.data[4] ^= 0x01;
        searcher.handle(&RequestOutcome::Response(response), &codec);
        assert!(!searcher.device_found());
        // next attempt goes out after the interval
        assert!(searcher.poll(DISCOVER_INTERVAL_US, &codec).is_some());
    }

    #[test]
    fn test_challenges_are_fresh() {
        let mut searcher = Searcher::new();
        searcher.enable();
        let codec = codec();
        let mut challenges = Vec::new();
        for attempt in 0..8u64 {
            let request = searcher.poll(attempt * DISCOVER_INTERVAL_US, &codec).unwrap();
            challenges.push(request.data[4..8].to_vec());
            searcher.handle(&RequestOutcome::Timeout, &codec);
        }
        challenges.dedup();
        assert!(challenges.len() > 1, "challenge never changed");
    }
}
