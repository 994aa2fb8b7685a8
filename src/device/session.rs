//! Session establishment: Connect, then GetParams. A Busy device is retried
//! in place after 500 ms; any other refusal fails the submodule and the
//! device handler restarts from Discover.

use log::{debug, info, warn};

use crate::codec::{Codec, GetParamsResponse};
use crate::dispatcher::{RequestOutcome, RequestTag};
use crate::protocol::{Request, ResponseCode};

pub const CONNECT_RETRY_DELAY_US: u64 = 500_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    ConnectPending,
    RetryWait { until_us: u64 },
    ParamsDue,
    ParamsPending,
    Done,
    Failed,
}

#[derive(Debug)]
pub struct SessionInitializer {
    state: State,
    session_id: u32,
    params: Option<GetParamsResponse>,
}

impl SessionInitializer {
    pub fn new() -> Self {
        SessionInitializer {
            state: State::Idle,
            session_id: 0,
            params: None,
        }
    }

    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.session_id = 0;
        self.params = None;
    }

    pub fn failed(&self) -> bool {
        self.state == State::Failed
    }

    /// Consume the established session once both steps have completed.
    pub fn take_result(&mut self) -> Option<(u32, GetParamsResponse)> {
        if self.state != State::Done {
            return None;
        }
        self.state = State::Idle;
        Some((self.session_id, self.params.take()?))
    }

    pub fn poll(&mut self, now_us: u64, codec: &Codec) -> Option<(Request, RequestTag)> {
        match self.state {
            State::Idle => {
                self.state = State::ConnectPending;
                Some((codec.connect_request().ok()?, RequestTag::Connect))
            }
            State::RetryWait { until_us } if now_us >= until_us => {
                self.state = State::ConnectPending;
                Some((codec.connect_request().ok()?, RequestTag::Connect))
            }
            State::ParamsDue => {
                self.state = State::ParamsPending;
                Some((codec.get_params_request().ok()?, RequestTag::GetParams))
            }
            _ => None,
        }
    }

    pub fn handle_connect(&mut self, outcome: &RequestOutcome, codec: &Codec, now_us: u64) {
        if self.state != State::ConnectPending {
            return;
        }
        match outcome {
            RequestOutcome::Response(response) if response.code == ResponseCode::Ok => {
                match codec.decode_connect_response(response) {
                    Ok(payload) => {
                        info!("session {:#010X} established", payload.session_id);
                        self.session_id = payload.session_id;
                        self.state = State::ParamsDue;
                    }
                    Err(e) => {
                        warn!("undecodable connect response: {e}");
                        self.state = State::Failed;
                    }
                }
            }
            RequestOutcome::Response(response) if response.code == ResponseCode::Busy => {
                debug!("device busy, retrying connect in {CONNECT_RETRY_DELAY_US} us");
                self.state = State::RetryWait {
                    until_us: now_us + CONNECT_RETRY_DELAY_US,
                };
            }
            RequestOutcome::Response(response) => {
                warn!("connect refused with {:?}", response.code);
                self.state = State::Failed;
            }
            RequestOutcome::Timeout => {
                warn!("connect timed out");
                self.state = State::Failed;
            }
            RequestOutcome::Cancelled(_) => self.state = State::Idle,
        }
    }

    pub fn handle_params(&mut self, outcome: &RequestOutcome, codec: &Codec) {
        if self.state != State::ParamsPending {
            return;
        }
        match outcome {
            RequestOutcome::Response(response) if response.code == ResponseCode::Ok => {
                match codec.decode_get_params_response(response) {
                    Ok(params) => {
                        self.params = Some(params);
                        self.state = State::Done;
                    }
                    Err(e) => {
                        warn!("undecodable get-params response: {e}");
                        self.state = State::Failed;
                    }
                }
            }
            RequestOutcome::Response(response) => {
                warn!("get-params refused with {:?}", response.code);
                self.state = State::Failed;
            }
            RequestOutcome::Timeout => {
                warn!("get-params timed out");
                self.state = State::Failed;
            }
            RequestOutcome::Cancelled(_) => self.state = State::Idle,
        }
    }
}

impl Default for SessionInitializer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CONNECT_MAGIC, CommControlSubfn, CommandId, Response};

    fn codec() -> Codec {
        Codec::new(1, 0).unwrap()
    }

    fn connect_ok(session_id: u32) -> RequestOutcome {
        let mut data = CONNECT_MAGIC.to_vec();
        data.extend_from_slice(&session_id.to_be_bytes());
        RequestOutcome::Response(Response {
            command: CommandId::CommControl,
            subfunction: CommControlSubfn::Connect.into(),
            code: ResponseCode::Ok,
            data,
        })
    }

    fn params_ok() -> RequestOutcome {
        RequestOutcome::Response(Response {
            command: CommandId::CommControl,
            subfunction: CommControlSubfn::GetParams.into(),
            code: ResponseCode::Ok,
            data: vec![
                0x01, 0x00, 0x02, 0x00, 0x00, 0x01, 0x86, 0xA0, 0x00, 0x4C, 0x4B, 0x40, 0x00,
                0x00, 0xC3, 0x50,
            ],
        })
    }

    fn refused(subfn: CommControlSubfn, code: ResponseCode) -> RequestOutcome {
        RequestOutcome::Response(Response {
            command: CommandId::CommControl,
            subfunction: subfn.into(),
            code,
            data: vec![],
        })
    }

    #[test]
    fn test_connect_then_params() {
        let mut init = SessionInitializer::new();
        let codec = codec();

        let (request, tag) = init.poll(0, &codec).unwrap();
        assert_eq!(tag, RequestTag::Connect);
        assert_eq!(request.data, CONNECT_MAGIC.to_vec());
        assert!(init.poll(0, &codec).is_none());

        init.handle_connect(&connect_ok(0x12345678), &codec, 0);
        let (_, tag) = init.poll(0, &codec).unwrap();
        assert_eq!(tag, RequestTag::GetParams);

        init.handle_params(&params_ok(), &codec);
        let (session_id, params) = init.take_result().unwrap();
        assert_eq!(session_id, 0x12345678);
        assert_eq!(params.rx_buffer_size, 256);
        assert_eq!(params.heartbeat_timeout_us, 5_000_000);
    }

    #[test]
    fn test_busy_connect_retries_in_place() {
        let mut init = SessionInitializer::new();
        let codec = codec();
        init.poll(0, &codec).unwrap();
        init.handle_connect(
            &refused(CommControlSubfn::Connect, ResponseCode::Busy),
            &codec,
            0,
        );
        assert!(!init.failed());
        assert!(init.poll(CONNECT_RETRY_DELAY_US - 1, &codec).is_none());
        let (_, tag) = init.poll(CONNECT_RETRY_DELAY_US, &codec).unwrap();
        assert_eq!(tag, RequestTag::Connect);
    }

    #[test]
    fn test_invalid_request_fails_back_to_discover() {
        let mut init = SessionInitializer::new();
        let codec = codec();
        init.poll(0, &codec).unwrap();
        init.handle_connect(
            &refused(CommControlSubfn::Connect, ResponseCode::InvalidRequest),
            &codec,
            0,
        );
        assert!(init.failed());
        assert!(init.poll(0, &codec).is_none());
    }

    #[test]
    fn test_params_refusal_fails() {
        let mut init = SessionInitializer::new();
        let codec = codec();
        init.poll(0, &codec).unwrap();
        init.handle_connect(&connect_ok(1), &codec, 0);
        init.poll(0, &codec).unwrap();
        init.handle_params(&refused(CommControlSubfn::GetParams, ResponseCode::Busy), &codec);
        assert!(init.failed());
    }

    #[test]
    fn test_connect_timeout_fails() {
        let mut init = SessionInitializer::new();
        let codec = codec();
        init.poll(0, &codec).unwrap();
        init.handle_connect(&RequestOutcome::Timeout, &codec, 0);
        assert!(init.failed());
    }
}
