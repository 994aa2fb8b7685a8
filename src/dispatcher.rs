//! Priority-queued request dispatch over the half-duplex channel.
//!
//! At most one request is on the wire at a time. Completions are not
//! delivered through stored callbacks: every queued request carries an
//! origin tag, and `collect` returns terminal events the device handler
//! routes back to whichever state machine submitted the request. Each
//! request produces exactly one terminal event: a matched response, a
//! timeout, or a cancellation.

use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use log::{debug, error, warn};
use thiserror::Error;

use crate::comm::CommHandler;
use crate::protocol::{CommandId, Request, Response};
use crate::throttler::Throttler;

pub const DEFAULT_REQUEST_TIMEOUT_US: u64 = 500_000;
pub const DEFAULT_MAX_PENDING_REQUESTS: usize = 32;
pub const DEFAULT_MAX_PENDING_BYTES: usize = 256 * 1024;

/// Lower value is served first; ties are FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    High = 0,
    Normal = 1,
    Low = 2,
}

/// Identifies the state machine (or API call) a request came from, so its
/// terminal event can be routed without storing closures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTag {
    Discover,
    Connect,
    GetParams,
    Disconnect,
    Heartbeat,
    InfoPoll,
    MemoryRead,
    MemoryWrite,
    UserCommand(u32),
    ApiMemoryRead(u32),
    ApiMemoryWrite(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    SessionLost,
    LinkDown,
    /// Refused by the comm layer before any byte reached the wire.
    Rejected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Response(Response),
    Timeout,
    Cancelled(CancelReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchEvent {
    pub tag: RequestTag,
    pub outcome: RequestOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("request queue is full")]
    Full,
}

#[derive(Debug)]
struct Queued {
    priority: Priority,
    seq: u64,
    request: Request,
    tag: RequestTag,
    timeout_us: u64,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}

#[derive(Debug)]
struct InFlight {
    command: CommandId,
    subfunction: u8,
    tag: RequestTag,
    deadline_us: u64,
}

#[derive(Debug)]
pub struct RequestDispatcher {
    queue: BinaryHeap<Reverse<Queued>>,
    next_seq: u64,
    queued_bytes: usize,
    max_entries: usize,
    max_bytes: usize,
    in_flight: Option<InFlight>,
    default_timeout_us: u64,
}

impl RequestDispatcher {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        RequestDispatcher {
            queue: BinaryHeap::new(),
            next_seq: 0,
            queued_bytes: 0,
            max_entries,
            max_bytes,
            in_flight: None,
            default_timeout_us: DEFAULT_REQUEST_TIMEOUT_US,
        }
    }

    pub fn set_default_timeout(&mut self, timeout_us: u64) {
        self.default_timeout_us = timeout_us;
    }

    pub fn enqueue(
        &mut self,
        priority: Priority,
        request: Request,
        tag: RequestTag,
        timeout_override_us: Option<u64>,
    ) -> Result<(), DispatchError> {
        let size = request.data.len();
        if self.queue.len() >= self.max_entries || self.queued_bytes + size > self.max_bytes {
            return Err(DispatchError::Full);
        }
        self.queued_bytes += size;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Reverse(Queued {
            priority,
            seq,
            request,
            tag,
            timeout_us: timeout_override_us.unwrap_or(self.default_timeout_us),
        }));
        Ok(())
    }

    /// Harvest terminal events: a response matched against the outstanding
    /// request, or the outstanding request's timeout.
    pub fn collect(&mut self, now_us: u64, comm: &mut CommHandler) -> Vec<DispatchEvent> {
        let mut events = Vec::new();
        if let Some(response) = comm.pop_response() {
            match &self.in_flight {
                Some(in_flight)
                    if in_flight.command == response.command
                        && in_flight.subfunction == response.subfunction =>
                {
                    let in_flight = self.in_flight.take().unwrap();
                    debug!(
                        "response for {:?}.{} ({:?})",
                        response.command, response.subfunction, in_flight.tag
                    );
                    events.push(DispatchEvent {
                        tag: in_flight.tag,
                        outcome: RequestOutcome::Response(response),
                    });
                }
                Some(in_flight) => {
                    warn!(
                        "discarding response {:?}.{} while waiting for {:?}.{}",
                        response.command,
                        response.subfunction,
                        in_flight.command,
                        in_flight.subfunction
                    );
                }
                None => {
                    warn!(
                        "discarding unsolicited response {:?}.{}",
                        response.command, response.subfunction
                    );
                }
            }
        }
        if let Some(in_flight) = &self.in_flight
            && now_us >= in_flight.deadline_us
        {
            let in_flight = self.in_flight.take().unwrap();
            warn!("request {:?} timed out", in_flight.tag);
            events.push(DispatchEvent {
                tag: in_flight.tag,
                outcome: RequestOutcome::Timeout,
            });
        }
        events
    }

    /// Transmit the head of the queue if the channel is idle and the
    /// throttler grants the frame.
    pub fn pump(
        &mut self,
        now_us: u64,
        comm: &mut CommHandler,
        throttler: &mut Throttler,
    ) -> Vec<DispatchEvent> {
        let mut events = Vec::new();
        if self.in_flight.is_some() || !comm.idle() {
            return events;
        }
        let Some(Reverse(head)) = self.queue.peek() else {
            return events;
        };
        if !throttler.permit(head.request.size_on_wire(), now_us) {
            return events;
        }
        let Reverse(queued) = self.queue.pop().unwrap();
        self.queued_bytes -= queued.request.data.len();
        match comm.send_request(&queued.request) {
            Ok(size) => {
                debug!(
                    "transmitting {:?} ({size} bytes, priority {:?})",
                    queued.tag, queued.priority
                );
                self.in_flight = Some(InFlight {
                    command: queued.request.command,
                    subfunction: queued.request.subfunction,
                    tag: queued.tag,
                    deadline_us: now_us + queued.timeout_us,
                });
            }
            Err(e) => {
                error!("refusing to transmit {:?}: {e}", queued.tag);
                events.push(DispatchEvent {
                    tag: queued.tag,
                    outcome: RequestOutcome::Cancelled(CancelReason::Rejected),
                });
            }
        }
        events
    }

    /// Flush everything, queued and in-flight, with a cancellation event
    /// apiece.
    pub fn cancel_all(&mut self, reason: CancelReason) -> Vec<DispatchEvent> {
        let mut events = Vec::new();
        if let Some(in_flight) = self.in_flight.take() {
            events.push(DispatchEvent {
                tag: in_flight.tag,
                outcome: RequestOutcome::Cancelled(reason),
            });
        }
        for Reverse(queued) in self.queue.drain() {
            events.push(DispatchEvent {
                tag: queued.tag,
                outcome: RequestOutcome::Cancelled(reason),
            });
        }
        self.queued_bytes = 0;
        events
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.queue.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Response, ResponseCode};

    fn comm() -> CommHandler {
        let mut comm = CommHandler::new(256);
        comm.enable();
        comm
    }

    fn request(subfn: u8) -> Request {
        Request::new(CommandId::UserCommand, subfn, vec![])
    }

    fn drain_frame(comm: &mut CommHandler) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = comm.pop_data(&mut buf);
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    fn respond(comm: &mut CommHandler, subfn: u8) {
        let response = Response {
            command: CommandId::UserCommand,
            subfunction: subfn,
            code: ResponseCode::Ok,
            data: vec![],
        };
        comm.process_data(&response.to_bytes(), 0);
    }

    #[test]
    fn test_priority_order_with_fifo_ties() {
        let mut dispatcher = RequestDispatcher::new(8, 1024);
        let mut comm = comm();
        let mut throttler = Throttler::new();
        dispatcher
            .enqueue(Priority::Low, request(10), RequestTag::UserCommand(0), None)
            .unwrap();
        dispatcher
            .enqueue(Priority::High, request(20), RequestTag::UserCommand(1), None)
            .unwrap();
        dispatcher
            .enqueue(Priority::Low, request(11), RequestTag::UserCommand(2), None)
            .unwrap();

        let mut order = Vec::new();
        for _ in 0..3 {
            dispatcher.pump(0, &mut comm, &mut throttler);
            let frame = drain_frame(&mut comm);
            order.push(frame[1]);
            respond(&mut comm, frame[1]);
            dispatcher.collect(0, &mut comm);
        }
        assert_eq!(order, vec![20, 10, 11]);
    }

    #[test]
    fn test_single_request_in_flight() {
        let mut dispatcher = RequestDispatcher::new(8, 1024);
        let mut comm = comm();
        let mut throttler = Throttler::new();
        dispatcher
            .enqueue(Priority::Normal, request(1), RequestTag::Heartbeat, None)
            .unwrap();
        dispatcher
            .enqueue(Priority::Normal, request(2), RequestTag::MemoryRead, None)
            .unwrap();
        dispatcher.pump(0, &mut comm, &mut throttler);
        drain_frame(&mut comm);
        // head transmitted, second stays queued until the response arrives
        assert!(dispatcher.pump(0, &mut comm, &mut throttler).is_empty());
        assert!(!comm.is_transmitting());
        assert_eq!(dispatcher.pending_len(), 2);

        respond(&mut comm, 1);
        let events = dispatcher.collect(0, &mut comm);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tag, RequestTag::Heartbeat);
        assert!(matches!(events[0].outcome, RequestOutcome::Response(_)));
    }

    #[test]
    fn test_timeout_fires_once() {
        let mut dispatcher = RequestDispatcher::new(8, 1024);
        let mut comm = comm();
        let mut throttler = Throttler::new();
        dispatcher
            .enqueue(Priority::Normal, request(1), RequestTag::Heartbeat, None)
            .unwrap();
        dispatcher.pump(0, &mut comm, &mut throttler);
        drain_frame(&mut comm);

        assert!(dispatcher.collect(DEFAULT_REQUEST_TIMEOUT_US - 1, &mut comm).is_empty());
        let events = dispatcher.collect(DEFAULT_REQUEST_TIMEOUT_US, &mut comm);
        assert_eq!(
            events,
            vec![DispatchEvent {
                tag: RequestTag::Heartbeat,
                outcome: RequestOutcome::Timeout,
            }]
        );
        assert!(dispatcher.collect(DEFAULT_REQUEST_TIMEOUT_US + 1, &mut comm).is_empty());
    }

    #[test]
    fn test_mismatched_response_discarded() {
        let mut dispatcher = RequestDispatcher::new(8, 1024);
        let mut comm = comm();
        let mut throttler = Throttler::new();
        dispatcher
            .enqueue(Priority::Normal, request(1), RequestTag::Heartbeat, None)
            .unwrap();
        dispatcher.pump(0, &mut comm, &mut throttler);
        drain_frame(&mut comm);

        respond(&mut comm, 99);
        assert!(dispatcher.collect(0, &mut comm).is_empty());
        // the outstanding request keeps waiting for its own reply
        respond(&mut comm, 1);
        let events = dispatcher.collect(0, &mut comm);
        assert_eq!(events[0].tag, RequestTag::Heartbeat);
    }

    #[test]
    fn test_queue_caps() {
        let mut dispatcher = RequestDispatcher::new(2, 1024);
        dispatcher
            .enqueue(Priority::Normal, request(1), RequestTag::Discover, None)
            .unwrap();
        dispatcher
            .enqueue(Priority::Normal, request(2), RequestTag::Discover, None)
            .unwrap();
        assert_eq!(
            dispatcher.enqueue(Priority::Normal, request(3), RequestTag::Discover, None),
            Err(DispatchError::Full)
        );

        let mut dispatcher = RequestDispatcher::new(8, 10);
        dispatcher
            .enqueue(
                Priority::Normal,
                Request::new(CommandId::UserCommand, 1u8, vec![0; 8]),
                RequestTag::Discover,
                None,
            )
            .unwrap();
        assert_eq!(
            dispatcher.enqueue(
                Priority::Normal,
                Request::new(CommandId::UserCommand, 2u8, vec![0; 8]),
                RequestTag::Discover,
                None,
            ),
            Err(DispatchError::Full)
        );
    }

    #[test]
    fn test_cancel_all_terminates_everything_once() {
        let mut dispatcher = RequestDispatcher::new(8, 1024);
        let mut comm = comm();
        let mut throttler = Throttler::new();
        dispatcher
            .enqueue(Priority::Normal, request(1), RequestTag::Heartbeat, None)
            .unwrap();
        dispatcher
            .enqueue(Priority::Normal, request(2), RequestTag::MemoryRead, None)
            .unwrap();
        dispatcher.pump(0, &mut comm, &mut throttler);

        let events = dispatcher.cancel_all(CancelReason::SessionLost);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| matches!(
            e.outcome,
            RequestOutcome::Cancelled(CancelReason::SessionLost)
        )));
        assert!(dispatcher.is_idle());
        assert!(dispatcher.cancel_all(CancelReason::SessionLost).is_empty());
    }

    #[test]
    fn test_throttled_request_stays_queued() {
        let mut dispatcher = RequestDispatcher::new(8, 1024);
        let mut comm = comm();
        let mut throttler = Throttler::new();
        throttler.set_bitrate(8_000, 0);
        // drain the bucket
        assert!(throttler.permit(100, 0));

        dispatcher
            .enqueue(Priority::Normal, request(1), RequestTag::Heartbeat, None)
            .unwrap();
        dispatcher.pump(0, &mut comm, &mut throttler);
        assert!(!comm.is_transmitting());
        assert_eq!(dispatcher.pending_len(), 1);

        dispatcher.pump(200_000, &mut comm, &mut throttler);
        assert!(comm.is_transmitting());
    }
}
