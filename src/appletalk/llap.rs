//! LLAP framing (spec §4.5): 3-byte `{dst, src, type}` header, ENQ/RTS
//! handshake replies, and DDP_SHORT forwarding into the DDP router.

use super::atp::TimerAction;
use super::ddp;
use super::LLAP_HOST_NODE;
use crate::error::{CoreError, CoreResult};

pub const HEADER_LEN: usize = 3;

pub const TYPE_DDP_SHORT: u8 = 0x01;
pub const TYPE_DDP_EXTENDED: u8 = 0x02;
pub const TYPE_ENQ: u8 = 0x81;
pub const TYPE_ACK: u8 = 0x82;
pub const TYPE_RTS: u8 = 0x84;
pub const TYPE_CTS: u8 = 0x85;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LlapHeader {
    pub dst: u8,
    pub src: u8,
    pub frame_type: u8,
}

impl LlapHeader {
    pub fn parse(buf: &[u8]) -> CoreResult<Self> {
        if buf.len() < HEADER_LEN {
            return Err(CoreError::invalid_argument("LLAP frame shorter than header"));
        }
        Ok(Self { dst: buf[0], src: buf[1], frame_type: buf[2] })
    }

    fn encode(self) -> [u8; HEADER_LEN] {
        [self.dst, self.src, self.frame_type]
    }
}

/// Output of dispatching an inbound LLAP frame: zero or more full frames
/// to send back on the wire, plus any ATP timer actions the embedding
/// scheduler must arm or cancel as a result of this frame.
#[derive(Debug, Default)]
pub struct Outbox {
    pub frames: Vec<Vec<u8>>,
    pub timers: Vec<TimerAction>,
}

impl Outbox {
    fn push(&mut self, header: LlapHeader, payload: &[u8]) {
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(payload);
        self.frames.push(frame);
    }
}

/// Dispatch a single inbound LLAP frame, routing `DDP_SHORT` payloads into
/// [`ddp::handle_frame`] and synthesizing ENQ/RTS handshake replies
/// directly (spec §4.5).
pub fn handle_frame(buf: &[u8], registry: &mut super::nbp::Registry, atp: &mut super::atp::AtpEngine) -> CoreResult<Outbox> {
    let header = LlapHeader::parse(buf)?;
    let mut outbox = Outbox::default();

    if header.dst != LLAP_HOST_NODE && header.dst != 0xFF {
        return Ok(outbox);
    }

    match header.frame_type {
        TYPE_ENQ => {
            outbox.push(LlapHeader { dst: header.src, src: LLAP_HOST_NODE, frame_type: TYPE_ACK }, &[]);
        }
        TYPE_RTS => {
            outbox.push(LlapHeader { dst: header.src, src: LLAP_HOST_NODE, frame_type: TYPE_CTS }, &[]);
        }
        TYPE_CTS => {
            // Observed only; no reply or state change.
        }
        TYPE_DDP_SHORT => {
            let payload = &buf[HEADER_LEN..];
            let (replies, timers) = ddp::handle_frame(header.src, payload, registry, atp)?;
            for (dst_node, ddp_payload) in replies {
                outbox.push(LlapHeader { dst: dst_node, src: LLAP_HOST_NODE, frame_type: TYPE_DDP_SHORT }, &ddp_payload);
            }
            outbox.timers.extend(timers);
        }
        TYPE_DDP_EXTENDED => {
            return Err(CoreError::invalid_argument("DDP_EXTENDED frames are not supported"));
        }
        other => {
            log::info!(target: "appletalk::llap", "unhandled LLAP frame type {other:#04x} from node {}", header.src);
        }
    }

    Ok(outbox)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appletalk::atp::AtpEngine;
    use crate::appletalk::nbp::Registry;

    #[test]
    fn enq_produces_ack_reply() {
        let mut registry = Registry::new();
        let mut atp = AtpEngine::new();
        let frame = [LLAP_HOST_NODE, 10, TYPE_ENQ];
        let outbox = handle_frame(&frame, &mut registry, &mut atp).unwrap();
        assert_eq!(outbox.frames.len(), 1);
        assert_eq!(outbox.frames[0], vec![10, LLAP_HOST_NODE, TYPE_ACK]);
    }

    #[test]
    fn rts_produces_cts_reply() {
        let mut registry = Registry::new();
        let mut atp = AtpEngine::new();
        let frame = [LLAP_HOST_NODE, 10, TYPE_RTS];
        let outbox = handle_frame(&frame, &mut registry, &mut atp).unwrap();
        assert_eq!(outbox.frames[0], vec![10, LLAP_HOST_NODE, TYPE_CTS]);
    }

    #[test]
    fn cts_produces_no_reply() {
        let mut registry = Registry::new();
        let mut atp = AtpEngine::new();
        let frame = [LLAP_HOST_NODE, 10, TYPE_CTS];
        let outbox = handle_frame(&frame, &mut registry, &mut atp).unwrap();
        assert!(outbox.frames.is_empty());
    }

    #[test]
    fn ddp_extended_is_an_error() {
        let mut registry = Registry::new();
        let mut atp = AtpEngine::new();
        let frame = [LLAP_HOST_NODE, 10, TYPE_DDP_EXTENDED];
        assert!(handle_frame(&frame, &mut registry, &mut atp).is_err());
    }

    #[test]
    fn frame_not_addressed_to_us_is_ignored() {
        let mut registry = Registry::new();
        let mut atp = AtpEngine::new();
        let frame = [200, 10, TYPE_ENQ];
        let outbox = handle_frame(&frame, &mut registry, &mut atp).unwrap();
        assert!(outbox.frames.is_empty());
    }
}
