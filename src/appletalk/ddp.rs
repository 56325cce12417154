//! DDP short-header framing and type-routing (spec §4.5/§6).

use super::atp::{AtpEngine, TimerAction};
use super::nbp::Registry;
use super::{SOCKET_AFP, SOCKET_AFP_COMPAT, SOCKET_PAP};
use crate::error::{CoreError, CoreResult};

pub const HEADER_LEN: usize = 5;
pub const MAX_DATA_SIZE: usize = 586;

pub const TYPE_NBP: u8 = 2;
pub const TYPE_ATP: u8 = 3;
pub const TYPE_AEP: u8 = 4;
pub const TYPE_RTMP: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DdpHeader {
    pub length: u16,
    pub dst_socket: u8,
    pub src_socket: u8,
    pub ddp_type: u8,
}

impl DdpHeader {
    pub fn parse(buf: &[u8]) -> CoreResult<Self> {
        if buf.len() < HEADER_LEN {
            return Err(CoreError::invalid_argument("DDP frame shorter than header"));
        }
        let length = ((buf[0] & 0x03) as u16) << 8 | buf[1] as u16;
        Ok(Self {
            length,
            dst_socket: buf[2],
            src_socket: buf[3],
            ddp_type: buf[4],
        })
    }

    fn encode(self) -> [u8; HEADER_LEN] {
        [
            ((self.length >> 8) & 0x03) as u8,
            (self.length & 0xFF) as u8,
            self.dst_socket,
            self.src_socket,
            self.ddp_type,
        ]
    }
}

/// One reply to be wrapped by the caller in an LLAP frame addressed to
/// `dst_node`.
pub type Reply = (u8, Vec<u8>);

/// Route a DDP_SHORT payload (header + data) by `ddp_type` (spec §4.5).
/// `src_node` is the LLAP source node of the enclosing frame. The second
/// element of the result carries any ATP timer action the caller's
/// scheduler must arm or cancel as a result of this frame.
pub fn handle_frame(
    src_node: u8,
    buf: &[u8],
    registry: &mut Registry,
    atp: &mut AtpEngine,
) -> CoreResult<(Vec<Reply>, Vec<TimerAction>)> {
    let header = DdpHeader::parse(buf)?;
    let data = &buf[HEADER_LEN..];

    match header.ddp_type {
        TYPE_NBP => Ok((
            registry
                .handle_packet(src_node, header.src_socket, data)?
                .into_iter()
                .map(|(dst_socket, payload)| wrap_reply(src_node, header, dst_socket, TYPE_NBP, payload))
                .collect(),
            Vec::new(),
        )),
        TYPE_ATP if matches!(header.dst_socket, SOCKET_AFP | SOCKET_AFP_COMPAT | SOCKET_PAP) => {
            let (packets, timer) = atp.handle_packet(src_node, header.src_socket, header.dst_socket, data)?;
            let replies = packets
                .into_iter()
                .map(|payload| wrap_reply(src_node, header, header.src_socket, TYPE_ATP, payload))
                .collect();
            Ok((replies, timer.into_iter().collect()))
        }
        TYPE_ATP => {
            log::info!(target: "appletalk::ddp", "ATP frame for unhandled socket {}", header.dst_socket);
            Ok((Vec::new(), Vec::new()))
        }
        TYPE_AEP => {
            let reply = wrap_reply(src_node, header, header.src_socket, TYPE_AEP, data.to_vec());
            Ok((vec![reply], Vec::new()))
        }
        TYPE_RTMP => {
            // Acknowledged minimally: an empty RTMP reply.
            Ok((vec![wrap_reply(src_node, header, header.src_socket, TYPE_RTMP, Vec::new())], Vec::new()))
        }
        other => {
            log::info!(target: "appletalk::ddp", "unhandled DDP type {other} from node {src_node}");
            Ok((Vec::new(), Vec::new()))
        }
    }
}

/// Reverse source/destination at the DDP layer, preserving the protocol
/// type (spec §4.5 "Replies reverse source/destination").
fn wrap_reply(dst_node: u8, inbound: DdpHeader, reply_dst_socket: u8, ddp_type: u8, payload: Vec<u8>) -> Reply {
    let reply_header = DdpHeader {
        length: (HEADER_LEN + payload.len()) as u16,
        dst_socket: reply_dst_socket,
        src_socket: inbound.dst_socket,
        ddp_type,
    };
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&reply_header.encode());
    frame.extend_from_slice(&payload);
    (dst_node, frame)
}
