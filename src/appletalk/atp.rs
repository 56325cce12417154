//! ATP reliable-transaction engine (spec §4.7): requester slots with
//! bitmap-driven retry, and a responder side backed by a flat socket-
//! handler table and an exactly-once (XO) response cache.

use std::collections::BTreeMap;

use crate::error::{CoreError, CoreResult};

pub const MAX_SLOTS: usize = 16;
pub const MAX_XO_CACHE: usize = 16;
pub const MAX_SOCKET_HANDLERS: usize = 8;

pub const HEADER_LEN: usize = 8;

pub const CTL_TREQ: u8 = 0x40;
pub const CTL_TRESP: u8 = 0x80;
pub const CTL_TREL: u8 = 0xC0;
pub const CTL_TYPE_MASK: u8 = 0xC0;
pub const CTL_XO: u8 = 0x20;
pub const CTL_EOM: u8 = 0x10;
pub const CTL_STS: u8 = 0x08;
pub const CTL_TREL_HINT_MASK: u8 = 0x07;

/// TRel-hint → release-timer duration table (spec §3/§4.7), indexed by the
/// 3-bit hint carried in the control byte's low bits. A hint outside 0..=4
/// falls back to the longest duration: an XO entry that outlives its TRel
/// is just wasted cache space, one that expires early breaks exactly-once.
const TREL_HINT_DELAYS_MS: [u32; 5] = [30_000, 60_000, 120_000, 240_000, 480_000];

fn xo_release_delay_ms(trel_hint: u8) -> u32 {
    TREL_HINT_DELAYS_MS.get(trel_hint as usize).copied().unwrap_or(480_000)
}

/// Outcome delivered to a requester's callback when a slot finishes or is
/// cancelled (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Timeout,
    Aborted,
}

/// Per-transaction delivery sink, supplied to [`AtpEngine::submit`].
pub trait RequesterCallbacks {
    fn on_response(&mut self, index: u8, data: &[u8], duplicate: bool);
    fn on_complete(&mut self, outcome: Outcome);
}

/// A registered responder for one socket (spec §4.7 "Responder side").
pub trait SocketHandler {
    /// Produce the data payloads of one or more response packets; the
    /// engine assigns sequence numbers and EOM/STS flags.
    fn handle_request(&mut self, requester_node: u8, requester_socket: u8, user: [u8; 4], data: &[u8]) -> Vec<Vec<u8>>;
}

/// A timer the embedding scheduler must arm or cancel; the engine tracks
/// per-slot/per-entry generations internally so a stale fire is a no-op
/// (spec §4.7 "Timers").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    ArmRetry { generation: u32, slot: u16, delay_ms: u32 },
    CancelRetry { generation: u32, slot: u16 },
    ArmXoRelease { generation: u32, key: XoKey, delay_ms: u32 },
    CancelXoRelease { generation: u32, key: XoKey },
}

/// An outbound wire packet plus the node it should be sent to; wrapping it
/// in LLAP/DDP is the caller's (ddp.rs's) job.
pub type OutPacket = Vec<u8>;

struct RequesterSlot {
    generation: u32,
    tid: u16,
    dst_node: u8,
    dst_socket: u8,
    src_socket: u8,
    outstanding: u8,
    xo: bool,
    trel_hint: u8,
    user: [u8; 4],
    request_data: Vec<u8>,
    retry_timeout_ms: u32,
    retry_limit: i32,
    retries_left: i32,
    callbacks: Box<dyn RequesterCallbacks>,
}

#[derive(Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
pub struct XoKey {
    pub tid: u16,
    pub requester_node: u8,
    pub requester_socket: u8,
    pub responder_socket: u8,
}

struct XoEntry {
    generation: u32,
    packets: Vec<Vec<u8>>,
}

#[derive(Default)]
pub struct AtpEngine {
    slots: Vec<Option<RequesterSlot>>,
    next_tid: BTreeMap<u8, u16>,
    handlers: BTreeMap<u8, Box<dyn SocketHandler>>,
    xo_cache: BTreeMap<XoKey, XoEntry>,
    xo_order: Vec<XoKey>,
    next_generation: u32,
}

impl AtpEngine {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_SLOTS).map(|_| None).collect(),
            next_tid: BTreeMap::new(),
            handlers: BTreeMap::new(),
            xo_cache: BTreeMap::new(),
            xo_order: Vec::new(),
            next_generation: 1,
        }
    }

    fn allocate_generation(&mut self) -> u32 {
        let g = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1).max(1);
        g
    }

    fn next_tid_for(&mut self, src_socket: u8) -> u16 {
        let entry = self.next_tid.entry(src_socket).or_insert(0);
        let tid = *entry;
        *entry = entry.wrapping_add(1);
        tid
    }

    pub fn register_socket(&mut self, socket: u8, handler: Box<dyn SocketHandler>) -> CoreResult<()> {
        if self.handlers.len() >= MAX_SOCKET_HANDLERS && !self.handlers.contains_key(&socket) {
            return Err(CoreError::capacity_exhausted("ATP socket handler table full"));
        }
        self.handlers.insert(socket, handler);
        Ok(())
    }

    /// Submit a new request (spec §4.7 "Requester side"). Returns the slot
    /// index, the initial TReq payload to send, and the timer action the
    /// scheduler must arm.
    #[allow(clippy::too_many_arguments)]
    pub fn submit(
        &mut self,
        dst_node: u8,
        dst_socket: u8,
        src_socket: u8,
        bitmap: u8,
        user: [u8; 4],
        data: Vec<u8>,
        xo: bool,
        trel_hint: u8,
        retry_timeout_ms: u32,
        retry_limit: i32,
        callbacks: Box<dyn RequesterCallbacks>,
    ) -> CoreResult<(u16, OutPacket, TimerAction)> {
        let slot_index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| CoreError::capacity_exhausted("ATP slot table full"))?;

        let tid = self.next_tid_for(src_socket);
        let generation = self.allocate_generation();
        let ctl = CTL_TREQ | if xo { CTL_XO | (trel_hint & CTL_TREL_HINT_MASK) } else { 0 };

        let slot = RequesterSlot {
            generation,
            tid,
            dst_node,
            dst_socket,
            src_socket,
            outstanding: bitmap,
            xo,
            trel_hint,
            user,
            request_data: data,
            retry_timeout_ms,
            retry_limit,
            retries_left: retry_limit,
            callbacks,
        };
        let packet = encode_header(ctl, bitmap, tid, user, &slot.request_data);
        self.slots[slot_index] = Some(slot);

        Ok((
            slot_index as u16,
            packet,
            TimerAction::ArmRetry { generation, slot: slot_index as u16, delay_ms: retry_timeout_ms },
        ))
    }

    /// Cancel a pending request: idempotent, fires `aborted` exactly once.
    pub fn cancel(&mut self, slot_index: u16) -> Option<TimerAction> {
        let slot_entry = self.slots.get_mut(slot_index as usize)?;
        let slot = slot_entry.take()?;
        let mut slot = slot;
        slot.callbacks.on_complete(Outcome::Aborted);
        Some(TimerAction::CancelRetry { generation: slot.generation, slot: slot_index })
    }

    /// The embedding scheduler calls this when an armed retry timer fires.
    /// Returns `None` if the fire is stale (slot freed or reused since).
    pub fn fire_retry_timeout(&mut self, generation: u32, slot_index: u16) -> Option<(OutPacket, TimerAction)> {
        let slot = self.slots.get_mut(slot_index as usize)?.as_mut()?;
        if slot.generation != generation {
            return None;
        }
        if slot.outstanding == 0 {
            return None;
        }
        if slot.retry_limit >= 0 {
            if slot.retries_left <= 0 {
                let mut freed = self.slots[slot_index as usize].take().unwrap();
                freed.callbacks.on_complete(Outcome::Timeout);
                return None;
            }
            slot.retries_left -= 1;
        }
        let ctl = CTL_TREQ | if slot.xo { CTL_XO | (slot.trel_hint & CTL_TREL_HINT_MASK) } else { 0 };
        let packet = encode_header(ctl, slot.outstanding, slot.tid, slot.user, &slot.request_data);
        let action = TimerAction::ArmRetry {
            generation: slot.generation,
            slot: slot_index,
            delay_ms: slot.retry_timeout_ms,
        };
        Some((packet, action))
    }

    /// The embedding scheduler calls this when an armed XO release timer
    /// fires; stale fires (entry already freed/reused) are ignored.
    pub fn fire_xo_release(&mut self, generation: u32, key: XoKey) {
        if let Some(entry) = self.xo_cache.get(&key) {
            if entry.generation == generation {
                self.xo_cache.remove(&key);
                self.xo_order.retain(|k| k != &key);
            }
        }
    }

    fn requester_handle_resp(&mut self, src_node: u8, src_socket: u8, dst_socket: u8, ctl: u8, tid: u16, seq: u8, data: &[u8]) -> Vec<OutPacket> {
        let eom = ctl & CTL_EOM != 0;
        let sts = ctl & CTL_STS != 0;

        let slot_index = self.slots.iter().position(|s| {
            s.as_ref().is_some_and(|slot| {
                slot.tid == tid && slot.dst_node == src_node && slot.dst_socket == src_socket && slot.src_socket == dst_socket
            })
        });
        let Some(slot_index) = slot_index else { return Vec::new() };

        let remaining = {
            let slot = self.slots[slot_index].as_mut().unwrap();
            let bit = 1u8.checked_shl(seq as u32).unwrap_or(0);
            let duplicate = slot.outstanding & bit == 0;
            if !duplicate {
                slot.outstanding &= !bit;
            }
            slot.callbacks.on_response(seq, data, duplicate);

            if eom {
                for higher in (seq + 1)..8 {
                    slot.outstanding &= !(1u8 << higher);
                }
            }
            slot.outstanding
        };

        if remaining == 0 {
            let freed = self.slots[slot_index].take().unwrap();
            let xo = freed.xo;
            let tid_local = freed.tid;
            let user = freed.user;
            let mut freed = freed;
            freed.callbacks.on_complete(Outcome::Ok);
            if xo {
                return vec![encode_header(CTL_TREL, 0, tid_local, user, &[])];
            }
            return Vec::new();
        }

        if sts {
            // Immediate resend of the remaining bitmap; the original retry
            // timer (generation unchanged) stays armed and this does not
            // consume a retry count (spec §4.7).
            let slot = self.slots[slot_index].as_ref().unwrap();
            let ctl = CTL_TREQ | if slot.xo { CTL_XO | (slot.trel_hint & CTL_TREL_HINT_MASK) } else { 0 };
            return vec![encode_header(ctl, slot.outstanding, slot.tid, slot.user, &slot.request_data)];
        }

        Vec::new()
    }

    /// Returns the response/retransmit packets plus the XO release timer
    /// the scheduler must arm: the initial arm on a cache miss, or a
    /// reschedule on a cache hit (spec §4.7 "Responder side").
    #[allow(clippy::too_many_arguments)]
    fn responder_handle_treq(
        &mut self,
        src_node: u8,
        src_socket: u8,
        dst_socket: u8,
        ctl: u8,
        bitmap: u8,
        tid: u16,
        user: [u8; 4],
        data: &[u8],
    ) -> CoreResult<(Vec<OutPacket>, Option<TimerAction>)> {
        let xo = ctl & CTL_XO != 0;
        let trel_hint = ctl & CTL_TREL_HINT_MASK;
        let key = XoKey { tid, requester_node: src_node, requester_socket: src_socket, responder_socket: dst_socket };

        if xo {
            if let Some(entry) = self.xo_cache.get(&key) {
                let selected: Vec<OutPacket> = entry
                    .packets
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| bitmap & (1 << i) != 0)
                    .map(|(_, p)| p.clone())
                    .collect();
                let generation = self.allocate_generation();
                self.xo_cache.get_mut(&key).unwrap().generation = generation;
                let timer = TimerAction::ArmXoRelease { generation, key, delay_ms: xo_release_delay_ms(trel_hint) };
                return Ok((selected, Some(timer)));
            }
        }

        let Some(handler) = self.handlers.get_mut(&dst_socket) else {
            log::info!(target: "appletalk::atp", "no ATP responder for socket {dst_socket}");
            return Ok((Vec::new(), None));
        };
        let payloads = handler.handle_request(src_node, src_socket, user, data);
        let last = payloads.len().saturating_sub(1);
        let mut packets = Vec::with_capacity(payloads.len());
        for (i, payload) in payloads.iter().enumerate() {
            let mut ctl = CTL_TRESP;
            if i == last {
                ctl |= CTL_EOM;
            }
            packets.push(encode_header(ctl, i as u8, tid, user, payload));
        }

        let mut timer = None;
        if xo {
            if self.xo_cache.len() >= MAX_XO_CACHE {
                return Err(CoreError::capacity_exhausted("ATP XO cache full"));
            }
            let generation = self.allocate_generation();
            self.xo_cache.insert(key, XoEntry { generation, packets: packets.clone() });
            self.xo_order.push(key);
            timer = Some(TimerAction::ArmXoRelease { generation, key, delay_ms: xo_release_delay_ms(trel_hint) });
        }

        Ok((packets, timer))
    }

    /// Frees the matching XO entry and returns the timer cancellation the
    /// scheduler must perform, if one was cached (spec §4.7 "An incoming
    /// TRel frees the matching XO entry and cancels its release timer").
    fn responder_handle_trel(&mut self, src_node: u8, src_socket: u8, dst_socket: u8, tid: u16) -> Option<TimerAction> {
        let key = XoKey { tid, requester_node: src_node, requester_socket: src_socket, responder_socket: dst_socket };
        let entry = self.xo_cache.remove(&key)?;
        self.xo_order.retain(|k| k != &key);
        Some(TimerAction::CancelXoRelease { generation: entry.generation, key })
    }

    /// Entry point from the DDP router for any ATP packet, whether it's a
    /// response arriving for one of our requests, a request arriving for
    /// one of our registered sockets, or a release (spec §4.7). The second
    /// element of the result is the timer action the scheduler must arm or
    /// cancel as a result of this packet, if any.
    pub fn handle_packet(
        &mut self,
        src_node: u8,
        src_socket: u8,
        dst_socket: u8,
        data: &[u8],
    ) -> CoreResult<(Vec<OutPacket>, Option<TimerAction>)> {
        if data.len() < HEADER_LEN {
            return Err(CoreError::invalid_argument("ATP packet shorter than header"));
        }
        let ctl = data[0];
        let seq_or_bitmap = data[1];
        let tid = u16::from_be_bytes([data[2], data[3]]);
        let user = [data[4], data[5], data[6], data[7]];
        let payload = &data[HEADER_LEN..];

        match ctl & CTL_TYPE_MASK {
            CTL_TREQ => self.responder_handle_treq(src_node, src_socket, dst_socket, ctl, seq_or_bitmap, tid, user, payload),
            CTL_TRESP => Ok((self.requester_handle_resp(src_node, src_socket, dst_socket, ctl, tid, seq_or_bitmap, payload), None)),
            CTL_TREL => Ok((Vec::new(), self.responder_handle_trel(src_node, src_socket, dst_socket, tid))),
            _ => Ok((Vec::new(), None)),
        }
    }
}

fn encode_header(ctl: u8, bitmap_or_seq: u8, tid: u16, user: [u8; 4], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + data.len());
    out.push(ctl);
    out.push(bitmap_or_seq);
    out.extend_from_slice(&tid.to_be_bytes());
    out.extend_from_slice(&user);
    out.extend_from_slice(data);
    out
}
