//! AppleTalk protocol stack (spec §4.5-4.7, components C6-C8): LLAP/DDP
//! framing, NBP name binding, and the ATP reliable-transaction engine.

pub mod atp;
pub mod ddp;
pub mod llap;
pub mod nbp;

/// This emulator's fixed node number on the LocalTalk segment (spec §6).
pub const LLAP_HOST_NODE: u8 = 33;

pub const SOCKET_AFP: u8 = 8;
pub const SOCKET_AFP_COMPAT: u8 = 54;
pub const SOCKET_PAP: u8 = 6;
pub const SOCKET_NBP: u8 = 2;
