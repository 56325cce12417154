//! gestalt-core — memory, storage and AppleTalk protocol core for a classic
//! Macintosh emulator.
//!
//! Three largely independent subsystems live here:
//! - [`storage`] / [`diskimage`]: a content-addressed directory-of-blocks
//!   store backing disk images, with write-ahead rollback and a checkpoint
//!   stream protocol.
//! - [`memmap`] / [`mmu`]: a paged guest address space with inline fast-path
//!   arrays and a lazily-filled software TLB.
//! - [`appletalk`]: LLAP/DDP framing, NBP name binding, and the ATP
//!   reliable-transaction engine (including exactly-once semantics).
//!
//! [`romid`] is a small standalone helper used by the disk/boot path to
//! identify a ROM image from its checksum.

pub mod appletalk;
pub mod diskimage;
pub mod error;
pub mod memmap;
pub mod mmu;
pub mod romid;
pub mod storage;

pub use error::{CoreError, CoreResult};
