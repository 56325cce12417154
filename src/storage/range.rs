//! Range-file naming: encode/decode the `XXXXXXXX.dat` base-16-log naming
//! scheme from spec §3/§6.
//!
//! A range file covers `16^level` blocks starting at an aligned base LBA.
//! Its name is the base LBA as eight uppercase hex digits with the lowest
//! `level` digits replaced by `X`.

/// Highest level this engine will ever create or recognize, regardless of
/// block count (spec §3, I-S3 / §6).
pub const ABSOLUTE_MAX_LEVEL: u8 = 8;

/// Span, in blocks, of a range file at `level`.
pub fn span(level: u8) -> u64 {
    16u64.pow(level as u32)
}

/// Largest level `k` with `16^k <= block_count`, capped at 8.
pub fn max_level_for(block_count: u32) -> u8 {
    let mut level = 0u8;
    while level < ABSOLUTE_MAX_LEVEL && span(level + 1) <= block_count as u64 {
        level += 1;
    }
    level
}

/// Base LBA of the range file at `level` that covers `lba`.
pub fn base_for(lba: u32, level: u8) -> u32 {
    let span = span(level);
    lba - (lba % span as u32)
}

/// `<base>.dat` filename for a range file, per spec §3/§6.
pub fn filename(base: u32, level: u8) -> String {
    let hex = format!("{:08X}", base);
    let keep = 8 - level as usize;
    format!("{}{}.dat", &hex[..keep], "X".repeat(level as usize))
}

/// `<lba>.pre` filename for a rollback preimage, per spec §6.
pub fn rollback_filename(lba: u32) -> String {
    format!("{:08X}.pre", lba)
}

/// Parse a `.dat` filename back into `(base, level)`. Returns `None` for
/// anything that isn't exactly 8 hex-or-`X` characters followed by `.dat`,
/// with `X`s confined to a trailing run (interior `X` or lowercase hex is
/// rejected, matching the bit-exact on-disk format).
pub fn parse_dat_filename(name: &str) -> Option<(u32, u8)> {
    let stem = name.strip_suffix(".dat")?;
    if stem.len() != 8 {
        return None;
    }
    let level = stem.chars().rev().take_while(|&c| c == 'X').count();
    if level > ABSOLUTE_MAX_LEVEL as usize {
        return None;
    }
    let prefix = &stem[..8 - level];
    if !prefix.chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)) {
        return None;
    }
    let padded = format!("{}{}", prefix, "0".repeat(level));
    let base = u32::from_str_radix(&padded, 16).ok()?;
    Some((base, level as u8))
}

/// Parse a `.pre` filename back into an LBA.
pub fn parse_pre_filename(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(".pre")?;
    if stem.len() != 8 {
        return None;
    }
    if !stem.chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)) {
        return None;
    }
    u32::from_str_radix(stem, 16).ok()
}
