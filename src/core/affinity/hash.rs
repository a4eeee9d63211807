use twox_hash::XxHash64;

/// Token stored in the affinity cookie or header for a destination.
///
/// xxHash64 (seed 0) over the UTF-16LE bytes of the upper-cased id, as 16 lowercase hex
/// digits. Stable across restarts and independent of the id's casing.
pub fn affinity_key(destination_id: &str) -> String {
    let bytes: Vec<u8> = destination_id
        .chars()
        .map(upper_invariant)
        .collect::<String>()
        .encode_utf16()
        .flat_map(u16::to_le_bytes)
        .collect();

    format!("{:016x}", XxHash64::oneshot(0, &bytes))
}

// Only one-to-one case mappings apply; characters that expand (e.g. 'ß') stay as they are.
fn upper_invariant(c: char) -> char {
    let mut upper = c.to_uppercase();
    match (upper.next(), upper.next()) {
        (Some(u), None) => u,
        _ => c,
    }
}
