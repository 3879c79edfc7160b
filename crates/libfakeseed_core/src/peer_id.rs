use crate::hash_id::Id20;
use rand::{Rng, RngCore};

/// Returns `None` for digits greater than 63.
fn version_digit_to_id(d: u8) -> Option<u8> {
    let version_map = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz.-";
    version_map.get(d as usize).copied()
}

/// Generate a peer id in the Azureus format, where `b"-xx1234-"` corresponds to version `1.2.3.4`
/// of the client abbreviated by `xx`. The remaining 12 bytes are random.
///
/// Version components above 63 are clamped to `-`.
pub fn generate_azureus_style(rng: &mut impl RngCore, client: [u8; 2], version: [u8; 4]) -> Id20 {
    let mut peer_id = [0u8; 20];
    peer_id[0] = b'-';
    peer_id[1..3].copy_from_slice(&client);
    for (slot, digit) in peer_id[3..7].iter_mut().zip(version) {
        *slot = version_digit_to_id(digit).unwrap_or(b'-');
    }
    peer_id[7] = b'-';
    rng.fill_bytes(&mut peer_id[8..]);
    Id20::new(peer_id)
}

/// The announce "key" lets a tracker recognize us across IP changes. One per session.
pub fn generate_key(rng: &mut impl Rng) -> u32 {
    rng.random()
}
