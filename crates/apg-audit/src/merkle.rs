// SPDX-License-Identifier: MIT OR Apache-2.0
//! Merkle root over record hashes.

use sha2::{Digest, Sha256};

/// Merkle root over the given hex leaf hashes.
///
/// Balanced binary tree; an odd tail is paired with itself. The empty set
/// hashes to all zeros.
#[must_use]
pub fn merkle_root(leaves: &[String]) -> String {
    if leaves.is_empty() {
        return "0".repeat(64);
    }
    let mut level: Vec<Vec<u8>> = leaves
        .iter()
        .map(|h| decode_hex(h))
        .collect();

    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            let mut hasher = Sha256::new();
            hasher.update(left);
            hasher.update(right);
            next.push(hasher.finalize().to_vec());
        }
        level = next;
    }

    level[0].iter().map(|b| format!("{b:02x}")).collect()
}

fn decode_hex(s: &str) -> Vec<u8> {
    (0..s.len())
        .step_by(2)
        .filter_map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}
