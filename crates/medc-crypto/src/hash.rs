use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    let out = h.finalize();
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&out);
    arr
}

/// sha256(a || b) without allocating the concatenation.
pub fn sha256_concat(a: &[u8], b: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(a);
    h.update(b);
    h.finalize().into()
}

/// Short, log-safe fingerprint of public key bytes: first 8 bytes of sha256, hex.
pub fn fingerprint(pubkey_bytes: &[u8]) -> String {
    hex::encode(&sha256(pubkey_bytes)[..8])
}
