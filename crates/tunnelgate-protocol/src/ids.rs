//! Identifier generators (spec §4.B).
//!
//! All three generators draw from `rand`'s thread-local CSPRNG rather than
//! the teacher's clock-seeded counters (`relay/src/tunnel.rs` built tunnel
//! ids from a timestamp and an atomic counter) — the registry needs
//! identifiers an attacker cannot predict or collide deliberately, not just
//! ones that are unique under normal operation.

use rand::Rng;

use crate::error::GatewayError;

const SUBDOMAIN_LEN: usize = 8;
const REQUEST_ID_LEN: usize = 16;
const TUNNEL_ID_LEN: usize = 12;

const LOWER_ALNUM: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const LOWER_HEX: &[u8] = b"0123456789abcdef";
const MIXED_ALNUM: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// How many times to retry on collision before giving up (spec §4.C: the
/// registry reports `SUBDOMAIN_TAKEN` rather than retry forever).
const MAX_ATTEMPTS: usize = 16;

fn random_string(alphabet: &[u8], len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
        .collect()
}

/// Draw a lowercase-alphanumeric subdomain candidate, 8 characters.
pub fn subdomain_candidate() -> String {
    random_string(LOWER_ALNUM, SUBDOMAIN_LEN)
}

/// Draw a lowercase-hex request id candidate, 16 characters.
pub fn request_id_candidate() -> String {
    random_string(LOWER_HEX, REQUEST_ID_LEN)
}

/// Draw a mixed-case-alphanumeric tunnel id candidate, 12 characters.
pub fn tunnel_id_candidate() -> String {
    random_string(MIXED_ALNUM, TUNNEL_ID_LEN)
}

/// Generate a fresh value using `candidate`, retrying while `is_taken`
/// reports a collision, up to [`MAX_ATTEMPTS`]. `is_taken` is consulted
/// against the caller's live index each attempt, not cached, so a concurrent
/// registration racing the same candidate is still caught.
pub fn generate_unique(
    candidate: impl Fn() -> String,
    is_taken: impl Fn(&str) -> bool,
    exhausted: GatewayError,
) -> Result<String, GatewayError> {
    for _ in 0..MAX_ATTEMPTS {
        let id = candidate();
        if !is_taken(&id) {
            return Ok(id);
        }
    }
    Err(exhausted)
}
