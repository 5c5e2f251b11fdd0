//! Small reusable utilities shared across the proxy.

pub mod json;
pub mod url;

/// True if every argument is non-empty after trimming.
pub fn all_not_empty(values: &[&str]) -> bool {
    values.iter().all(|v| !v.trim().is_empty())
}

/// True if any argument is empty after trimming.
pub fn any_empty(values: &[&str]) -> bool {
    values.iter().any(|v| v.trim().is_empty())
}

/// Generates `len` random lowercase hex characters, used for synthetic
/// `PlaySessionId` values (§4.M).
pub fn random_hex(len: usize) -> String {
    use rand::Rng;
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::rng();
    (0..len).map(|_| HEX[rng.random_range(0..16)] as char).collect()
}
