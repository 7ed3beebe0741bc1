//! Parameter-name hashing.
//!
//! Variable and parameter names in a compiled program are never compared as strings at
//! render time — every `set_param`/`set_param_delayed` call and every NOP's identity in the
//! variable prelude is resolved through this single hash. Two distinct names that hash to the
//! same float are, deliberately, the same variable: this mirrors the reference engine's
//! `str2float` and the collision risk is accepted rather than guarded against (see DESIGN.md).

use crate::constants::HASH_MAX_CHARS;

/// Fold a parameter name into the float used to identify it inside a compiled tape.
///
/// Only the first [`HASH_MAX_CHARS`] bytes contribute; longer names are truncated before
/// hashing, same as the reference hash this is ported from.
pub fn str2float(name: &str) -> f32 {
    let mut acc: f32 = 0.0;
    for (i, &byte) in name.as_bytes().iter().take(HASH_MAX_CHARS).enumerate() {
        let c = (byte as char).to_ascii_lowercase();
        acc += ((c as i32 - 'a' as i32) as f32 / 30.0) * ((1i32 << i) as f32 / 100.0);
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(str2float("freq"), str2float("freq"));
    }

    #[test]
    fn distinct_short_names_usually_differ() {
        assert_ne!(str2float("freq"), str2float("amp"));
    }

    #[test]
    fn truncates_past_max_chars() {
        let long_a = "frequency_one";
        let long_b = "frequency_two_but_same_prefix";
        // Both share the same first HASH_MAX_CHARS bytes ("frequency_"), so they collide.
        let prefix_len = HASH_MAX_CHARS;
        assert_eq!(&long_a[..prefix_len], &long_b[..prefix_len]);
        assert_eq!(str2float(long_a), str2float(long_b));
    }
}
