// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Base conversion for diagnostic reports.

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Renders `value` in `radix` (2..=36). Out-of-range radices fall back to decimal.
pub fn to_radix(value: u64, radix: u32) -> String {
    if !(2..=36).contains(&radix) {
        return value.to_string();
    }
    if value == 0 {
        return "0".to_string();
    }
    let radix = u64::from(radix);
    let mut digits = Vec::new();
    let mut rest = value;
    while rest > 0 {
        digits.push(DIGITS[(rest % radix) as usize]);
        rest /= radix;
    }
    digits.reverse();
    // Only ASCII digits were pushed.
    digits.into_iter().map(char::from).collect()
}

/// Parses a string produced by [`to_radix`].
pub fn parse_radix(text: &str, radix: u32) -> Option<u64> {
    if !(2..=36).contains(&radix) {
        return None;
    }
    u64::from_str_radix(text, radix).ok()
}

/// Conventional prefix for a radix (`0x`, `0o`, `0b`), empty otherwise.
pub fn prefix(radix: u32) -> &'static str {
    match radix {
        16 => "0x",
        8 => "0o",
        2 => "0b",
        _ => "",
    }
}
