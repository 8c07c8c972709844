/// Max Resp Code / QQIC values below this are linear.
const LINEAR_LIMIT: u8 = 128;

/// Unit of Max Resp Code (1/10 second) in milliseconds.
const UNIT_MS: u64 = 100;

/// Largest code; every larger duration saturates to it.
pub const MAX_CODE: u8 = 0xff;

fn float_units(exp: u8, mant: u8) -> u64 {
    ((mant as u64) | 0x10) << (exp as u64 + 3)
}

/// Converts a Max Resp Code (or QQIC, scaled by the caller) to milliseconds.
///
/// ```text
///  0 1 2 3 4 5 6 7
/// +-+-+-+-+-+-+-+-+
/// |1| exp | mant  |
/// +-+-+-+-+-+-+-+-+
/// ```
pub fn code_to_millis(code: u8) -> u64 {
    if code < LINEAR_LIMIT {
        code as u64 * UNIT_MS
    } else {
        let exp = (code >> 4) & 0x07;
        let mant = code & 0x0f;
        float_units(exp, mant) * UNIT_MS
    }
}

/// Converts milliseconds to the smallest code that covers them.
///
/// `code_to_millis(millis_to_code(ms)) >= ms` holds up to the largest
/// representable value.
pub fn millis_to_code(ms: u64) -> u8 {
    let units = ms.div_ceil(UNIT_MS);
    if units < LINEAR_LIMIT as u64 {
        return units as u8;
    }

    for exp in 0..8u8 {
        for mant in 0..16u8 {
            if float_units(exp, mant) >= units {
                return 0x80 | (exp << 4) | mant;
            }
        }
    }
    MAX_CODE
}

/// QQIC carries the query interval in seconds with the same encoding.
pub fn interval_to_qqic(ms: u64) -> u8 {
    let secs = ms.div_ceil(1000);
    millis_to_code(secs * UNIT_MS)
}

pub fn qqic_to_interval(qqic: u8) -> u64 {
    code_to_millis(qqic) / UNIT_MS * 1000
}
