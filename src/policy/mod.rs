use crate::ConvertError;

/// Output size ceiling imposed by the delivery channel's attachment limit, in KB.
pub const SIZE_LIMIT_KB: u32 = 20_000;

/// Maximum permissible source length in seconds for a target bitrate.
///
/// Bitrate and duration are the only two knobs available to stay under the
/// delivery channel's hard output-size cap, so the bound follows directly:
/// `SIZE_LIMIT_KB / (bitrate / 8)`.
pub fn max_length_seconds(bitrate: u32) -> f64 {
    f64::from(SIZE_LIMIT_KB) / (f64::from(bitrate) / 8.0)
}

/// Validate a candidate video's length against the bound for `bitrate`.
pub fn validate(length_seconds: u64, bitrate: u32) -> Result<(), ConvertError> {
    let max = max_length_seconds(bitrate);
    if length_seconds as f64 > max {
        return Err(ConvertError::TooLong {
            bitrate,
            max_length_seconds: max,
        });
    }
    Ok(())
}
