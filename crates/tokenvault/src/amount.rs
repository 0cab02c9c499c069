use num_bigint::BigUint;

/// Format a base-unit integer amount into a UI decimal string without using floats.
///
/// Examples:
/// - base=1500000, decimals=6 => "1.5"
/// - base=1, decimals=6 => "0.000001"
pub fn format_base_units(base: &BigUint, decimals: u8) -> String {
    let digits = base.to_str_radix(10);
    let decimals = usize::from(decimals);
    if decimals == 0 {
        return digits;
    }

    let padded = if digits.len() <= decimals {
        format!("{digits:0>width$}", width = decimals + 1)
    } else {
        digits
    };
    let (whole, frac) = padded.split_at(padded.len() - decimals);
    let frac = frac.trim_end_matches('0');
    if frac.is_empty() {
        whole.to_owned()
    } else {
        format!("{whole}.{frac}")
    }
}
