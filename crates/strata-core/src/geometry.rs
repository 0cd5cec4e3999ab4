//! Compressible point geometry.
//!
//! Coordinates are stored as little-endian ISO WKB points. Before encoding,
//! the low mantissa bits that carry no information at the configured decimal
//! precision are zeroed, which leaves long runs of zero bytes for the columnar
//! codec to squeeze out. Truncation error stays below `10^-precision / 2`.

/// Size of an encoded WKB point: byte order, geometry type, x, y.
pub const POINT_WKB_LEN: usize = 21;

/// Encoded WKB point.
pub type PointWkb = [u8; POINT_WKB_LEN];

/// Decimal digits kept by default; about 1 cm at the equator.
pub const DEFAULT_COORDINATE_PRECISION: u32 = 7;

/// Highest meaningful precision; an `f64` carries at most 17 significant digits.
pub const MAX_COORDINATE_PRECISION: u32 = 16;

const WKB_LITTLE_ENDIAN: u8 = 1;
const WKB_POINT: u32 = 1;

const MANTISSA_BITS: i32 = 52;
const EXPONENT_MASK: u64 = 0x7ff;
const EXPONENT_BIAS: i32 = 1023;

/// Zeroes the mantissa bits of `value` below `precision` decimal digits.
///
/// Zero, subnormal and non-finite values are returned unchanged. Values whose
/// magnitude is below the precision collapse to a signed zero. Precisions above
/// [`MAX_COORDINATE_PRECISION`] are treated as that maximum.
#[must_use]
pub fn compressible_coordinate(value: f64, precision: u32) -> f64 {
    let bits = value.to_bits();
    let biased_exponent = ((bits >> MANTISSA_BITS) & EXPONENT_MASK) as i32;
    if biased_exponent == 0 || biased_exponent == EXPONENT_MASK as i32 {
        return value;
    }
    let exponent = biased_exponent - EXPONENT_BIAS;

    // ulp after masking is 2^(exponent - keep); require it to be <= 10^-p / 2.
    let keep = exponent + fraction_bits_for(precision) + 1;
    if keep < 0 {
        return 0.0_f64.copysign(value);
    }
    if keep >= MANTISSA_BITS {
        return value;
    }

    let drop = (MANTISSA_BITS - keep) as u32;
    f64::from_bits(bits & !((1_u64 << drop) - 1))
}

// ceil(precision * log2(10))
fn fraction_bits_for(precision: u32) -> i32 {
    let precision = precision.min(MAX_COORDINATE_PRECISION);
    (f64::from(precision) * std::f64::consts::LOG2_10).ceil() as i32
}

/// Encodes a lon/lat pair as a compressible WKB point.
#[must_use]
pub fn point_to_compressible_wkb(lon: f64, lat: f64, precision: u32) -> PointWkb {
    let x = compressible_coordinate(lon, precision);
    let y = compressible_coordinate(lat, precision);

    let mut out = [0_u8; POINT_WKB_LEN];
    out[0] = WKB_LITTLE_ENDIAN;
    out[1..5].copy_from_slice(&WKB_POINT.to_le_bytes());
    out[5..13].copy_from_slice(&x.to_le_bytes());
    out[13..21].copy_from_slice(&y.to_le_bytes());
    out
}

/// Decodes a little-endian WKB point into `(lon, lat)`.
///
/// Returns `None` for anything other than a little-endian 2D point.
#[must_use]
pub fn wkb_to_point(wkb: &[u8]) -> Option<(f64, f64)> {
    if wkb.len() != POINT_WKB_LEN || wkb[0] != WKB_LITTLE_ENDIAN {
        return None;
    }
    if u32::from_le_bytes(wkb[1..5].try_into().ok()?) != WKB_POINT {
        return None;
    }
    let x = f64::from_le_bytes(wkb[5..13].try_into().ok()?);
    let y = f64::from_le_bytes(wkb[13..21].try_into().ok()?);
    Some((x, y))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masking_stays_within_precision() {
        for &value in &[179.999_999_9, -179.123_456_7, 51.507_222_3, 0.000_123_4, -0.5] {
            let masked = compressible_coordinate(value, 7);
            assert!(
                (masked - value).abs() <= 0.5e-7,
                "{value} -> {masked} exceeds precision"
            );
            assert!(masked.abs() <= value.abs());
        }
    }

    #[test]
    fn masking_zeroes_low_mantissa_bits() {
        let masked = compressible_coordinate(13.404_954, 7);
        // exponent 3, keep 3 + 24 + 1 = 28 bits, so 24 low bits are clear
        assert_eq!(masked.to_bits() & ((1 << 24) - 1), 0);
    }

    #[test]
    fn special_values_pass_through() {
        assert_eq!(compressible_coordinate(0.0, 7).to_bits(), 0.0_f64.to_bits());
        assert!(compressible_coordinate(f64::NAN, 7).is_nan());
        assert_eq!(compressible_coordinate(f64::INFINITY, 7), f64::INFINITY);
        assert_eq!(compressible_coordinate(1e-12, 7), 0.0);
        assert!(compressible_coordinate(-1e-12, 7).is_sign_negative());
    }

    #[test]
    fn high_precision_keeps_value_intact() {
        let value = 12.345_678_901_234_5;
        assert_eq!(compressible_coordinate(value, 16), value);
    }

    #[test]
    fn oversized_precision_is_clamped() {
        let value = 12.345_678_901_234_5;
        assert_eq!(compressible_coordinate(1.0, u32::MAX), 1.0);
        assert_eq!(
            compressible_coordinate(value, u32::MAX),
            compressible_coordinate(value, MAX_COORDINATE_PRECISION)
        );
        assert!(compressible_coordinate(-1e-300, u32::MAX).is_sign_negative());
    }

    #[test]
    fn point_wkb_layout() {
        let wkb = point_to_compressible_wkb(1.5, -2.25, 7);
        assert_eq!(wkb.len(), POINT_WKB_LEN);
        assert_eq!(wkb[0], 1);
        assert_eq!(&wkb[1..5], &[1, 0, 0, 0]);
        assert_eq!(wkb_to_point(&wkb), Some((1.5, -2.25)));
        assert_eq!(wkb_to_point(&wkb[..20]), None);
    }
}
