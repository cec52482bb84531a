use std::convert::TryInto;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use data_encoding::BASE64;
use log::warn;
use url::Url;

use crate::error::GrowthBookError;
use crate::model::{BucketRange, BucketRangeBuilder, Namespace};

const INIT32: u32 = 0x811c_9dc5;
const PRIME32: u32 = 0x0100_0193;

fn fnv1a32(data: &str) -> u32 {
    data.as_bytes().iter().fold(INIT32, |hash, &byte| (hash ^ (byte as u32)).wrapping_mul(PRIME32))
}

/// FNV-1a based hash, producing a fraction in `[0, 1)`. Version 1 hashes
/// `value ++ seed` directly; version 2 re-hashes the decimal string of the
/// first hash of `seed ++ value`, trading a little speed for better
/// distribution. Any other version is unsupported.
pub fn hash(seed: &str, value: &str, version: i32) -> Option<f32> {
    match version {
        1 => {
            let n = fnv1a32(&format!("{}{}", value, seed));
            Some((n % 1000) as f32 / 1000.0)
        }
        2 => {
            let n = fnv1a32(&fnv1a32(&format!("{}{}", seed, value)).to_string());
            Some((n % 10000) as f32 / 10000.0)
        }
        _ => {
            warn!("unsupported hash version: {}", version);
            None
        }
    }
}

pub fn in_range(n: f32, range: &BucketRange) -> bool {
    (n >= range.range_start) && (n < range.range_end)
}

pub fn in_namespace(user_id: &str, namespace: &Namespace) -> bool {
    match hash(&format!("__{}", namespace.id), user_id, 1) {
        Some(h) => (h >= namespace.range_start) && (h < namespace.range_end),
        None => false,
    }
}

pub fn get_equal_weights(num_variations: i32) -> Vec<f32> {
    if num_variations < 1 {
        vec![]
    } else {
        vec![1.0 / num_variations as f32; num_variations as usize]
    }
}

/// Builds coverage-scaled, weighted bucket ranges. Falls back to equal
/// weights when the supplied weights don't match the variation count,
/// contain a negative value, or don't sum to ~1.
pub fn get_bucket_ranges(num_variations: i32, coverage: f32, weights: Option<Vec<f32>>) -> Vec<BucketRange> {
    let cov = coverage.clamp(0.0, 1.0);
    if !(0.0..=1.0).contains(&coverage) {
        warn!("coverage {} out of range, clamped to {}", coverage, cov);
    }

    let equalized_weights = weights
        .filter(|w| num_variations as usize == w.len() && !w.iter().any(|x| *x < 0.0) && (w.iter().sum::<f32>() - 1.0).abs() <= 0.01)
        .unwrap_or_else(|| get_equal_weights(num_variations));

    let mut cumulative = 0.0;
    equalized_weights
        .into_iter()
        .map(|w| {
            let start = cumulative;
            cumulative += w;
            BucketRangeBuilder::default()
                .range_start(start)
                .range_end(start + cov * w)
                .build()
                .unwrap_or_default()
        })
        .collect()
}

pub fn choose_variation(n: f32, ranges: &[BucketRange]) -> i32 {
    ranges.iter().position(|range| in_range(n, range)).map(|i| i as i32).unwrap_or(-1)
}

pub fn get_query_string_override(id: &str, url: &str, num_variations: i32) -> Option<i32> {
    let parsed_url = Url::parse(url).ok()?;

    for (key, value) in parsed_url.query_pairs() {
        if key == id {
            let variation = value.parse::<i32>().ok()?;
            return if variation >= 0 && variation < num_variations { Some(variation) } else { None };
        }
    }

    None
}

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Decrypts a `"<iv_b64>.<cipher_b64>"` AES-256-CBC payload with a
/// base64-encoded key, returning the UTF-8 plaintext catalog JSON.
pub fn decrypt_string(encrypted_string: &str, decryption_key: &str) -> Result<String, GrowthBookError> {
    let split: Vec<&str> = encrypted_string.splitn(2, '.').collect();
    if split.len() != 2 {
        return Err(GrowthBookError::InvalidEncryptedFormat);
    }

    let iv = BASE64.decode(split[0].as_bytes()).map_err(|e| GrowthBookError::Base64(e.to_string()))?;
    let mut encrypted_data = BASE64.decode(split[1].as_bytes()).map_err(|e| GrowthBookError::Base64(e.to_string()))?;
    let key = BASE64.decode(decryption_key.as_bytes()).map_err(|e| GrowthBookError::Base64(e.to_string()))?;

    let iv_bytes: &[u8; 16] = iv.as_slice().try_into().map_err(|_| GrowthBookError::InvalidIvLength)?;
    let key_bytes: &[u8; 32] = key.as_slice().try_into().map_err(|_| GrowthBookError::InvalidKeyLength)?;

    let decrypted = Aes256CbcDec::new(key_bytes.into(), iv_bytes.into())
        .decrypt_padded_mut::<Pkcs7>(&mut encrypted_data)
        .map_err(|_| GrowthBookError::InvalidPadding)?;

    Ok(String::from_utf8_lossy(decrypted).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_v1_known_value() {
        // fnv32a("1s") % 1000 / 1000 == 0.230, per the spec's worked example.
        let n = hash("s", "1", 1).unwrap();
        assert!((n - 0.230).abs() < 0.001, "got {}", n);
    }

    #[test]
    fn hash_invalid_version_is_none() {
        assert_eq!(hash("s", "1", 3), None);
    }

    #[test]
    fn bucket_ranges_equal_weights() {
        let ranges = get_bucket_ranges(2, 1.0, None);
        assert_eq!(ranges, vec![BucketRange { range_start: 0.0, range_end: 0.5 }, BucketRange { range_start: 0.5, range_end: 1.0 }]);
    }

    #[test]
    fn bucket_ranges_coverage_scales_down() {
        let ranges = get_bucket_ranges(2, 0.1, None);
        assert_eq!(ranges, vec![BucketRange { range_start: 0.0, range_end: 0.05 }, BucketRange { range_start: 0.5, range_end: 0.55 }]);
    }

    #[test]
    fn bucket_ranges_negative_weights_fall_back_to_equal() {
        let ranges = get_bucket_ranges(2, 1.0, Some(vec![1.5, -0.5]));
        assert_eq!(ranges, vec![BucketRange { range_start: 0.0, range_end: 0.5 }, BucketRange { range_start: 0.5, range_end: 1.0 }]);
    }

    #[test]
    fn choose_variation_excluded_when_below_coverage() {
        let ranges = get_bucket_ranges(2, 0.1, None);
        assert_eq!(choose_variation(0.230, &ranges), -1);
    }

    #[test]
    fn query_string_override_parses_single_int() {
        assert_eq!(get_query_string_override("my-exp", "http://x/?my-exp=1", 2), Some(1));
        assert_eq!(get_query_string_override("my-exp", "http://x/?my-exp=5", 2), None);
        assert_eq!(get_query_string_override("my-exp", "http://x/?other=1", 2), None);
    }
}
