//! Signature routine shared by every processor callback endpoint.
//!
//! The processor signs each callback with
//! `hex(HMAC-SHA512(canonical_json(body), ipn_secret))` and sends the digest
//! in the [`IPN_SIGNATURE_HEADER`] header. The canonical form is what a
//! JavaScript signer produces with sorted keys and `JSON.stringify`:
//!
//! - object keys are sorted (UTF-16 order) through nested objects, but not
//!   inside arrays, which are copied as parsed;
//! - integer-like keys (`"0"`, `"17"`) always come first in ascending
//!   numeric order, as JavaScript objects enumerate them;
//! - numbers are IEEE doubles printed the way `Number.prototype.toString`
//!   prints them (`25.0` is `25`, `1e21` is `1e+21`);
//! - no whitespace.
//!
//! Verification fails closed: with no secret configured, nothing verifies.

use serde_json::Value;
use std::fmt::Write as _;

/// Header carrying the callback signature.
pub const IPN_SIGNATURE_HEADER: &str = "x-nowpayments-sig";

/// Errors produced by signature verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("callback secret is not configured")]
    SecretNotConfigured,
    #[error("missing signature")]
    MissingSignature,
    #[error("invalid hex encoding")]
    InvalidHex,
    #[error("invalid signature")]
    SignatureMismatch,
}

impl From<ring::error::Unspecified> for SignatureError {
    fn from(_: ring::error::Unspecified) -> Self {
        Self::SignatureMismatch
    }
}

/// Serialize `value` into its canonical signing form.
///
/// Two values with the same key-value pairs produce the same string
/// regardless of key insertion order, outside of arrays.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, true, &mut out);
    out
}

fn write_canonical(value: &Value, sort_keys: bool, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            if sort_keys {
                keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));
            }
            // Stable, so the remaining keys keep their order.
            keys.sort_by_key(|key| array_index(key).map_or((1, 0), |i| (0, i)));
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                if let Some(v) = map.get(key.as_str()) {
                    write_canonical(v, sort_keys, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, false, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        Value::Number(n) => match n.as_f64() {
            Some(x) => write_js_number(x, out),
            None => out.push_str("null"),
        },
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Null => out.push_str("null"),
    }
}

/// The numeric value of a key JavaScript treats as an array index.
fn array_index(key: &str) -> Option<u32> {
    if key.is_empty() || (key.len() > 1 && key.starts_with('0')) {
        return None;
    }
    if !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    key.parse::<u32>().ok().filter(|i| *i != u32::MAX)
}

/// `Number.prototype.toString()` for a double.
fn write_js_number(x: f64, out: &mut String) {
    if !x.is_finite() {
        // JSON.stringify writes NaN and the infinities as null.
        out.push_str("null");
        return;
    }
    if x == 0.0 {
        out.push('0');
        return;
    }
    if x < 0.0 {
        out.push('-');
    }
    // Shortest round-trip digits `d.ddd` and exponent from Rust's `{:e}`.
    let sci = format!("{:e}", x.abs());
    let (mantissa, exponent) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let k = digits.len() as i32;
    let n = exponent + 1;

    if k <= n && n <= 21 {
        out.push_str(&digits);
        out.push_str(&"0".repeat((n - k) as usize));
    } else if 0 < n && n <= 21 {
        let (int, frac) = digits.split_at(n as usize);
        out.push_str(int);
        out.push('.');
        out.push_str(frac);
    } else if -6 < n && n <= 0 {
        out.push_str("0.");
        out.push_str(&"0".repeat((-n) as usize));
        out.push_str(&digits);
    } else {
        let (first, rest) = digits.split_at(1);
        out.push_str(first);
        if !rest.is_empty() {
            out.push('.');
            out.push_str(rest);
        }
        let e = n - 1;
        let _ = write!(out, "e{}{}", if e < 0 { '-' } else { '+' }, e.abs());
    }
}

fn write_string(s: &str, out: &mut String) {
    // Serializing a &str cannot fail.
    match serde_json::to_string(s) {
        Ok(quoted) => out.push_str(&quoted),
        Err(_) => out.push_str("\"\""),
    }
}

/// Compute the lowercase hex signature of `value` under `secret`.
pub fn sign(value: &Value, secret: &[u8]) -> String {
    let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA512, secret);
    let tag = ring::hmac::sign(&key, canonical_json(value).as_bytes());
    hex::encode(tag.as_ref())
}

/// Verify a callback signature.
///
/// * `secret` - the shared callback secret; `None` or empty always fails.
/// * `value` - the parsed callback body.
/// * `signature` - the header value, if present.
pub fn verify(
    secret: Option<&[u8]>,
    value: &Value,
    signature: Option<&str>,
) -> Result<(), SignatureError> {
    let secret = match secret {
        Some(s) if !s.is_empty() => s,
        _ => return Err(SignatureError::SecretNotConfigured),
    };
    let signature = signature
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(SignatureError::MissingSignature)?;
    let provided = hex::decode(signature).map_err(|_| SignatureError::InvalidHex)?;

    let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA512, secret);
    ring::hmac::verify(&key, canonical_json(value).as_bytes(), &provided)?;
    Ok(())
}

/// Boolean form of [`verify`].
pub fn verify_signature(secret: Option<&[u8]>, value: &Value, signature: Option<&str>) -> bool {
    verify(secret, value, signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &[u8] = b"ipn-secret";

    fn parse(body: &str) -> Value {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn canonical_form_sorts_nested_keys() {
        let value = parse(r#"{"b":1,"a":{"z":true,"c":[{"y":null,"x":"s"}]}}"#);
        // Objects inside arrays keep their parsed key order.
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"c":[{"y":null,"x":"s"}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn numbers_are_printed_like_javascript() {
        let body = r#"{"payment_id":5077125051,"payment_status":"finished","pay_address":"0xabc","price_amount":25.0,"actually_paid":1e-7,"fee":{"serviceFee":0.50,"currency":"eth"}}"#;
        let canonical = r#"{"actually_paid":1e-7,"fee":{"currency":"eth","serviceFee":0.5},"pay_address":"0xabc","payment_id":5077125051,"payment_status":"finished","price_amount":25}"#;
        let digest = "b00c424674c0b80002f649b5682e259d504980dfcf7b6913ccdc78cc01f991325e7096c2a3937287afc606cfc245234bf60ec3246f63b6b4e05e449c71e32d59";

        let value = parse(body);
        assert_eq!(canonical_json(&value), canonical);
        assert_eq!(sign(&value, SECRET), digest);
        assert!(verify_signature(Some(SECRET), &value, Some(digest)));
    }

    #[test]
    fn extreme_numbers_and_index_keys_match_javascript() {
        let body = r#"{"b":[{"z":1,"a":2}],"10":"ten","9":"nine","a":1e21,"c":123456789012345678901,"d":-0.0,"e":1.5e300,"f":0.000001,"g":12345678901234567890}"#;
        let canonical = r#"{"9":"nine","10":"ten","a":1e+21,"b":[{"z":1,"a":2}],"c":123456789012345680000,"d":0,"e":1.5e+300,"f":0.000001,"g":12345678901234567000}"#;
        let digest = "ae60d65b40a0df05ce8a9ba91251236cb90cc2d4df00dd1eb7260099f71f2862b182a12e45b0c804f02947f60ce6d8e74860d286feb6cfdda1fdb4bd8dd5ee35";

        let value = parse(body);
        assert_eq!(canonical_json(&value), canonical);
        assert_eq!(sign(&value, SECRET), digest);
    }

    #[test]
    fn js_number_formatting() {
        let cases = [
            (25.0, "25"),
            (0.5, "0.5"),
            (-3.25, "-3.25"),
            (1e-7, "1e-7"),
            (1.5e-7, "1.5e-7"),
            (0.000001, "0.000001"),
            (1e20, "100000000000000000000"),
            (1e21, "1e+21"),
            (123.456, "123.456"),
            (0.1 + 0.2, "0.30000000000000004"),
        ];
        for (x, expected) in cases {
            let mut out = String::new();
            write_js_number(x, &mut out);
            assert_eq!(out, expected, "formatting {x}");
        }
    }

    #[test]
    fn insertion_order_does_not_change_signature() {
        let first: Value =
            serde_json::from_str(r#"{"payment_id":1,"payment_status":"finished","pay_amount":0.5}"#)
                .unwrap();
        let second: Value =
            serde_json::from_str(r#"{"pay_amount":0.5,"payment_status":"finished","payment_id":1}"#)
                .unwrap();
        assert_eq!(sign(&first, SECRET), sign(&second, SECRET));
    }

    #[test]
    fn valid_signature_verifies() {
        let body = json!({"id": "w-1", "status": "FINISHED"});
        let sig = sign(&body, SECRET);
        assert!(verify_signature(Some(SECRET), &body, Some(&sig)));
        assert!(verify_signature(Some(SECRET), &body, Some(&sig.to_uppercase())));
    }

    #[test]
    fn tampered_body_or_wrong_secret_fails() {
        let body = json!({"id": "w-1", "status": "FINISHED"});
        let sig = sign(&body, SECRET);
        let tampered = json!({"id": "w-1", "status": "FAILED"});
        assert_eq!(
            verify(Some(SECRET), &tampered, Some(&sig)),
            Err(SignatureError::SignatureMismatch)
        );
        assert!(!verify_signature(Some(b"other"), &body, Some(&sig)));
        assert_eq!(
            verify(Some(SECRET), &body, Some("zz")),
            Err(SignatureError::InvalidHex)
        );
        assert_eq!(
            verify(Some(SECRET), &body, None),
            Err(SignatureError::MissingSignature)
        );
    }

    #[test]
    fn missing_secret_fails_closed() {
        let body = json!({"payment_id": 1, "payment_status": "finished"});
        let sig = sign(&body, SECRET);
        assert_eq!(
            verify(None, &body, Some(&sig)),
            Err(SignatureError::SecretNotConfigured)
        );
        assert!(!verify_signature(Some(b""), &body, Some(&sig)));
        assert!(!verify_signature(None, &body, Some(&"0".repeat(128))));
    }
}
