//! WebAuthn signature and passkey plumbing for the smart-wallet path.
//!
//! Authenticators emit ECDSA P-256 signatures as ASN.1 DER (70–72 bytes);
//! the smart-wallet verifier wants canonical raw `r||s` (2×32 bytes,
//! left-padded, low-S). Passkey public keys arrive as DER SPKI; the wallet
//! stores the inner 65-byte uncompressed point `0x04 || X || Y`.

use num_bigint::BigUint;
use once_cell::sync::Lazy;

/// Order of the P-256 curve group.
static P256_ORDER: Lazy<BigUint> = Lazy::new(|| {
    BigUint::parse_bytes(
        b"FFFFFFFF00000000FFFFFFFFFFFFFFFFBCE6FAADA7179E84F3B9CAC2FC632551",
        16,
    )
    .expect("valid curve order")
});

static P256_HALF_ORDER: Lazy<BigUint> = Lazy::new(|| &*P256_ORDER >> 1);

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum WebauthnError {
    #[error("Signature must be 64 raw bytes or DER-encoded, got {0} bytes")]
    BadSignatureLength(usize),
    #[error("Malformed DER signature: {0}")]
    MalformedDer(&'static str),
    #[error("Signature component exceeds 32 bytes")]
    ComponentTooLarge,
    #[error("Public key is not a valid SPKI or uncompressed P-256 point")]
    BadPublicKey,
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

fn left_pad_32(bytes: &[u8]) -> Result<[u8; 32], WebauthnError> {
    let trimmed = strip_leading_zeros(bytes);
    if trimmed.len() > 32 {
        return Err(WebauthnError::ComponentTooLarge);
    }
    let mut out = [0u8; 32];
    out[32 - trimmed.len()..].copy_from_slice(trimmed);
    Ok(out)
}

/// Parses a DER `ECDSA-Sig-Value` into its `(r, s)` components.
fn parse_der(der: &[u8]) -> Result<(Vec<u8>, Vec<u8>), WebauthnError> {
    let malformed = WebauthnError::MalformedDer;
    if der.len() < 8 || der[0] != 0x30 {
        return Err(malformed("missing SEQUENCE tag"));
    }
    let seq_len = der[1] as usize;
    if seq_len >= 0x80 || seq_len + 2 != der.len() {
        return Err(malformed("bad SEQUENCE length"));
    }
    let mut cursor = 2;
    let mut read_integer = |der: &[u8]| -> Result<Vec<u8>, WebauthnError> {
        if der.len() < cursor + 2 || der[cursor] != 0x02 {
            return Err(malformed("missing INTEGER tag"));
        }
        let len = der[cursor + 1] as usize;
        let start = cursor + 2;
        let end = start + len;
        if len == 0 || end > der.len() {
            return Err(malformed("bad INTEGER length"));
        }
        cursor = end;
        Ok(der[start..end].to_vec())
    };
    let r = read_integer(der)?;
    let s = read_integer(der)?;
    if cursor != der.len() {
        return Err(malformed("trailing bytes"));
    }
    Ok((r, s))
}

/// Normalizes a WebAuthn ECDSA signature to canonical raw `r||s`.
///
/// Accepts 64-byte raw or DER input. Low-S normalization is applied in both
/// cases: an `s` above the half-order is replaced by `order - s`.
pub fn normalize_signature(input: &[u8]) -> Result<[u8; 64], WebauthnError> {
    let (r_bytes, s_bytes) = if input.len() == 64 {
        (input[..32].to_vec(), input[32..].to_vec())
    } else if input.first() == Some(&0x30) {
        parse_der(input)?
    } else {
        return Err(WebauthnError::BadSignatureLength(input.len()));
    };

    let r = left_pad_32(&r_bytes)?;
    let s_value = BigUint::from_bytes_be(&s_bytes);
    if s_value.bits() > 256 {
        return Err(WebauthnError::ComponentTooLarge);
    }
    let s_value = if s_value > *P256_HALF_ORDER {
        &*P256_ORDER - s_value
    } else {
        s_value
    };
    let s = left_pad_32(&s_value.to_bytes_be())?;

    let mut out = [0u8; 64];
    out[..32].copy_from_slice(&r);
    out[32..].copy_from_slice(&s);
    Ok(out)
}

/// Extracts the 65-byte uncompressed point from a DER SPKI, or passes a bare
/// point through. The point is the payload of the SPKI's BIT STRING, after
/// its unused-bits octet.
pub fn extract_public_key_point(input: &[u8]) -> Result<[u8; 65], WebauthnError> {
    if input.len() == 65 && input[0] == 0x04 {
        let mut out = [0u8; 65];
        out.copy_from_slice(input);
        return Ok(out);
    }
    if input.len() < 65 + 2 || input[0] != 0x30 {
        return Err(WebauthnError::BadPublicKey);
    }
    // Locate the BIT STRING whose content is the uncompressed point.
    for i in 0..input.len().saturating_sub(67) {
        if input[i] == 0x03 && input[i + 2] == 0x00 && input[i + 3] == 0x04 {
            let declared = input[i + 1] as usize;
            let start = i + 3;
            if declared == 66 && input.len() >= start + 65 {
                let mut out = [0u8; 65];
                out.copy_from_slice(&input[start..start + 65]);
                return Ok(out);
            }
        }
    }
    // Some encoders use a minimal SPKI where the point is simply the suffix.
    let tail = &input[input.len() - 65..];
    if tail[0] == 0x04 {
        let mut out = [0u8; 65];
        out.copy_from_slice(tail);
        return Ok(out);
    }
    Err(WebauthnError::BadPublicKey)
}

/// Compares a registered on-chain passkey against the caller-provided one.
/// On mismatch, returns truncated hex prefixes of both for the error surface.
pub fn check_passkey_consistency(
    registered: &[u8],
    provided_point: &[u8; 65],
) -> Result<(), (String, String)> {
    if registered == provided_point.as_slice() {
        Ok(())
    } else {
        let prefix = |bytes: &[u8]| hex::encode(&bytes[..bytes.len().min(8)]);
        Err((prefix(registered), prefix(provided_point)))
    }
}
