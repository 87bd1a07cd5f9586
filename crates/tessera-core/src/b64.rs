//! Base64 helpers for binary fields in JSON records

use base64::{engine::general_purpose::STANDARD as B64, Engine};

use crate::error::{TesseraError, TesseraResult};

pub fn encode(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

/// Decode a base64 field, naming it in the error.
pub fn decode(field: &str, value: &str) -> TesseraResult<Vec<u8>> {
    B64.decode(value)
        .map_err(|e| TesseraError::validation(format!("{field} is not valid base64: {e}")))
}

/// Decode a base64 field that must be exactly `N` bytes.
pub fn decode_array<const N: usize>(field: &str, value: &str) -> TesseraResult<[u8; N]> {
    let bytes = decode(field, value)?;
    bytes.as_slice().try_into().map_err(|_| {
        TesseraError::validation(format!("{field} must be {N} bytes, got {}", bytes.len()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_reports_field() {
        let err = decode("iv", "!!!").unwrap_err();
        assert!(err.to_string().contains("iv"));
    }

    #[test]
    fn fixed_length() {
        let enc = encode(&[7u8; 12]);
        assert_eq!(decode_array::<12>("nonce", &enc).unwrap(), [7u8; 12]);
        assert!(decode_array::<16>("nonce", &enc).is_err());
    }
}
