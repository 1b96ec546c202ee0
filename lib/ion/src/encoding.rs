use std::ptr;

/// Renders binary data as a lowercase hex string.
#[inline]
pub fn bin_to_hex(bin: &[u8]) -> String {
    // sodium_bin2hex writes a trailing NUL
    let mut hex = vec![0u8; bin.len() * 2 + 1];

    unsafe {
        libsodium_sys::sodium_bin2hex(
            hex.as_mut_ptr() as *mut _,
            hex.len(),
            bin.as_ptr() as *const _,
            bin.len(),
        );
    }

    hex.truncate(bin.len() * 2);
    String::from_utf8(hex).expect("sodium_bin2hex emits ASCII")
}

/// Parses a hex string into the provided buffer, returning the number of
/// bytes written. Returns `None` if the input is not valid hex or does not
/// fit the buffer.
#[inline]
pub fn hex_to_bin(hex: &str, bin: &mut [u8]) -> Option<usize> {
    let mut written: usize = 0;

    let res = unsafe {
        libsodium_sys::sodium_hex2bin(
            bin.as_mut_ptr() as *mut _,
            bin.len(),
            hex.as_ptr() as *const _,
            hex.len(),
            ptr::null(),
            &mut written as *mut usize,
            ptr::null_mut(),
        )
    };

    if res == 0 {
        Some(written)
    } else {
        None
    }
}

/// Serde adaptors for base64-encoded binary fields in configuration files.
pub mod base64 {
    use serde::Serializer;

    pub use ::base64::{decode, encode, DecodeError};

    #[inline]
    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&encode(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let data = [0x00u8, 0x01, 0xAB, 0xFF, 0x7E];
        let hex = bin_to_hex(&data);

        assert_eq!(hex, "0001abff7e");

        let mut parsed = [0u8; 5];
        assert_eq!(hex_to_bin(&hex, &mut parsed), Some(5));
        assert_eq!(parsed, data);
    }

    #[test]
    fn test_hex_to_bin_rejects_garbage() {
        let mut parsed = [0u8; 4];
        assert_eq!(hex_to_bin("zz", &mut parsed), None);
    }

    #[test]
    fn test_hex_to_bin_rejects_overflow() {
        let mut parsed = [0u8; 1];
        assert_eq!(hex_to_bin("aabb", &mut parsed), None);
    }
}
