/// UTF-16LE helpers. Several of the Windows-origin families put
/// wide-character strings on the wire; command lines go out encoded and
/// shell output comes back for decoding.

pub fn encode_wide_string(input: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() * 2);
    for unit in input.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

pub fn decode_wide_string(input: &[u8]) -> String {
    let units: Vec<u16> = input
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    String::from_utf16_lossy(&units)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_ascii() {
        assert_eq!(encode_wide_string("cmd"), vec![0x63, 0x00, 0x6d, 0x00, 0x64, 0x00]);
    }

    #[test]
    fn test_round_trip() {
        let input = "whoami /all";
        assert_eq!(decode_wide_string(&encode_wide_string(input)), input);
    }

    #[test]
    fn test_decode_ignores_trailing_odd_byte() {
        let mut bytes = encode_wide_string("ok");
        bytes.push(0x41);
        assert_eq!(decode_wide_string(&bytes), "ok");
    }

    #[test]
    fn test_decode_embedded_nul() {
        let bytes = [0x61, 0x00, 0x00, 0x00];
        assert_eq!(decode_wide_string(&bytes), "a\0");
    }
}
