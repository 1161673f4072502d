use std::io::{self, Write};

use flate2::{Compression, write::GzEncoder};

pub fn encode_bytes_by_gzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::encode_bytes_by_gzip;

    #[test]
    fn test_encoded_bytes_carry_gzip_magic() {
        let encoded = encode_bytes_by_gzip(b"hello gzip").unwrap();
        assert_eq!(&encoded[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn test_encoded_bytes_decode_back() {
        let payload = b"the quick brown fox jumps over the lazy dog".repeat(8);
        let encoded = encode_bytes_by_gzip(&payload).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(&encoded[..]);
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, payload);
    }
}
