//! Gzip compression keyed on the magic number
//!
//! Writes compress unless the caller already supplies gzip data. Reads
//! decompress only when the stored bytes start with the gzip magic number, so
//! files written before compression was introduced stay readable.

use std::io::{self, Cursor, Read, Write};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// First two bytes of every gzip stream
pub const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Returns `true` if `bytes` starts with the gzip magic number
pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[..2] == GZIP_MAGIC
}

enum Mode<W: Write> {
    /// Fewer than two bytes seen so far
    Undecided(W, Vec<u8>),
    Passthrough(W),
    Compressing(GzEncoder<W>),
    /// Transient state while switching modes
    Poisoned,
}

/// Writer that gzips its input unless the input is already gzip
///
/// The decision is made once the first two bytes are known. Call
/// [`finish`](Self::finish) to flush the gzip trailer and get the inner writer
/// back.
pub struct GzipIfNeededWriter<W: Write> {
    mode: Mode<W>,
}

impl<W: Write> GzipIfNeededWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            mode: Mode::Undecided(inner, Vec::with_capacity(2)),
        }
    }

    fn decide(&mut self, head: Vec<u8>, inner: W) -> io::Result<()> {
        if is_gzip(&head) {
            let mut inner = inner;
            inner.write_all(&head)?;
            self.mode = Mode::Passthrough(inner);
        } else {
            let mut encoder = GzEncoder::new(inner, Compression::default());
            encoder.write_all(&head)?;
            self.mode = Mode::Compressing(encoder);
        }
        Ok(())
    }

    /// Completes the stream and returns the inner writer
    ///
    /// Input shorter than two bytes, including empty input, is compressed.
    pub fn finish(mut self) -> io::Result<W> {
        match std::mem::replace(&mut self.mode, Mode::Poisoned) {
            Mode::Undecided(inner, head) => {
                let mut encoder = GzEncoder::new(inner, Compression::default());
                encoder.write_all(&head)?;
                encoder.finish()
            }
            Mode::Passthrough(mut inner) => {
                inner.flush()?;
                Ok(inner)
            }
            Mode::Compressing(encoder) => encoder.finish(),
            Mode::Poisoned => Err(poisoned()),
        }
    }
}

impl<W: Write> Write for GzipIfNeededWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match &mut self.mode {
            Mode::Passthrough(inner) => inner.write(buf),
            Mode::Compressing(encoder) => encoder.write(buf),
            Mode::Undecided(_, head) => {
                let take = (2 - head.len()).min(buf.len());
                head.extend_from_slice(&buf[..take]);
                if head.len() == 2 {
                    if let Mode::Undecided(inner, head) = std::mem::replace(&mut self.mode, Mode::Poisoned) {
                        self.decide(head, inner)?;
                    }
                }
                Ok(take)
            }
            Mode::Poisoned => Err(poisoned()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.mode {
            Mode::Undecided(inner, _) | Mode::Passthrough(inner) => inner.flush(),
            Mode::Compressing(encoder) => encoder.flush(),
            Mode::Poisoned => Err(poisoned()),
        }
    }
}

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "gzip writer used after a failed write")
}

/// Wraps `reader` so it yields decompressed bytes when the source is gzip,
/// or the raw bytes otherwise
pub fn decompressing_reader<R: Read + Send + 'static>(mut reader: R) -> io::Result<Box<dyn Read + Send>> {
    let mut head = Vec::with_capacity(2);
    (&mut reader).take(2).read_to_end(&mut head)?;
    let gzip = is_gzip(&head);
    let restored = Cursor::new(head).chain(reader);
    if gzip {
        Ok(Box::new(MultiGzDecoder::new(restored)))
    } else {
        Ok(Box::new(restored))
    }
}

/// Gzips `bytes` unless they are already gzip
pub fn compress_if_needed(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut writer = GzipIfNeededWriter::new(Vec::new());
    writer.write_all(bytes)?;
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gunzip(bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        decompressing_reader(Cursor::new(bytes.to_vec()))
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn test_plain_input_is_compressed() {
        let compressed = compress_if_needed(b"{\"hello\":\"world\"}").unwrap();
        assert!(is_gzip(&compressed));
        assert_eq!(gunzip(&compressed), b"{\"hello\":\"world\"}");
    }

    #[test]
    fn test_gzip_input_is_not_compressed_twice() {
        let once = compress_if_needed(b"payload").unwrap();
        let twice = compress_if_needed(&once).unwrap();
        assert_eq!(once, twice);
        assert_eq!(gunzip(&twice), b"payload");
    }

    #[test]
    fn test_byte_at_a_time_writes() {
        let once = compress_if_needed(b"payload").unwrap();
        let mut writer = GzipIfNeededWriter::new(Vec::new());
        for byte in &once {
            writer.write_all(std::slice::from_ref(byte)).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), once);
    }

    #[test]
    fn test_short_inputs() {
        for input in [&b""[..], &b"x"[..]] {
            let compressed = compress_if_needed(input).unwrap();
            assert!(is_gzip(&compressed));
            assert_eq!(gunzip(&compressed), input);
        }
    }

    #[test]
    fn test_uncompressed_source_reads_verbatim() {
        assert_eq!(gunzip(b"legacy json"), b"legacy json");
        assert_eq!(gunzip(b""), b"");
    }
}
