//! RFC 1350 netascii translation.
//!
//! Text-mode transfers carry CR+LF line endings on the wire: a bare LF is
//! sent as CR LF and a bare CR as CR NUL. Translation is done explicitly in
//! both directions rather than relying on platform text-mode file semantics,
//! so the bytes on the wire are the same on every host. Both directions keep
//! their state across block boundaries, since a CR and its follower can land
//! in different packets.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

const RAW_CHUNK: usize = 1024;

/// Reads a local file and yields netascii-encoded blocks for DATA packets.
///
/// Encoding expands the stream, so a block's worth of wire bytes may consume
/// fewer file bytes; leftovers are buffered for the next block.
pub struct NetasciiReader<R> {
    inner: Option<R>,
    pending: VecDeque<u8>,
    held_cr: bool,
}

impl<R: Read> NetasciiReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: Some(inner),
            pending: VecDeque::new(),
            held_cr: false,
        }
    }

    /// Fill `out` with up to `len` encoded bytes. Returns the number of
    /// bytes produced; fewer than `len` only at end of file.
    pub fn read_block(&mut self, len: usize, out: &mut Vec<u8>) -> io::Result<usize> {
        while self.pending.len() < len && self.inner.is_some() {
            self.pull()?;
        }
        let take = len.min(self.pending.len());
        out.extend(self.pending.drain(..take));
        Ok(take)
    }

    fn pull(&mut self) -> io::Result<()> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(());
        };
        let mut raw = [0u8; RAW_CHUNK];
        let n = inner.read(&mut raw)?;
        if n == 0 {
            // A CR at end of file still needs its NUL.
            if self.held_cr {
                self.pending.push_back(b'\r');
                self.pending.push_back(b'\0');
                self.held_cr = false;
            }
            self.inner = None;
            return Ok(());
        }
        for &byte in &raw[..n] {
            if self.held_cr {
                self.held_cr = false;
                if byte == b'\n' {
                    // CR LF in the file travels as CR LF.
                    self.pending.push_back(b'\r');
                    self.pending.push_back(b'\n');
                    continue;
                }
                self.pending.push_back(b'\r');
                self.pending.push_back(b'\0');
            }
            match byte {
                b'\r' => self.held_cr = true,
                b'\n' => {
                    self.pending.push_back(b'\r');
                    self.pending.push_back(b'\n');
                }
                other => self.pending.push_back(other),
            }
        }
        Ok(())
    }
}

/// Decodes netascii DATA payloads back to local bytes and writes them out.
pub struct NetasciiWriter<W> {
    inner: W,
    pending_cr: bool,
}

impl<W: Write> NetasciiWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending_cr: false,
        }
    }

    /// Decode one payload and append it to the underlying writer.
    pub fn write_payload(&mut self, payload: &[u8]) -> io::Result<()> {
        let mut decoded = Vec::with_capacity(payload.len());
        for &byte in payload {
            if self.pending_cr {
                self.pending_cr = false;
                match byte {
                    b'\n' => {
                        decoded.push(b'\n');
                        continue;
                    }
                    b'\0' => {
                        decoded.push(b'\r');
                        continue;
                    }
                    // Not legal netascii; keep the CR rather than lose data.
                    _ => decoded.push(b'\r'),
                }
            }
            if byte == b'\r' {
                self.pending_cr = true;
            } else {
                decoded.push(byte);
            }
        }
        self.inner.write_all(&decoded)
    }

    /// Flush any carried CR and the underlying writer at end of transfer.
    pub fn finish(&mut self) -> io::Result<()> {
        if self.pending_cr {
            self.pending_cr = false;
            self.inner.write_all(b"\r")?;
        }
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_all(input: &[u8], block: usize) -> Vec<u8> {
        let mut reader = NetasciiReader::new(input);
        let mut out = Vec::new();
        loop {
            let n = reader.read_block(block, &mut out).unwrap();
            if n < block {
                return out;
            }
        }
    }

    fn decode_all(input: &[u8], block: usize) -> Vec<u8> {
        let mut writer = NetasciiWriter::new(Vec::new());
        for chunk in input.chunks(block.max(1)) {
            writer.write_payload(chunk).unwrap();
        }
        writer.finish().unwrap();
        writer.inner
    }

    #[test]
    fn bare_lf_becomes_crlf() {
        assert_eq!(encode_all(b"one\ntwo\n", 512), b"one\r\ntwo\r\n");
    }

    #[test]
    fn bare_cr_becomes_cr_nul() {
        assert_eq!(encode_all(b"a\rb", 512), b"a\r\0b");
    }

    #[test]
    fn crlf_stays_crlf() {
        assert_eq!(encode_all(b"a\r\nb", 512), b"a\r\nb");
    }

    #[test]
    fn trailing_cr_gets_its_nul() {
        assert_eq!(encode_all(b"abc\r", 512), b"abc\r\0");
    }

    #[test]
    fn encoding_is_stable_across_block_boundaries() {
        let text = b"line one\nline two\rline three\r\nend";
        let whole = encode_all(text, 4096);
        for block in [1, 2, 3, 7, 512] {
            assert_eq!(encode_all(text, block), whole, "block size {block}");
        }
    }

    #[test]
    fn decode_reverses_encode() {
        let inputs: &[&[u8]] = &[
            b"plain text",
            b"unix\nlines\n",
            b"mac\rlines\r",
            b"dos\r\nlines\r\n",
            b"mixed\r\r\n\n\r",
            b"",
        ];
        for input in inputs {
            let encoded = encode_all(input, 512);
            for block in [1, 2, 5, 512] {
                assert_eq!(&decode_all(&encoded, block), input, "input {input:?}");
            }
        }
    }

    #[test]
    fn decoder_carries_cr_across_payloads() {
        let mut writer = NetasciiWriter::new(Vec::new());
        writer.write_payload(b"ab\r").unwrap();
        writer.write_payload(b"\ncd").unwrap();
        writer.finish().unwrap();
        assert_eq!(writer.inner, b"ab\ncd");
    }

    #[test]
    fn reader_reports_short_final_block() {
        let mut reader = NetasciiReader::new(&b"abcd"[..]);
        let mut out = Vec::new();
        assert_eq!(reader.read_block(3, &mut out).unwrap(), 3);
        assert_eq!(reader.read_block(3, &mut out).unwrap(), 1);
        assert_eq!(out, b"abcd");
    }
}
