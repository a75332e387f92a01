// Newline-delimited JSON framing for peer connections.
//
// Grounded on the teacher's `BytesCodec` usage in `lrthrome.rs` (a
// `Decoder` wrapping a `TcpStream` via `tokio_util::codec::Framed`), but
// parses each line as an `Envelope` instead of passing raw bytes
// through.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::envelope::Envelope;

/// Splits a byte stream on `\n` and parses each line as an [`Envelope`].
///
/// A line that fails to parse as JSON is dropped along with anything
/// else currently buffered (the stream is considered corrupted at that
/// boundary, matching the original implementation's
/// `message_buffers[address] = ""` on a decode error) — reading
/// continues rather than tearing down the connection.
#[derive(Debug, Default)]
pub struct LineJsonCodec;

impl Decoder for LineJsonCodec {
    type Item = Envelope;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> std::io::Result<Option<Envelope>> {
        loop {
            let newline_pos = buf.iter().position(|b| *b == b'\n');
            let Some(pos) = newline_pos else {
                return Ok(None);
            };

            let line = buf.split_to(pos);
            buf.advance(1); // drop the '\n' itself

            match serde_json::from_slice::<Envelope>(&line) {
                Ok(envelope) => return Ok(Some(envelope)),
                Err(e) => {
                    log::warn!("malformed envelope, clearing receive buffer: {}", e);
                    buf.clear();
                    // Buffer is now empty; loop will find no more newlines
                    // and return Ok(None) to wait for more data.
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_single_line() {
        let mut codec = LineJsonCodec;
        let mut buf = BytesMut::from(&br#"{"type":"heartbeat","timestamp":1.0}
"#[..]);
        let env = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(env, Envelope::Heartbeat { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_more_data_without_newline() {
        let mut codec = LineJsonCodec;
        let mut buf = BytesMut::from(&br#"{"type":"heartbeat""#[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn clears_buffer_on_malformed_line_and_keeps_reading() {
        let mut codec = LineJsonCodec;
        let mut buf = BytesMut::from(&b"not json\nmore garbage"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_two_lines_sequentially() {
        let mut codec = LineJsonCodec;
        let mut buf = BytesMut::from(
            &br#"{"type":"chat","sender":"a","content":"hi","timestamp":1.0}
{"type":"chat","sender":"a","content":"bye","timestamp":2.0}
"#[..],
        );
        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        match (first, second) {
            (Envelope::Chat { content: c1, .. }, Envelope::Chat { content: c2, .. }) => {
                assert_eq!(c1, "hi");
                assert_eq!(c2, "bye");
            }
            _ => panic!("expected chat envelopes"),
        }
    }
}
