//! Wire codec: `[command, data]` JSON payloads, record/end-of-message
//! framing for the reliable stream, and the datagram packer for the
//! unreliable channel.

use log::warn;
use serde_json::Value;
use thiserror::Error;

/// Separates payloads within one frame.
pub const RECORD_SEPARATOR: u8 = 0x1E;

/// Terminates a frame on the stream and every datagram.
pub const END_OF_MESSAGE: u8 = 0x1F;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed payload: {0}")]
    Parse(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("payload of {size} bytes exceeds packet size {limit}")]
    OversizedPayload { size: usize, limit: usize },
}

/// Encodes a `[command, data]` payload as a JSON string.
pub fn encode_payload(command: &str, data: &Value) -> String {
    Value::Array(vec![Value::String(command.to_string()), data.clone()]).to_string()
}

/// Decodes one record into its command and data.
///
/// The top level must be a 2-element array whose first element is a string;
/// anything else is a [`ProtocolError::Parse`].
pub fn decode_payload(record: &str) -> Result<(String, Value), ProtocolError> {
    let value: Value =
        serde_json::from_str(record).map_err(|e| ProtocolError::Parse(e.to_string()))?;
    let Value::Array(mut items) = value else {
        return Err(ProtocolError::Parse("payload is not an array".into()));
    };
    if items.len() != 2 {
        return Err(ProtocolError::Parse(format!(
            "payload has {} elements, expected 2",
            items.len()
        )));
    }
    let data = items.pop().unwrap_or(Value::Null);
    match items.pop() {
        Some(Value::String(command)) => Ok((command, data)),
        _ => Err(ProtocolError::Parse("command is not a string".into())),
    }
}

/// Joins encoded payloads into one frame: records separated by 0x1E,
/// terminated by 0x1F.
pub fn encode_frame(records: &[String]) -> Vec<u8> {
    let mut out = Vec::with_capacity(records.iter().map(|r| r.len() + 1).sum());
    for (i, record) in records.iter().enumerate() {
        if i > 0 {
            out.push(RECORD_SEPARATOR);
        }
        out.extend_from_slice(record.as_bytes());
    }
    out.push(END_OF_MESSAGE);
    out
}

/// Reassembles frames from an arbitrary sequence of stream reads.
///
/// Bytes accumulate until an end-of-message terminator arrives; each complete
/// frame is then split on the record separator. Records that are not valid
/// UTF-8 are dropped with a warning, matching the discard-one-record failure
/// model.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds freshly read bytes and returns every frame completed by them,
    /// each as its list of records.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<String>> {
        self.buf.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some(end) = self.buf.iter().position(|&b| b == END_OF_MESSAGE) {
            let frame: Vec<u8> = self.buf.drain(..=end).take(end).collect();
            let mut records = Vec::new();
            for chunk in frame.split(|&b| b == RECORD_SEPARATOR) {
                if chunk.is_empty() {
                    continue;
                }
                match std::str::from_utf8(chunk) {
                    Ok(record) => records.push(record.to_string()),
                    Err(_) => warn!("dropping record with invalid UTF-8"),
                }
            }
            frames.push(records);
        }
        frames
    }

    /// Bytes buffered while waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Packs encoded payloads into datagrams of at most `packet_size` UTF-8
/// bytes, separators and terminator included. Payload order is preserved
/// across the emitted datagrams; a single payload that cannot fit even in an
/// empty datagram is dropped with a warning.
pub fn pack_datagrams(records: &[String], packet_size: usize) -> Vec<Vec<u8>> {
    let mut datagrams = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut used = 0usize; // bytes of records plus one separator/terminator each

    for record in records {
        let cost = record.len() + 1;
        if cost > packet_size {
            warn!(
                "dropping oversized datagram payload: {} bytes exceeds packet size {}",
                record.len(),
                packet_size
            );
            continue;
        }
        if used + cost > packet_size && !current.is_empty() {
            datagrams.push(encode_frame(&current));
            current.clear();
            used = 0;
        }
        used += cost;
        current.push(record.clone());
    }
    if !current.is_empty() {
        datagrams.push(encode_frame(&current));
    }
    datagrams
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Vec2;
    use serde_json::json;

    #[test]
    fn payload_roundtrip() {
        let values = vec![
            json!(null),
            json!(42),
            json!(-2),
            json!(1.25),
            json!("hello"),
            json!(["nested", {"a": [1, 2, 3]}]),
            serde_json::to_value(Vec2::new(0.5, -7.0)).unwrap(),
        ];
        for data in values {
            let encoded = encode_payload("some_command", &data);
            let (command, decoded) = decode_payload(&encoded).unwrap();
            assert_eq!(command, "some_command");
            assert_eq!(decoded, data);
        }
    }

    #[test]
    fn vector_roundtrips_through_payload() {
        let v = Vec2::new(3.5, -0.125);
        let encoded = encode_payload("world_mouse_pos", &serde_json::to_value(v).unwrap());
        let (_, data) = decode_payload(&encoded).unwrap();
        let back: Vec2 = serde_json::from_value(data).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(decode_payload("not json").is_err());
        assert!(decode_payload("{}").is_err());
        assert!(decode_payload(r#"["one"]"#).is_err());
        assert!(decode_payload(r#"["a", 1, 2]"#).is_err());
        assert!(decode_payload(r#"[1, "swapped"]"#).is_err());
    }

    #[test]
    fn frame_roundtrip() {
        let records = vec![r#"["a",1]"#.to_string(), r#"["b",2]"#.to_string()];
        let bytes = encode_frame(&records);

        let mut assembler = FrameAssembler::new();
        let frames = assembler.push(&bytes);
        assert_eq!(frames, vec![records]);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn assembler_handles_partial_reads_and_multiple_frames() {
        let frame1 = encode_frame(&[r#"["a",1]"#.to_string()]);
        let frame2 = encode_frame(&[r#"["b",2]"#.to_string(), r#"["c",3]"#.to_string()]);
        let mut all = frame1.clone();
        all.extend_from_slice(&frame2);

        let mut assembler = FrameAssembler::new();
        let (head, tail) = all.split_at(frame1.len() + 3);
        let frames = assembler.push(head);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], vec![r#"["a",1]"#.to_string()]);
        assert!(assembler.pending() > 0);

        let frames = assembler.push(tail);
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0],
            vec![r#"["b",2]"#.to_string(), r#"["c",3]"#.to_string()]
        );
    }

    #[test]
    fn packer_respects_packet_size() {
        let record = "x".repeat(100);
        let records: Vec<String> = (0..10).map(|_| record.clone()).collect();

        let datagrams = pack_datagrams(&records, 256);
        assert!(datagrams.len() > 1);
        for datagram in &datagrams {
            assert!(datagram.len() <= 256);
            assert_eq!(*datagram.last().unwrap(), END_OF_MESSAGE);
        }

        // Order is preserved across datagrams.
        let mut assembler = FrameAssembler::new();
        let mut seen = 0;
        for datagram in &datagrams {
            for frame in assembler.push(datagram) {
                seen += frame.len();
            }
        }
        assert_eq!(seen, records.len());
    }

    #[test]
    fn packer_drops_oversized_payload_and_keeps_the_rest() {
        let oversized = "y".repeat(8192);
        let small = r#"["update_actor",["a",{}]]"#.to_string();
        let records = vec![small.clone(), oversized, small.clone()];

        let datagrams = pack_datagrams(&records, 4096);
        let mut assembler = FrameAssembler::new();
        let mut survivors = Vec::new();
        for datagram in &datagrams {
            assert!(datagram.len() <= 4096);
            for frame in assembler.push(datagram) {
                survivors.extend(frame);
            }
        }
        assert_eq!(survivors, vec![small.clone(), small]);
    }

    #[test]
    fn packer_fills_greedily_in_order() {
        let records: Vec<String> = (0..5).map(|i| format!(r#"["n",{}]"#, i)).collect();
        let datagrams = pack_datagrams(&records, 4096);
        assert_eq!(datagrams.len(), 1);

        let mut assembler = FrameAssembler::new();
        let frames = assembler.push(&datagrams[0]);
        assert_eq!(frames[0], records);
    }
}
