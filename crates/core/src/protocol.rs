//! Decoder for the event-stream chat protocol.
//!
//! The backend answers a chat turn with newline-delimited, prefix-tagged
//! frames (`data: <json>\n\n`). Frames may arrive split across network reads,
//! so the decoder keeps the trailing incomplete line in a byte buffer between
//! calls. One malformed frame must never abort an otherwise-healthy stream:
//! anything unparseable is dropped with a log line.

use serde::Deserialize;
use tracing::{debug, warn};

/// Prefix of every well-formed frame line.
pub const DATA_PREFIX: &str = "data: ";

/// Sentinel payload signalling end-of-stream, distinct from JSON frames.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Part id synthesized for legacy `{content}` frames, which carry no id.
pub const LEGACY_PART_ID: &str = "part-legacy";

/// A decoded protocol event, in arrival order.
///
/// `start` frames are decoded but not surfaced: the message store creates
/// the assistant turn itself when the first content event arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A new mutable text part begins.
    TextStart { id: String },
    /// Append `delta` to the text part identified by `id`.
    TextDelta { id: String, delta: String },
    /// The identified text part becomes immutable.
    TextEnd { id: String },
    /// Terminal; no further events follow.
    Finish,
}

/// Wire shape of a frame carrying a `type` field.
#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum TaggedFrame {
    #[serde(rename = "start")]
    Start,
    #[serde(rename = "text-start")]
    TextStart { id: String },
    #[serde(rename = "text-delta")]
    TextDelta {
        id: String,
        #[serde(default)]
        delta: Option<String>,
    },
    #[serde(rename = "text-end")]
    TextEnd { id: String },
    #[serde(rename = "finish")]
    Finish,
    #[serde(other)]
    Unknown,
}

/// Wire shape of a legacy frame (no `type` field).
#[derive(Deserialize, Debug)]
struct LegacyFrame {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    done: Option<bool>,
}

/// Incremental frame decoder with a carry-over buffer for split lines.
///
/// The buffer holds raw bytes, not text, so a multi-byte UTF-8 sequence
/// split across reads survives until its line completes.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    carry: Vec<u8>,
    finished: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a terminal frame (`finish`, `{done:true}`, or `[DONE]`)
    /// has been processed. No events are emitted afterwards.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feeds one network read and returns the events completed by it,
    /// strictly in arrival order. The final (possibly incomplete) line
    /// fragment is retained for the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.carry.extend_from_slice(chunk);

        while let Some(pos) = self.carry.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.carry.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            self.decode_line(line.trim_end_matches(['\n', '\r']), &mut events);
            if self.finished {
                // Terminal frame: discard anything still buffered.
                self.carry.clear();
                break;
            }
        }
        events
    }

    fn decode_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        if line.is_empty() {
            return;
        }
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            warn!(line, "dropping stream line without data prefix");
            return;
        };
        if payload == DONE_SENTINEL {
            debug!("stream end sentinel received");
            self.finished = true;
            return;
        }

        let value: serde_json::Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, payload, "dropping malformed frame");
                return;
            }
        };

        if value.get("type").is_some() {
            self.decode_tagged(value, payload, events);
        } else {
            self.decode_legacy(value, payload, events);
        }
    }

    fn decode_tagged(
        &mut self,
        value: serde_json::Value,
        payload: &str,
        events: &mut Vec<StreamEvent>,
    ) {
        match serde_json::from_value::<TaggedFrame>(value) {
            Ok(TaggedFrame::Start) => debug!("message start frame"),
            Ok(TaggedFrame::TextStart { id }) => events.push(StreamEvent::TextStart { id }),
            Ok(TaggedFrame::TextDelta { id, delta }) => {
                // A null or empty delta is a no-op, never the literal "null".
                if let Some(delta) = delta.filter(|d| !d.is_empty()) {
                    events.push(StreamEvent::TextDelta { id, delta });
                }
            }
            Ok(TaggedFrame::TextEnd { id }) => events.push(StreamEvent::TextEnd { id }),
            Ok(TaggedFrame::Finish) => {
                events.push(StreamEvent::Finish);
                self.finished = true;
            }
            Ok(TaggedFrame::Unknown) => warn!(payload, "dropping frame with unknown type"),
            Err(e) => warn!(error = %e, payload, "dropping frame with invalid fields"),
        }
    }

    fn decode_legacy(
        &mut self,
        value: serde_json::Value,
        payload: &str,
        events: &mut Vec<StreamEvent>,
    ) {
        let frame: LegacyFrame = match serde_json::from_value(value) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, payload, "dropping unrecognized legacy frame");
                return;
            }
        };
        if frame.done == Some(true) {
            events.push(StreamEvent::Finish);
            self.finished = true;
        } else if let Some(content) = frame.content.filter(|c| !c.is_empty()) {
            events.push(StreamEvent::TextDelta {
                id: LEGACY_PART_ID.to_string(),
                delta: content,
            });
        } else {
            warn!(payload, "dropping legacy frame without content");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut FrameDecoder, input: &[u8]) -> Vec<StreamEvent> {
        decoder.feed(input)
    }

    fn delta(id: &str, text: &str) -> StreamEvent {
        StreamEvent::TextDelta {
            id: id.to_string(),
            delta: text.to_string(),
        }
    }

    const SCRIPT: &str = concat!(
        "data: {\"type\":\"start\"}\n\n",
        "data: {\"type\":\"text-start\",\"id\":\"p1\"}\n\n",
        "data: {\"type\":\"text-delta\",\"id\":\"p1\",\"delta\":\"Slide\"}\n\n",
        "data: {\"type\":\"text-delta\",\"id\":\"p1\",\"delta\":\" 3 covers...\"}\n\n",
        "data: {\"type\":\"text-end\",\"id\":\"p1\"}\n\n",
        "data: {\"type\":\"finish\"}\n\n",
    );

    fn expected_script_events() -> Vec<StreamEvent> {
        vec![
            StreamEvent::TextStart {
                id: "p1".to_string(),
            },
            delta("p1", "Slide"),
            delta("p1", " 3 covers..."),
            StreamEvent::TextEnd {
                id: "p1".to_string(),
            },
            StreamEvent::Finish,
        ]
    }

    #[test]
    fn decodes_a_whole_stream_in_one_read() {
        let mut decoder = FrameDecoder::new();
        let events = decode_all(&mut decoder, SCRIPT.as_bytes());
        assert_eq!(events, expected_script_events());
        assert!(decoder.is_finished());
    }

    #[test]
    fn chunk_splits_do_not_change_the_event_sequence() {
        let bytes = SCRIPT.as_bytes();
        // Split the same total bytes at every possible chunk size, including
        // mid-line and mid-JSON, and require an identical event sequence.
        for chunk_size in 1..=bytes.len() {
            let mut decoder = FrameDecoder::new();
            let mut events = Vec::new();
            for chunk in bytes.chunks(chunk_size) {
                events.extend(decoder.feed(chunk));
            }
            assert_eq!(events, expected_script_events(), "chunk size {chunk_size}");
        }
    }

    #[test]
    fn multibyte_utf8_split_across_reads_survives() {
        let frame = "data: {\"type\":\"text-delta\",\"id\":\"p1\",\"delta\":\"héllo\"}\n";
        let bytes = frame.as_bytes();
        // Feed one byte at a time so the two-byte 'é' is always split.
        let mut decoder = FrameDecoder::new();
        let mut events = Vec::new();
        for b in bytes {
            events.extend(decoder.feed(std::slice::from_ref(b)));
        }
        assert_eq!(events, vec![delta("p1", "héllo")]);
    }

    #[test]
    fn null_missing_and_empty_deltas_are_no_ops() {
        let mut decoder = FrameDecoder::new();
        let input = concat!(
            "data: {\"type\":\"text-delta\",\"id\":\"p1\",\"delta\":null}\n",
            "data: {\"type\":\"text-delta\",\"id\":\"p1\"}\n",
            "data: {\"type\":\"text-delta\",\"id\":\"p1\",\"delta\":\"\"}\n",
        );
        assert!(decode_all(&mut decoder, input.as_bytes()).is_empty());
    }

    #[test]
    fn done_sentinel_discards_the_rest_of_the_batch() {
        let mut decoder = FrameDecoder::new();
        let input = concat!(
            "data: {\"type\":\"text-delta\",\"id\":\"p1\",\"delta\":\"a\"}\n",
            "data: [DONE]\n",
            "data: {\"type\":\"text-delta\",\"id\":\"p1\",\"delta\":\"b\"}\n",
        );
        let events = decode_all(&mut decoder, input.as_bytes());
        assert_eq!(events, vec![delta("p1", "a")]);
        assert!(decoder.is_finished());
        // Later reads are ignored entirely.
        assert!(decoder
            .feed(b"data: {\"type\":\"text-delta\",\"id\":\"p1\",\"delta\":\"c\"}\n")
            .is_empty());
    }

    #[test]
    fn finish_frame_discards_the_rest_of_the_batch() {
        let mut decoder = FrameDecoder::new();
        let input = concat!(
            "data: {\"type\":\"finish\"}\n",
            "data: {\"type\":\"text-delta\",\"id\":\"p1\",\"delta\":\"late\"}\n",
        );
        let events = decode_all(&mut decoder, input.as_bytes());
        assert_eq!(events, vec![StreamEvent::Finish]);
        assert!(decoder.is_finished());
    }

    #[test]
    fn malformed_json_is_dropped_and_the_stream_continues() {
        let mut decoder = FrameDecoder::new();
        let input = concat!(
            "data: {not json}\n",
            "data: {\"type\":\"text-delta\",\"id\":\"p1\",\"delta\":\"ok\"}\n",
        );
        assert_eq!(decode_all(&mut decoder, input.as_bytes()), vec![delta("p1", "ok")]);
    }

    #[test]
    fn unknown_type_and_foreign_lines_are_dropped() {
        let mut decoder = FrameDecoder::new();
        let input = concat!(
            "event: ping\n",
            "data: {\"type\":\"tool-call\",\"id\":\"t1\"}\n",
            "data: {\"type\":\"text-delta\",\"id\":\"p1\",\"delta\":\"ok\"}\n",
        );
        assert_eq!(decode_all(&mut decoder, input.as_bytes()), vec![delta("p1", "ok")]);
        assert!(!decoder.is_finished());
    }

    #[test]
    fn frame_with_missing_required_field_is_dropped() {
        let mut decoder = FrameDecoder::new();
        let input = "data: {\"type\":\"text-start\"}\n";
        assert!(decode_all(&mut decoder, input.as_bytes()).is_empty());
    }

    #[test]
    fn legacy_content_and_done_frames_are_supported() {
        let mut decoder = FrameDecoder::new();
        let input = concat!("data: {\"content\":\"Hi\"}\n", "data: {\"done\":true}\n");
        let events = decode_all(&mut decoder, input.as_bytes());
        assert_eq!(
            events,
            vec![delta(LEGACY_PART_ID, "Hi"), StreamEvent::Finish]
        );
        assert!(decoder.is_finished());
    }

    #[test]
    fn legacy_frame_without_content_is_dropped() {
        let mut decoder = FrameDecoder::new();
        assert!(decode_all(&mut decoder, b"data: {\"other\":1}\n").is_empty());
        assert!(!decoder.is_finished());
    }

    #[test]
    fn crlf_line_endings_are_tolerated() {
        let mut decoder = FrameDecoder::new();
        let input = "data: {\"type\":\"text-delta\",\"id\":\"p1\",\"delta\":\"ok\"}\r\n\r\n";
        assert_eq!(decode_all(&mut decoder, input.as_bytes()), vec![delta("p1", "ok")]);
    }

    #[test]
    fn incomplete_trailing_line_waits_for_the_next_read() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder
            .feed(b"data: {\"type\":\"text-delta\",\"id\":\"p1\",\"delta\":\"ab")
            .is_empty());
        let events = decoder.feed(b"c\"}\n");
        assert_eq!(events, vec![delta("p1", "abc")]);
    }
}
