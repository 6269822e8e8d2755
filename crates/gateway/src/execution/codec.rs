//! SSE wire helpers: buffer draining and lossy event parsing.
//!
//! Upstream executors stream `data: <json>\n\n` frames. Network chunks
//! split frames arbitrarily, so the dispatcher buffers and drains
//! complete payloads in place; each payload is parsed leniently (unknown
//! `type` becomes a chunk) and stamped with the request's identifiers.

use serde_json::Value;

use tm_domain::{EventType, ExecutionEvent, ExecutionRequest};

/// Sentinel some upstreams append after the final event.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Take the longest valid UTF-8 prefix out of a byte buffer.
///
/// Network chunks split multi-byte characters arbitrarily; an
/// incomplete trailing sequence stays in the buffer until the next
/// chunk completes it. Malformed bytes inside the prefix become
/// U+FFFD instead of stalling the stream.
pub fn take_utf8_prefix(buffer: &mut Vec<u8>) -> String {
    let mut out = String::new();
    let mut consumed = 0;
    loop {
        match std::str::from_utf8(&buffer[consumed..]) {
            Ok(valid) => {
                out.push_str(valid);
                consumed = buffer.len();
                break;
            }
            Err(e) => {
                let valid_end = consumed + e.valid_up_to();
                if let Ok(valid) = std::str::from_utf8(&buffer[consumed..valid_end]) {
                    out.push_str(valid);
                }
                match e.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        consumed = valid_end + bad;
                    }
                    // Incomplete trailing sequence: keep it buffered.
                    None => {
                        consumed = valid_end;
                        break;
                    }
                }
            }
        }
    }
    buffer.drain(..consumed);
    out
}

/// Extract complete `data:` payloads from an SSE buffer.
///
/// Events are delimited by `\n\n`; only `data:` lines matter. Consumed
/// bytes are removed and a trailing partial event stays for next time.
pub fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        for line in block.lines() {
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }

    data_lines
}

/// Build an `ExecutionEvent` from an upstream stream payload.
///
/// Upstream events carry only their own fields; task/subtask/message
/// identifiers always come from the originating request so subscribers
/// can order them. Field extraction is forgiving: absent fields default
/// rather than fail (a malformed frame is skipped by the caller, not a
/// reason to kill the stream).
pub fn event_from_stream_json(request: &ExecutionRequest, data: &Value) -> ExecutionEvent {
    let event_type = data
        .get("type")
        .and_then(Value::as_str)
        .map(EventType::parse_lossy)
        .unwrap_or(EventType::Chunk);

    let mut event = ExecutionEvent::new(event_type, request.task_id, request.subtask_id);
    event.message_id = request.message_id;
    event.content = data
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_owned();
    event.offset = data.get("offset").and_then(Value::as_i64).unwrap_or(0);
    event.result = data.get("result").filter(|v| !v.is_null()).cloned();
    event.error = data
        .get("error")
        .and_then(Value::as_str)
        .map(String::from);
    event.progress = data
        .get("progress")
        .and_then(Value::as_u64)
        .map(|p| p.min(100) as u8);
    event.status = data
        .get("status")
        .and_then(Value::as_str)
        .map(String::from);
    event.tool_use_id = data
        .get("tool_use_id")
        .and_then(Value::as_str)
        .map(String::from);
    event.tool_name = data
        .get("tool_name")
        .and_then(Value::as_str)
        .map(String::from);
    event.tool_input = data.get("tool_input").filter(|v| !v.is_null()).cloned();
    event.tool_output = data.get("tool_output").filter(|v| !v.is_null()).cloned();
    event.data = data.get("data").filter(|v| !v.is_null()).cloned();
    event
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ExecutionRequest {
        let mut request = ExecutionRequest::new(42, 7);
        request.message_id = Some(3);
        request
    }

    #[test]
    fn utf8_prefix_carries_split_characters() {
        // "你好" split mid-character across two network chunks.
        let full = "data: 你好\n\n".as_bytes();
        let mut buffer = full[..8].to_vec();
        let first = take_utf8_prefix(&mut buffer);
        assert_eq!(first, "data: ");
        // The two leading bytes of 你 stay buffered.
        assert_eq!(buffer.len(), 2);

        buffer.extend_from_slice(&full[8..]);
        let second = take_utf8_prefix(&mut buffer);
        assert_eq!(second, "你好\n\n");
        assert!(buffer.is_empty());
    }

    #[test]
    fn utf8_prefix_ascii_passthrough() {
        let mut buffer = b"data: hi\n\n".to_vec();
        assert_eq!(take_utf8_prefix(&mut buffer), "data: hi\n\n");
        assert!(buffer.is_empty());
    }

    #[test]
    fn utf8_prefix_replaces_malformed_bytes() {
        let mut buffer = vec![b'a', 0xff, b'b'];
        assert_eq!(take_utf8_prefix(&mut buffer), "a\u{FFFD}b");
        assert!(buffer.is_empty());
    }

    #[test]
    fn utf8_prefix_empty_buffer() {
        let mut buffer = Vec::new();
        assert_eq!(take_utf8_prefix(&mut buffer), "");
    }

    #[test]
    fn drain_single_complete_event() {
        let mut buf = String::from("event: message\ndata: {\"type\":\"chunk\"}\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["{\"type\":\"chunk\"}"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_partial_event_stays_buffered() {
        let mut buf = String::from("data: whole\n\ndata: part");
        assert_eq!(drain_data_lines(&mut buf), vec!["whole"]);
        assert_eq!(buf, "data: part");

        buf.push_str("ial\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["partial"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_multiple_and_ignores_other_fields() {
        let mut buf = String::from("id: 1\nretry: 500\ndata: a\n\ndata: b\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["a", "b"]);
    }

    #[test]
    fn drain_done_sentinel_passes_through() {
        let mut buf = String::from("data: [DONE]\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec![DONE_SENTINEL]);
    }

    #[test]
    fn stream_event_gets_request_identity() {
        let data = serde_json::json!({"type": "chunk", "content": "he", "offset": 0});
        let event = event_from_stream_json(&request(), &data);
        assert_eq!(event.event_type, EventType::Chunk);
        assert_eq!(event.task_id, 42);
        assert_eq!(event.subtask_id, 7);
        assert_eq!(event.message_id, Some(3));
        assert_eq!(event.content, "he");
    }

    #[test]
    fn unknown_type_becomes_chunk() {
        let data = serde_json::json!({"type": "wibble", "content": "x"});
        let event = event_from_stream_json(&request(), &data);
        assert_eq!(event.event_type, EventType::Chunk);
        assert_eq!(event.content, "x");
    }

    #[test]
    fn missing_type_becomes_chunk() {
        let data = serde_json::json!({"content": "x"});
        assert_eq!(
            event_from_stream_json(&request(), &data).event_type,
            EventType::Chunk
        );
    }

    #[test]
    fn done_event_with_result() {
        let data = serde_json::json!({"type": "done", "result": {"value": "hello"}});
        let event = event_from_stream_json(&request(), &data);
        assert_eq!(event.event_type, EventType::Done);
        assert!(event.is_terminal());
        assert_eq!(event.result.unwrap()["value"], "hello");
    }

    #[test]
    fn tool_events_carry_tool_fields() {
        let data = serde_json::json!({
            "type": "tool_start",
            "tool_use_id": "t1",
            "tool_name": "search",
            "tool_input": {"q": "rust"},
        });
        let event = event_from_stream_json(&request(), &data);
        assert_eq!(event.event_type, EventType::ToolStart);
        assert_eq!(event.tool_use_id.as_deref(), Some("t1"));
        assert_eq!(event.tool_name.as_deref(), Some("search"));
        assert_eq!(event.tool_input.unwrap()["q"], "rust");
    }

    #[test]
    fn progress_clamps_to_100() {
        let data = serde_json::json!({"type": "progress", "progress": 250});
        let event = event_from_stream_json(&request(), &data);
        assert_eq!(event.progress, Some(100));
    }
}
