use std::io;

use crate::protocol::chat::ChatStreamChunk;
use crate::stream::sse::SseLineScanner;
use crate::util::{push_json_string_escaped, push_u64_decimal};

/// State for rewriting one live Chat Completions SSE stream into Responses
/// API lifecycle events.
///
/// A session is scoped to exactly one client response. Feed it the stream's
/// lines through [`Self::process_line`]; every synthesized event carries a
/// `sequence_number` that increases by exactly one, and a terminal
/// `response.completed` is emitted at most once no matter how many
/// `finish_reason` chunks or `[DONE]` markers the upstream sends.
pub struct TranscodeSession {
    response_id: String,
    item_id: String,
    sequence_number: u64,
    initialized: bool,
    accumulated_text: String,
    completed: bool,
}

impl TranscodeSession {
    #[must_use]
    pub fn new() -> Self {
        Self {
            response_id: String::new(),
            item_id: String::new(),
            sequence_number: 0,
            initialized: false,
            accumulated_text: String::new(),
            completed: false,
        }
    }

    /// Process one SSE line (whitespace-trimmed first) and append any output
    /// to `out`.
    ///
    /// - Blank lines are dropped; synthesized frames carry their own
    ///   separators.
    /// - Lines without the `data: ` marker (comments, event-type lines) are
    ///   forwarded verbatim.
    /// - `data: [DONE]` is swallowed, synthesizing a minimal
    ///   `response.completed` first if the upstream never sent a
    ///   `finish_reason`.
    /// - A `data:` payload that fails to decode is forwarded verbatim.
    pub fn process_line(&mut self, line: &[u8], out: &mut Vec<u8>) {
        let line = line.trim_ascii();
        if line.is_empty() {
            return;
        }
        let Some(payload) = line.strip_prefix(b"data: ") else {
            forward_line(line, out);
            return;
        };
        if payload == b"[DONE]" {
            // Some upstreams end the stream without any finish_reason; the
            // client still needs exactly one terminal event.
            if !self.completed {
                self.emit_bare_completed(out);
                self.completed = true;
            }
            return;
        }
        match serde_json::from_slice::<ChatStreamChunk>(payload) {
            Ok(chunk) => self.emit_chunk_events(&chunk, out),
            Err(error) => {
                tracing::warn!(error = %error, "failed to decode upstream chunk, forwarding line verbatim");
                forward_line(line, out);
            }
        }
    }

    fn emit_chunk_events(&mut self, chunk: &ChatStreamChunk, out: &mut Vec<u8>) {
        if !self.initialized {
            self.initialized = true;
            self.response_id = chunk.id.clone();
            self.item_id = format!("msg_{}", self.response_id);
            self.emit_setup(chunk, out);
        }

        let Some(choice) = chunk.choices.first() else {
            return;
        };
        if let Some(content) = choice.delta.content.as_deref() {
            if !content.is_empty() {
                self.accumulated_text.push_str(content);
                self.emit_delta(content, out);
            }
        }
        if choice.finish_reason.is_some() && !self.completed {
            self.emit_terminal(chunk, out);
            self.completed = true;
        }
    }

    // The four setup events, emitted exactly once per session even when the
    // first decodable chunk carries no text.
    fn emit_setup(&mut self, chunk: &ChatStreamChunk, out: &mut Vec<u8>) {
        let mut frame = String::with_capacity(192 + chunk.id.len());
        push_frame_head(
            &mut frame,
            "response.created",
            self.next_sequence_number(),
        );
        push_response_object(&mut frame, &chunk.id, chunk.created, "in_progress");
        frame.push_str("\n\n");
        out.extend_from_slice(frame.as_bytes());

        frame.clear();
        push_frame_head(
            &mut frame,
            "response.in_progress",
            self.next_sequence_number(),
        );
        push_response_object(&mut frame, &chunk.id, chunk.created, "in_progress");
        frame.push_str("\n\n");
        out.extend_from_slice(frame.as_bytes());

        frame.clear();
        push_frame_head(
            &mut frame,
            "response.output_item.added",
            self.next_sequence_number(),
        );
        frame.push_str(",\"output_index\":0,\"item\":{\"id\":");
        push_json_string_escaped(&mut frame, &self.item_id);
        frame.push_str(
            ",\"type\":\"message\",\"role\":\"assistant\",\"status\":\"in_progress\",\"content\":[]}}\n\n",
        );
        out.extend_from_slice(frame.as_bytes());

        frame.clear();
        push_frame_head(
            &mut frame,
            "response.content_part.added",
            self.next_sequence_number(),
        );
        frame.push_str(",\"item_id\":");
        push_json_string_escaped(&mut frame, &self.item_id);
        frame.push_str(",\"output_index\":0,\"content_index\":0,\"part\":");
        push_text_part(&mut frame, "");
        frame.push_str("}\n\n");
        out.extend_from_slice(frame.as_bytes());
    }

    fn emit_delta(&mut self, delta: &str, out: &mut Vec<u8>) {
        let mut frame = String::with_capacity(160 + self.item_id.len() + delta.len());
        push_frame_head(
            &mut frame,
            "response.output_text.delta",
            self.next_sequence_number(),
        );
        frame.push_str(",\"item_id\":");
        push_json_string_escaped(&mut frame, &self.item_id);
        frame.push_str(",\"output_index\":0,\"content_index\":0,\"delta\":");
        push_json_string_escaped(&mut frame, delta);
        frame.push_str("}\n\n");
        out.extend_from_slice(frame.as_bytes());
    }

    // The terminal run: part/text/item done with the full accumulated text,
    // then response.completed stamped with the finishing chunk's id and
    // created timestamp.
    fn emit_terminal(&mut self, chunk: &ChatStreamChunk, out: &mut Vec<u8>) {
        let mut frame =
            String::with_capacity(224 + self.item_id.len() + self.accumulated_text.len());
        push_frame_head(
            &mut frame,
            "response.content_part.done",
            self.next_sequence_number(),
        );
        frame.push_str(",\"item_id\":");
        push_json_string_escaped(&mut frame, &self.item_id);
        frame.push_str(",\"output_index\":0,\"content_index\":0,\"part\":");
        push_text_part(&mut frame, &self.accumulated_text);
        frame.push_str("}\n\n");
        out.extend_from_slice(frame.as_bytes());

        frame.clear();
        push_frame_head(
            &mut frame,
            "response.output_text.done",
            self.next_sequence_number(),
        );
        frame.push_str(",\"item_id\":");
        push_json_string_escaped(&mut frame, &self.item_id);
        frame.push_str(",\"output_index\":0,\"content_index\":0,\"text\":");
        push_json_string_escaped(&mut frame, &self.accumulated_text);
        frame.push_str("}\n\n");
        out.extend_from_slice(frame.as_bytes());

        frame.clear();
        push_frame_head(
            &mut frame,
            "response.output_item.done",
            self.next_sequence_number(),
        );
        frame.push_str(",\"output_index\":0,\"item\":{\"id\":");
        push_json_string_escaped(&mut frame, &self.item_id);
        frame.push_str(
            ",\"type\":\"message\",\"role\":\"assistant\",\"status\":\"completed\",\"content\":[",
        );
        push_text_part(&mut frame, &self.accumulated_text);
        frame.push_str("]}}\n\n");
        out.extend_from_slice(frame.as_bytes());

        frame.clear();
        push_frame_head(
            &mut frame,
            "response.completed",
            self.next_sequence_number(),
        );
        push_response_object(&mut frame, &chunk.id, chunk.created, "completed");
        frame.push_str("\n\n");
        out.extend_from_slice(frame.as_bytes());
    }

    fn emit_bare_completed(&mut self, out: &mut Vec<u8>) {
        let mut frame = String::with_capacity(96);
        push_frame_head(
            &mut frame,
            "response.completed",
            self.next_sequence_number(),
        );
        frame.push_str("}\n\n");
        out.extend_from_slice(frame.as_bytes());
    }

    fn next_sequence_number(&mut self) -> u64 {
        self.sequence_number += 1;
        self.sequence_number
    }
}

impl Default for TranscodeSession {
    fn default() -> Self {
        Self::new()
    }
}

fn forward_line(line: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(line);
    out.push(b'\n');
}

// "event: TYPE\ndata: {"type":TYPE,"sequence_number":N" — every payload
// opens with its type and sequence number; the caller closes the braces.
fn push_frame_head(out: &mut String, event_type: &str, sequence_number: u64) {
    out.push_str("event: ");
    out.push_str(event_type);
    out.push_str("\ndata: {\"type\":\"");
    out.push_str(event_type);
    out.push_str("\",\"sequence_number\":");
    push_u64_decimal(out, sequence_number);
}

fn push_response_object(out: &mut String, id: &str, created_at: u64, status: &str) {
    out.push_str(",\"response\":{\"id\":");
    push_json_string_escaped(out, id);
    out.push_str(",\"object\":\"response\",\"created_at\":");
    push_u64_decimal(out, created_at);
    out.push_str(",\"status\":\"");
    out.push_str(status);
    out.push_str("\"}}");
}

fn push_text_part(out: &mut String, text: &str) {
    out.push_str("{\"type\":\"output_text\",\"text\":");
    push_json_string_escaped(out, text);
    out.push_str(",\"annotations\":[]}");
}

/// Wraps a client-facing byte sink for one proxied response, rewriting Chat
/// Completions SSE into Responses API events as bytes pass through.
///
/// When `transform_sse` is false (the upstream reply is not
/// `text/event-stream`), every write is forwarded untouched. The session is
/// created lazily on the first transformed write, and the wrapped sink stays
/// reachable through [`Self::into_inner`] for control operations the wrapper
/// does not model.
pub struct TranscodingWriter<W> {
    sink: W,
    transform: bool,
    scanner: SseLineScanner,
    session: Option<TranscodeSession>,
    staged: Vec<u8>,
}

impl<W: io::Write> TranscodingWriter<W> {
    #[must_use]
    pub fn new(sink: W, transform_sse: bool) -> Self {
        Self {
            sink,
            transform: transform_sse,
            scanner: SseLineScanner::new(),
            session: None,
            staged: Vec::new(),
        }
    }

    /// Process a trailing partial line after the upstream body ended cleanly.
    ///
    /// Skip this on error or cancel paths so a truncated record is never
    /// processed as if it were complete.
    ///
    /// # Errors
    ///
    /// Propagates write errors from the wrapped sink.
    pub fn finish(&mut self) -> io::Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        self.staged.clear();
        let staged = &mut self.staged;
        self.scanner.finish(|line| session.process_line(line, staged));
        if self.staged.is_empty() {
            return Ok(());
        }
        self.sink.write_all(&self.staged)
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

impl<W: io::Write> io::Write for TranscodingWriter<W> {
    /// Consumes the whole input chunk; the number of bytes reaching the sink
    /// differs from `data.len()` whenever events are synthesized.
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if !self.transform {
            return self.sink.write(data);
        }
        let session = self.session.get_or_insert_with(TranscodeSession::new);
        self.staged.clear();
        let staged = &mut self.staged;
        self.scanner.feed(data, |line| session.process_line(line, staged));
        if !self.staged.is_empty() {
            self.sink.write_all(&self.staged)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}
