use std::io::Write;

use responsify_rs::protocol::convert::responses_to_chat;
use responsify_rs::protocol::responses::ResponsesRequest;
use responsify_rs::rewrite::rewrite_model;
use responsify_rs::stream::{SseLineScanner, TranscodeSession, TranscodingWriter};
use rustc_hash::FxHashMap;
use serde_json::{json, Value};

fn codex_style_request() -> ResponsesRequest {
    serde_json::from_value(json!({
        "model": "gpt-5-codex",
        "instructions": "You are a coding assistant.",
        "input": [
            {
                "role": "developer",
                "content": [{"type": "input_text", "text": "Prefer small diffs."}]
            },
            {
                "role": "user",
                "content": [
                    {"type": "input_text", "text": "Fix the bug in main.rs"},
                    {"type": "input_text", "text": "ignored second part"}
                ]
            }
        ],
        "tools": [
            {"type": "web_search"},
            {
                "type": "function",
                "name": "read_file",
                "description": "Read a file",
                "parameters": {"type": "object", "properties": {"path": {"type": "string"}}},
                "strict": true
            }
        ],
        "tool_choice": "auto",
        "max_output_tokens": 4096,
        "temperature": 0.2,
        "stream": true
    }))
    .expect("responses request should decode")
}

fn upstream_chat_body() -> Vec<u8> {
    concat!(
        "data: {\"id\":\"chatcmpl-abc123\",\"object\":\"chat.completion.chunk\",\"created\":1694268190,\"model\":\"glm-4.6\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}]}\n\n",
        "data: {\"id\":\"chatcmpl-abc123\",\"object\":\"chat.completion.chunk\",\"created\":1694268190,\"model\":\"glm-4.6\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"id\":\"chatcmpl-abc123\",\"object\":\"chat.completion.chunk\",\"created\":1694268190,\"model\":\"glm-4.6\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo!\"}}]}\n\n",
        "data: {\"id\":\"chatcmpl-abc123\",\"object\":\"chat.completion.chunk\",\"created\":1694268191,\"model\":\"glm-4.6\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: {\"id\":\"chatcmpl-abc123\",\"object\":\"chat.completion.chunk\",\"created\":1694268191,\"model\":\"glm-4.6\",\"choices\":[],\"usage\":{\"prompt_tokens\":12,\"completion_tokens\":3,\"total_tokens\":15}}\n\n",
        "data: [DONE]\n\n",
    )
    .as_bytes()
    .to_vec()
}

fn transcode_whole(body: &[u8]) -> Vec<u8> {
    let mut scanner = SseLineScanner::new();
    let mut session = TranscodeSession::new();
    let mut out = Vec::new();
    scanner.feed(body, |line| session.process_line(line, &mut out));
    scanner.finish(|line| session.process_line(line, &mut out));
    out
}

fn parse_event_frames(raw: &[u8]) -> Vec<(String, Value)> {
    let text = std::str::from_utf8(raw).expect("transcoded output should be UTF-8");
    let mut frames = Vec::new();
    for segment in text.split_terminator("\n\n") {
        let mut lines = segment.lines();
        let event_line = lines.next().expect("segment should have an event line");
        let data_line = lines.next().expect("segment should have a data line");
        let event_type = event_line
            .strip_prefix("event: ")
            .expect("segment should start with an event line");
        let payload = data_line
            .strip_prefix("data: ")
            .expect("segment should carry a data line");
        frames.push((
            event_type.to_string(),
            serde_json::from_str(payload).expect("payload should be JSON"),
        ));
    }
    frames
}

#[test]
fn test_codex_style_request_converts_end_to_end() {
    let chat = responses_to_chat(&codex_style_request());
    let wire = serde_json::to_value(&chat).expect("chat request should encode");

    assert_eq!(
        wire["messages"],
        json!([
            {"role": "system", "content": "You are a coding assistant."},
            {"role": "system", "content": "Prefer small diffs."},
            {"role": "user", "content": "Fix the bug in main.rs"}
        ])
    );
    assert_eq!(
        wire["tools"],
        json!([{
            "type": "function",
            "function": {
                "name": "read_file",
                "description": "Read a file",
                "parameters": {"type": "object", "properties": {"path": {"type": "string"}}},
                "strict": true
            }
        }])
    );
    assert_eq!(wire["tool_choice"], json!("auto"));
    assert_eq!(wire["max_tokens"], json!(4096));
    assert_eq!(wire["temperature"], json!(0.2));
    assert_eq!(wire["stream"], json!(true));
    assert_eq!(wire["model"], json!("gpt-5-codex"));
    assert!(wire.get("max_output_tokens").is_none());
    assert!(wire.get("instructions").is_none());
}

#[test]
fn test_converted_request_feeds_the_model_rewrite() {
    let chat = responses_to_chat(&codex_style_request());
    let body = serde_json::to_vec(&chat).expect("chat request should encode");

    let mut model_map = FxHashMap::default();
    model_map.insert("gpt-5-codex".to_string(), "glm-4.6".to_string());

    let rewritten = rewrite_model(&body, &model_map)
        .expect("rewrite should succeed")
        .expect("model should change");
    let wire: Value = serde_json::from_slice(&rewritten).expect("rewritten body should be JSON");
    assert_eq!(wire["model"], json!("glm-4.6"));
    assert_eq!(wire["messages"][2]["content"], json!("Fix the bug in main.rs"));
}

#[test]
fn test_streamed_reply_transcodes_to_responses_events() {
    let out = transcode_whole(&upstream_chat_body());
    let frames = parse_event_frames(&out);

    let types: Vec<&str> = frames.iter().map(|(t, _)| t.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "response.created",
            "response.in_progress",
            "response.output_item.added",
            "response.content_part.added",
            "response.output_text.delta",
            "response.output_text.delta",
            "response.content_part.done",
            "response.output_text.done",
            "response.output_item.done",
            "response.completed",
        ]
    );

    let sequence: Vec<u64> = frames
        .iter()
        .map(|(_, payload)| payload["sequence_number"].as_u64().expect("sequence"))
        .collect();
    assert_eq!(sequence, (1..=10).collect::<Vec<u64>>());

    assert_eq!(frames[0].1["response"]["id"], json!("chatcmpl-abc123"));
    assert_eq!(frames[4].1["delta"], json!("Hel"));
    assert_eq!(frames[5].1["delta"], json!("lo!"));
    assert_eq!(frames[7].1["text"], json!("Hello!"));
    assert_eq!(frames[8].1["item"]["content"][0]["text"], json!("Hello!"));
    assert_eq!(frames[9].1["response"]["status"], json!("completed"));

    let completed_count = frames
        .iter()
        .filter(|(t, _)| t == "response.completed")
        .count();
    assert_eq!(completed_count, 1);
}

#[test]
fn test_network_fragmentation_does_not_change_the_event_stream() {
    let body = upstream_chat_body();
    let reference = transcode_whole(&body);

    for chunk_size in [1usize, 7, 64] {
        let mut scanner = SseLineScanner::new();
        let mut session = TranscodeSession::new();
        let mut out = Vec::new();
        for chunk in body.chunks(chunk_size) {
            scanner.feed(chunk, |line| session.process_line(line, &mut out));
        }
        scanner.finish(|line| session.process_line(line, &mut out));
        assert_eq!(out, reference, "chunk size {chunk_size}");
    }
}

#[test]
fn test_multibyte_delta_survives_a_mid_codepoint_split() {
    let body = "data: {\"id\":\"c1\",\"created\":1,\"choices\":[{\"delta\":{\"content\":\"日本語テキスト\"}}]}\n\ndata: {\"id\":\"c1\",\"created\":1,\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n"
        .as_bytes();
    // Split inside the first multi-byte character of the delta.
    let split = body
        .windows(3)
        .position(|window| window == "日".as_bytes())
        .expect("delta should contain the marker")
        + 1;

    let mut scanner = SseLineScanner::new();
    let mut session = TranscodeSession::new();
    let mut out = Vec::new();
    scanner.feed(&body[..split], |line| session.process_line(line, &mut out));
    scanner.feed(&body[split..], |line| session.process_line(line, &mut out));
    scanner.finish(|line| session.process_line(line, &mut out));

    let frames = parse_event_frames(&out);
    assert_eq!(frames[4].1["delta"], json!("日本語テキスト"));
    assert_eq!(frames[6].1["text"], json!("日本語テキスト"));
}

#[test]
fn test_crlf_terminated_stream_matches_lf() {
    let body = upstream_chat_body();
    let crlf_body = String::from_utf8(body.clone())
        .expect("body is UTF-8")
        .replace('\n', "\r\n");

    let lf_frames = parse_event_frames(&transcode_whole(&body));
    let crlf_frames = parse_event_frames(&transcode_whole(crlf_body.as_bytes()));
    assert_eq!(lf_frames, crlf_frames);
}

#[test]
fn test_keepalive_comments_are_forwarded_between_frames() {
    let body = concat!(
        "data: {\"id\":\"c1\",\"created\":1,\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
        ": keep-alive\n\n",
        "data: {\"id\":\"c1\",\"created\":1,\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    )
    .as_bytes();

    let out = transcode_whole(body);
    let text = std::str::from_utf8(&out).expect("UTF-8");
    assert!(text.contains(": keep-alive\n"));
    assert_eq!(text.matches("event: ").count(), 9);
    assert_eq!(text.matches("event: response.completed\n").count(), 1);
}

#[test]
fn test_writer_wraps_fragmented_proxy_writes() {
    let body = upstream_chat_body();
    let reference = transcode_whole(&body);

    let mut writer = TranscodingWriter::new(Vec::new(), true);
    for chunk in body.chunks(13) {
        writer.write_all(chunk).expect("write");
    }
    writer.finish().expect("finish");
    assert_eq!(writer.into_inner(), reference);
}

#[test]
fn test_writer_leaves_non_sse_replies_alone() {
    let error_body = br#"{"error":{"message":"model not found","code":404}}"#;
    let mut writer = TranscodingWriter::new(Vec::new(), false);
    writer.write_all(error_body).expect("write");
    writer.finish().expect("finish");
    assert_eq!(writer.into_inner(), error_body);
}

#[test]
fn test_truncated_stream_never_reports_completion() {
    // Upstream dies mid-response: no finish_reason, no [DONE], and the last
    // record never sees its terminating newline.
    let body = concat!(
        "data: {\"id\":\"c1\",\"created\":1,\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n\n",
        "data: {\"id\":\"c1\",\"created\":1,\"choices\":[{\"delta\":{\"content\":\"tial",
    )
    .as_bytes();

    let mut scanner = SseLineScanner::new();
    let mut session = TranscodeSession::new();
    let mut out = Vec::new();
    scanner.feed(body, |line| session.process_line(line, &mut out));
    // Abort path: the carry is dropped with the scanner, not flushed.

    let frames = parse_event_frames(&out);
    let types: Vec<&str> = frames.iter().map(|(t, _)| t.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "response.created",
            "response.in_progress",
            "response.output_item.added",
            "response.content_part.added",
            "response.output_text.delta",
        ]
    );
    assert!(!types.contains(&"response.completed"));
}
