const HEX: &[u8; 16] = b"0123456789abcdef";

/// Appends `value` as a JSON string literal, quotes included.
///
/// Clean runs are copied in bulk; only bytes that need escaping interrupt
/// the copy, which the overwhelming majority of streamed model output never
/// does.
#[inline]
pub(crate) fn push_json_string_escaped(out: &mut String, value: &str) {
    out.push('"');
    let bytes = value.as_bytes();
    let mut flushed = 0;
    for (idx, &byte) in bytes.iter().enumerate() {
        let replacement: Option<&str> = match byte {
            b'"' => Some("\\\""),
            b'\\' => Some("\\\\"),
            b'\n' => Some("\\n"),
            b'\r' => Some("\\r"),
            b'\t' => Some("\\t"),
            0x08 => Some("\\b"),
            0x0c => Some("\\f"),
            0x00..=0x1f => None,
            _ => continue,
        };
        // Escape triggers are all ASCII, so idx sits on a char boundary.
        out.push_str(&value[flushed..idx]);
        match replacement {
            Some(text) => out.push_str(text),
            None => {
                out.push_str("\\u00");
                out.push(char::from(HEX[(byte >> 4) as usize]));
                out.push(char::from(HEX[(byte & 0x0f) as usize]));
            }
        }
        flushed = idx + 1;
    }
    out.push_str(&value[flushed..]);
    out.push('"');
}

#[inline]
pub(crate) fn push_u64_decimal(out: &mut String, value: u64) {
    let mut buf = [0u8; 20];
    let mut pos = buf.len();
    let mut remaining = value;
    loop {
        pos -= 1;
        buf[pos] = b'0' + (remaining % 10) as u8;
        remaining /= 10;
        if remaining == 0 {
            break;
        }
    }
    if let Ok(digits) = std::str::from_utf8(&buf[pos..]) {
        out.push_str(digits);
    }
}
