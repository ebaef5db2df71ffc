//! Content-based mime detection for uploads that arrive without a type.

/// Bytes of leading content examined.
pub const SNIFF_LEN: usize = 512;

const OCTET_STREAM: &str = "application/octet-stream";
const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Mime type from magic numbers; printable UTF-8 counts as plain text and
/// anything else unrecognized is an octet stream.
pub fn sniff_mime_type(head: &[u8]) -> String {
    let head = &head[..head.len().min(SNIFF_LEN)];
    if let Some(kind) = infer::get(head) {
        return kind.mime_type().to_string();
    }
    if !head.is_empty() && looks_like_text(head) {
        return TEXT_PLAIN.to_string();
    }
    OCTET_STREAM.to_string()
}

fn looks_like_text(head: &[u8]) -> bool {
    // a multi-byte character may be cut at the end of the window
    let text = match std::str::from_utf8(head) {
        Ok(text) => text,
        Err(err) if err.error_len().is_none() => {
            match std::str::from_utf8(&head[..err.valid_up_to()]) {
                Ok(text) => text,
                Err(_) => return false,
            }
        }
        Err(_) => return false,
    };
    !text
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t' | '\x0c'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_magic_numbers() {
        let png = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 0x0d];
        assert_eq!(sniff_mime_type(&png), "image/png");
        assert_eq!(sniff_mime_type(b"%PDF-1.7\n"), "application/pdf");
    }

    #[test]
    fn falls_back_to_text_or_octet_stream() {
        assert_eq!(sniff_mime_type(b"hello, world\n"), TEXT_PLAIN);
        assert_eq!(sniff_mime_type("caf\u{e9}".as_bytes()), TEXT_PLAIN);
        assert_eq!(sniff_mime_type(&[0u8, 1, 2, 3]), OCTET_STREAM);
        assert_eq!(sniff_mime_type(&[]), OCTET_STREAM);
    }
}
