pub(super) fn is_line_comment_start(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'-') && bytes.get(idx + 1) == Some(&b'-')
}

pub(super) fn is_block_comment_start(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'/') && bytes.get(idx + 1) == Some(&b'*')
}

pub(super) fn is_block_comment_end(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'*') && bytes.get(idx + 1) == Some(&b'/')
}

pub(super) fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b >= 0x80
}

pub(super) fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

/// End index (exclusive) of the run of ASCII digits starting at `start`.
pub(super) fn scan_digits(bytes: &[u8], start: usize) -> usize {
    let mut idx = start;
    while idx < bytes.len() && bytes[idx].is_ascii_digit() {
        idx += 1;
    }
    idx
}

/// End index (exclusive) of an identifier-like run starting at `start`.
pub(super) fn scan_ident(bytes: &[u8], start: usize) -> usize {
    let mut idx = start;
    while idx < bytes.len() && is_ident_continue(bytes[idx]) {
        idx += 1;
    }
    idx
}

/// Scan a quoted run opened at `start` and closed by `close`, where a doubled closing
/// byte is an escape. Returns the unescaped body and the index just past the closer.
/// An unterminated run swallows the rest of the input.
pub(super) fn scan_quoted(sql: &str, start: usize, close: u8, doubled_escape: bool) -> (String, usize) {
    let bytes = sql.as_bytes();
    let mut body = String::new();
    let mut run_start = start + 1;
    let mut idx = start + 1;
    while idx < bytes.len() {
        if bytes[idx] == close {
            if doubled_escape && bytes.get(idx + 1) == Some(&close) {
                body.push_str(&sql[run_start..=idx]);
                idx += 2;
                run_start = idx;
                continue;
            }
            body.push_str(&sql[run_start..idx]);
            return (body, idx + 1);
        }
        idx += 1;
    }
    body.push_str(&sql[run_start..]);
    (body, bytes.len())
}
