use super::parsers::{
    is_block_comment_end, is_block_comment_start, is_ident_continue, is_ident_start,
    is_line_comment_start, scan_digits, scan_ident, scan_quoted,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    /// Unquoted identifier or keyword.
    Word,
    /// `"ident"`, `` `ident` `` or `[ident]`; `text` holds the unquoted spelling.
    Quoted,
    /// `?`, `?NNN`, `:name`, `@name`, `$name`.
    Placeholder,
    /// String, blob or numeric literal.
    Literal,
    /// Any other single byte: `(`, `)`, `,`, `;`, `.`, operators.
    Punct(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    pub(crate) kind: TokenKind,
    pub(crate) text: String,
    pub(crate) start: usize,
    pub(crate) end: usize,
}

impl Token {
    pub(crate) fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }

    pub(crate) fn is_punct(&self, b: u8) -> bool {
        self.kind == TokenKind::Punct(b)
    }

    pub(crate) fn is_name(&self) -> bool {
        matches!(self.kind, TokenKind::Word | TokenKind::Quoted)
    }

    /// Anonymous `?` or ordinal `?NNN` placeholder; `None` for named placeholders.
    pub(crate) fn ordinal(&self) -> Option<Option<usize>> {
        if self.kind != TokenKind::Placeholder || !self.text.starts_with('?') {
            return None;
        }
        let digits = &self.text[1..];
        if digits.is_empty() {
            Some(None)
        } else {
            digits.parse().ok().map(Some)
        }
    }
}

#[derive(Clone, Copy)]
enum State {
    Normal,
    LineComment,
    BlockComment(u32),
}

/// Split SQL text into tokens, skipping whitespace and comments.
///
/// String literals and quoted identifiers are recognised so that keywords or
/// placeholders inside them are never reported.
pub(crate) fn tokenize(sql: &str) -> Vec<Token> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut state = State::Normal;
    let mut idx = 0;

    while idx < bytes.len() {
        let b = bytes[idx];
        match state {
            State::LineComment => {
                if b == b'\n' {
                    state = State::Normal;
                }
                idx += 1;
            }
            State::BlockComment(depth) => {
                if is_block_comment_start(bytes, idx) {
                    state = State::BlockComment(depth + 1);
                    idx += 2;
                } else if is_block_comment_end(bytes, idx) {
                    state = if depth == 1 {
                        State::Normal
                    } else {
                        State::BlockComment(depth - 1)
                    };
                    idx += 2;
                } else {
                    idx += 1;
                }
            }
            State::Normal => {
                if b.is_ascii_whitespace() {
                    idx += 1;
                    continue;
                }
                if is_line_comment_start(bytes, idx) {
                    state = State::LineComment;
                    idx += 2;
                    continue;
                }
                if is_block_comment_start(bytes, idx) {
                    state = State::BlockComment(1);
                    idx += 2;
                    continue;
                }

                let start = idx;
                let (kind, text, end) = match b {
                    b'\'' => {
                        let (body, end) = scan_quoted(sql, start, b'\'', true);
                        (TokenKind::Literal, body, end)
                    }
                    b'"' => {
                        let (body, end) = scan_quoted(sql, start, b'"', true);
                        (TokenKind::Quoted, body, end)
                    }
                    b'`' => {
                        let (body, end) = scan_quoted(sql, start, b'`', true);
                        (TokenKind::Quoted, body, end)
                    }
                    b'[' => {
                        let (body, end) = scan_quoted(sql, start, b']', false);
                        (TokenKind::Quoted, body, end)
                    }
                    b'?' => {
                        let end = scan_digits(bytes, start + 1);
                        (TokenKind::Placeholder, sql[start..end].to_string(), end)
                    }
                    b':' | b'@' | b'$'
                        if bytes.get(start + 1).is_some_and(|next| is_ident_continue(*next)) =>
                    {
                        let end = scan_ident(bytes, start + 1);
                        (TokenKind::Placeholder, sql[start..end].to_string(), end)
                    }
                    _ if b.is_ascii_digit() => {
                        let end = scan_ident(bytes, start);
                        let end = if bytes.get(end) == Some(&b'.') {
                            scan_ident(bytes, end + 1)
                        } else {
                            end
                        };
                        (TokenKind::Literal, sql[start..end].to_string(), end)
                    }
                    _ if (b == b'x' || b == b'X') && bytes.get(start + 1) == Some(&b'\'') => {
                        let (body, end) = scan_quoted(sql, start + 1, b'\'', false);
                        (TokenKind::Literal, body, end)
                    }
                    _ if is_ident_start(b) => {
                        let end = scan_ident(bytes, start);
                        (TokenKind::Word, sql[start..end].to_string(), end)
                    }
                    _ => (TokenKind::Punct(b), (b as char).to_string(), start + 1),
                };
                tokens.push(Token {
                    kind,
                    text,
                    start,
                    end,
                });
                idx = end;
            }
        }
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<(TokenKind, String)> {
        tokenize(sql)
            .into_iter()
            .map(|t| (t.kind, t.text))
            .collect()
    }

    #[test]
    fn skips_literals_and_comments() {
        let tokens = kinds("select '?1' -- from x\n/* from y */ from t where a = ?2");
        assert_eq!(
            tokens,
            vec![
                (TokenKind::Word, "select".into()),
                (TokenKind::Literal, "?1".into()),
                (TokenKind::Word, "from".into()),
                (TokenKind::Word, "t".into()),
                (TokenKind::Word, "where".into()),
                (TokenKind::Word, "a".into()),
                (TokenKind::Punct(b'='), "=".into()),
                (TokenKind::Placeholder, "?2".into()),
            ]
        );
    }

    #[test]
    fn unquotes_identifiers() {
        let tokens = kinds(r#"select "My ""Table""", `b`, [c d] from x"#);
        assert_eq!(tokens[1], (TokenKind::Quoted, r#"My "Table""#.into()));
        assert_eq!(tokens[3], (TokenKind::Quoted, "b".into()));
        assert_eq!(tokens[5], (TokenKind::Quoted, "c d".into()));
    }

    #[test]
    fn recognises_placeholder_styles() {
        let tokens = tokenize("values (?, ?3, :name, @n, $v, $1, 1.5)");
        let placeholders: Vec<&str> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Placeholder)
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(placeholders, vec!["?", "?3", ":name", "@n", "$v", "$1"]);
        assert_eq!(tokens[2].ordinal(), Some(None));
        assert_eq!(tokens[4].ordinal(), Some(Some(3)));
        assert_eq!(tokens[6].ordinal(), None);
    }
}
