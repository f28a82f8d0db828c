//! Infers which tables a statement reads and writes from its compiled text.
//!
//! The analysis is syntactic. It walks the token stream produced by the placeholder
//! scanner, so string literals, comments and quoted identifiers never produce false
//! table names. When a table cannot be known statically (a placeholder in table
//! position, or a table-valued function fed by parameters) the result is widened to
//! [`TableRef::Unknown`].

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::sql::SqlFragment;
use crate::sql::scanner::{Token, TokenKind, tokenize};

/// A table name as written, compared case-insensitively.
#[derive(Debug, Clone)]
pub struct TableName {
    spelling: String,
    key: String,
}

impl TableName {
    pub fn new(spelling: impl Into<String>) -> Self {
        let spelling = spelling.into();
        let key = spelling.to_lowercase();
        Self { spelling, key }
    }

    /// The name exactly as it appeared, quotes stripped.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.spelling
    }
}

impl PartialEq for TableName {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for TableName {}

impl PartialOrd for TableName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TableName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl Hash for TableName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.spelling)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableRef {
    Named(TableName),
    /// Could be any table.
    Unknown,
}

impl TableRef {
    pub fn named(name: &str) -> Self {
        TableRef::Named(TableName::new(name))
    }

    /// Whether a write to `self` may affect a reader of `other`.
    #[must_use]
    pub fn overlaps(&self, other: &TableRef) -> bool {
        match (self, other) {
            (TableRef::Unknown, _) | (_, TableRef::Unknown) => true,
            (TableRef::Named(a), TableRef::Named(b)) => a == b,
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableRef::Named(name) => name.fmt(f),
            TableRef::Unknown => f.write_str("<unknown>"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
}

/// One table mutated by a successful statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WriteEvent {
    pub table: TableRef,
    pub kind: WriteKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependencies {
    pub reads: BTreeSet<TableRef>,
    pub writes: BTreeSet<TableRef>,
    /// Writes in statement order.
    pub events: Vec<WriteEvent>,
}

impl Dependencies {
    /// Every table the statement touches.
    #[must_use]
    pub fn tables(&self) -> BTreeSet<TableRef> {
        self.reads.union(&self.writes).cloned().collect()
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        !self.events.is_empty()
    }
}

/// Any overlap between the tables a query depends on and a set of written tables.
#[must_use]
pub fn affected_by<'a>(
    tables: &BTreeSet<TableRef>,
    written: impl IntoIterator<Item = &'a TableRef>,
) -> bool {
    written
        .into_iter()
        .any(|w| tables.iter().any(|t| w.overlaps(t)))
}

#[must_use]
pub fn analyze(fragment: &SqlFragment) -> Dependencies {
    analyze_sql(&fragment.text())
}

#[must_use]
pub fn analyze_sql(sql: &str) -> Dependencies {
    let tokens = tokenize(sql);
    let ctes = cte_names(&tokens);
    let mut deps = Dependencies::default();

    for (idx, token) in tokens.iter().enumerate() {
        if token.kind != TokenKind::Word {
            continue;
        }
        let prev = idx.checked_sub(1).map(|p| &tokens[p]);
        let after_on_or_do = prev.is_some_and(|p| p.is_keyword("ON") || p.is_keyword("DO"));

        if token.is_keyword("FROM") {
            if prev.is_some_and(|p| p.is_keyword("DELETE")) {
                if let Some((table, _)) = table_at(&tokens, idx + 1, &ctes) {
                    record_write(&mut deps, table, WriteKind::Delete);
                }
            } else {
                deps.reads.extend(from_list(&tokens, idx + 1, &ctes));
            }
        } else if token.is_keyword("JOIN") {
            if let Some((table, _)) = table_at(&tokens, idx + 1, &ctes) {
                deps.reads.insert(table);
            }
        } else if token.is_keyword("INTO") {
            if let Some((table, _)) = table_at(&tokens, idx + 1, &ctes) {
                record_write(&mut deps, table, WriteKind::Insert);
            }
        } else if token.is_keyword("UPDATE") && !after_on_or_do {
            let mut at = idx + 1;
            if tokens.get(at).is_some_and(|t| t.is_keyword("OR")) {
                at += 2;
            }
            let clause_keyword = tokens
                .get(at)
                .is_some_and(|t| t.is_keyword("SET") || t.is_keyword("OF") || t.is_keyword("ON"));
            if clause_keyword {
                continue;
            }
            if let Some((table, _)) = table_at(&tokens, at, &ctes) {
                record_write(&mut deps, table, WriteKind::Update);
            }
        }
    }

    deps
}

fn record_write(deps: &mut Dependencies, table: TableRef, kind: WriteKind) {
    deps.writes.insert(table.clone());
    deps.events.push(WriteEvent { table, kind });
}

/// Names introduced by every `WITH [RECURSIVE] name [(cols)] AS [NOT] [MATERIALIZED] (…)`.
fn cte_names(tokens: &[Token]) -> BTreeSet<TableName> {
    let mut names = BTreeSet::new();
    for (idx, token) in tokens.iter().enumerate() {
        if !token.is_keyword("WITH") {
            continue;
        }
        let mut at = idx + 1;
        if tokens.get(at).is_some_and(|t| t.is_keyword("RECURSIVE")) {
            at += 1;
        }
        while let Some(name) = tokens.get(at).filter(|t| t.is_name()) {
            names.insert(TableName::new(name.text.as_str()));
            at += 1;
            if tokens.get(at).is_some_and(|t| t.is_punct(b'(')) {
                at = skip_parens(tokens, at);
            }
            if !tokens.get(at).is_some_and(|t| t.is_keyword("AS")) {
                break;
            }
            at += 1;
            while tokens
                .get(at)
                .is_some_and(|t| t.is_keyword("NOT") || t.is_keyword("MATERIALIZED"))
            {
                at += 1;
            }
            if tokens.get(at).is_some_and(|t| t.is_punct(b'(')) {
                at = skip_parens(tokens, at);
            }
            if tokens.get(at).is_some_and(|t| t.is_punct(b',')) {
                at += 1;
            } else {
                break;
            }
        }
    }
    names
}

/// Index just past the `)` matching the `(` at `open`.
fn skip_parens(tokens: &[Token], open: usize) -> usize {
    let mut depth = 0usize;
    for (idx, token) in tokens.iter().enumerate().skip(open) {
        if token.is_punct(b'(') {
            depth += 1;
        } else if token.is_punct(b')') {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return idx + 1;
            }
        }
    }
    tokens.len()
}

const NOT_AN_ALIAS: &[&str] = &[
    "WHERE", "JOIN", "LEFT", "RIGHT", "FULL", "INNER", "OUTER", "CROSS", "NATURAL", "ON",
    "USING", "GROUP", "ORDER", "LIMIT", "OFFSET", "UNION", "EXCEPT", "INTERSECT", "WINDOW",
    "HAVING", "SET", "VALUES", "DEFAULT", "SELECT", "RETURNING", "INDEXED", "NOT", "AS",
    "FROM", "DO", "WITH",
];

/// Tables of a comma-separated FROM list starting at `start`.
fn from_list(tokens: &[Token], start: usize, ctes: &BTreeSet<TableName>) -> Vec<TableRef> {
    let mut tables = Vec::new();
    let mut at = start;
    loop {
        let next = if tokens.get(at).is_some_and(|t| t.is_punct(b'(')) {
            // Sub-select or parenthesized join; its own FROM/JOIN keywords are
            // picked up by the main scan.
            skip_parens(tokens, at)
        } else {
            match table_at(tokens, at, ctes) {
                Some((table, end)) => {
                    tables.push(table);
                    end
                }
                None => match tokens.get(at) {
                    Some(t) if t.is_name() => skip_name(tokens, at),
                    _ => break,
                },
            }
        };
        at = skip_alias(tokens, next);
        if tokens.get(at).is_some_and(|t| t.is_punct(b',')) {
            at += 1;
        } else {
            break;
        }
    }
    tables
}

fn skip_alias(tokens: &[Token], at: usize) -> usize {
    match tokens.get(at) {
        Some(t) if t.is_keyword("AS") => at + 2,
        Some(t) if t.kind == TokenKind::Quoted => at + 1,
        Some(t)
            if t.kind == TokenKind::Word
                && !NOT_AN_ALIAS.iter().any(|k| t.text.eq_ignore_ascii_case(k)) =>
        {
            at + 1
        }
        _ => at,
    }
}

/// Index past a possibly dotted name and an optional argument list.
fn skip_name(tokens: &[Token], at: usize) -> usize {
    let mut end = at + 1;
    while tokens.get(end).is_some_and(|t| t.is_punct(b'.'))
        && tokens.get(end + 1).is_some_and(Token::is_name)
    {
        end += 2;
    }
    if tokens.get(end).is_some_and(|t| t.is_punct(b'(')) {
        end = skip_parens(tokens, end);
    }
    end
}

/// The table referenced at `at`, plus the index just past it. `None` for CTE names,
/// sub-selects and anything that is not a table reference.
fn table_at(tokens: &[Token], at: usize, ctes: &BTreeSet<TableName>) -> Option<(TableRef, usize)> {
    let token = tokens.get(at)?;
    if token.kind == TokenKind::Placeholder {
        return Some((TableRef::Unknown, at + 1));
    }
    if !token.is_name() {
        return None;
    }
    if token.kind == TokenKind::Word
        && (token.is_keyword("SELECT") || token.is_keyword("VALUES") || token.is_keyword("WITH"))
    {
        return None;
    }

    // Schema-qualified names key on their last segment.
    let mut last = token;
    let mut end = at + 1;
    while tokens.get(end).is_some_and(|t| t.is_punct(b'.')) {
        match tokens.get(end + 1) {
            Some(next) if next.is_name() => {
                last = next;
                end += 2;
            }
            Some(next) if next.kind == TokenKind::Placeholder => {
                return Some((TableRef::Unknown, end + 2));
            }
            _ => break,
        }
    }

    if tokens.get(end).is_some_and(|t| t.is_punct(b'(')) {
        let close = skip_parens(tokens, end);
        let parameterized = tokens[end..close]
            .iter()
            .any(|t| t.kind == TokenKind::Placeholder);
        let table = if parameterized {
            TableRef::Unknown
        } else {
            TableRef::Named(TableName::new(last.text.as_str()))
        };
        return Some((table, close));
    }

    let name = TableName::new(last.text.as_str());
    if ctes.contains(&name) {
        return None;
    }
    Some((TableRef::Named(name), end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(set: &BTreeSet<TableRef>) -> Vec<String> {
        set.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn select_with_joins_aliases_and_comma_list() {
        let deps = analyze_sql(
            "SELECT * FROM notes n, tags AS t LEFT JOIN authors a ON a.id = n.author_id \
             INNER JOIN \"Main\".\"Likes\" ON 1 WHERE n.id = t.note_id",
        );
        assert_eq!(names(&deps.reads), vec!["authors", "Likes", "notes", "tags"]);
        assert!(deps.writes.is_empty());
    }

    #[test]
    fn ctes_and_subselects() {
        let deps = analyze_sql(
            "WITH recent(id) AS (SELECT id FROM notes WHERE x > ?1), other AS MATERIALIZED (SELECT 1) \
             SELECT * FROM recent JOIN other ON 1 WHERE id IN (SELECT note_id FROM tags)",
        );
        assert_eq!(names(&deps.reads), vec!["notes", "tags"]);
    }

    #[test]
    fn subquery_in_from_list_keeps_following_tables() {
        let deps = analyze_sql("SELECT * FROM (SELECT * FROM a) AS s, b");
        assert_eq!(names(&deps.reads), vec!["a", "b"]);
    }

    #[test]
    fn writes_produce_events_in_order() {
        let deps = analyze_sql(
            "INSERT OR REPLACE INTO kv (key) VALUES (?1) ON CONFLICT(key) DO UPDATE SET v = 1; \
             UPDATE OR IGNORE \"Notes\" SET title = ?2; DELETE FROM main.tags WHERE id = ?3",
        );
        assert_eq!(
            deps.events,
            vec![
                WriteEvent { table: TableRef::named("kv"), kind: WriteKind::Insert },
                WriteEvent { table: TableRef::named("notes"), kind: WriteKind::Update },
                WriteEvent { table: TableRef::named("tags"), kind: WriteKind::Delete },
            ]
        );
        assert!(deps.reads.is_empty());
    }

    #[test]
    fn insert_select_reads_source() {
        let deps = analyze_sql("INSERT INTO archive SELECT * FROM notes WHERE done = 1");
        assert_eq!(names(&deps.writes), vec!["archive"]);
        assert_eq!(names(&deps.reads), vec!["notes"]);
    }

    #[test]
    fn literals_comments_and_ddl_clauses_are_ignored() {
        let deps = analyze_sql(
            "SELECT 'from fake' AS s -- FROM commented\n FROM real_table /* JOIN nope */",
        );
        assert_eq!(names(&deps.reads), vec!["real_table"]);

        let ddl = analyze_sql(
            "CREATE TABLE c (p INTEGER REFERENCES p(id) ON DELETE CASCADE ON UPDATE CASCADE)",
        );
        assert!(ddl.events.is_empty());
    }

    #[test]
    fn parameterized_tables_are_unknown() {
        let deps = analyze_sql("SELECT name FROM pragma_table_info(?1)");
        assert_eq!(deps.reads, BTreeSet::from([TableRef::Unknown]));

        let fixed = analyze_sql("SELECT value FROM json_each('[1,2]')");
        assert_eq!(names(&fixed.reads), vec!["json_each"]);
    }

    #[test]
    fn names_compare_case_insensitively_but_keep_spelling() {
        let a = TableName::new("Notes");
        assert_eq!(a, TableName::new("NOTES"));
        assert_eq!(a.as_str(), "Notes");
        assert!(affected_by(
            &BTreeSet::from([TableRef::named("notes")]),
            [&TableRef::named("NoTeS")]
        ));
        assert!(affected_by(
            &BTreeSet::from([TableRef::named("notes")]),
            [&TableRef::Unknown]
        ));
        assert!(!affected_by(
            &BTreeSet::from([TableRef::named("notes")]),
            [&TableRef::named("tags")]
        ));
    }
}
