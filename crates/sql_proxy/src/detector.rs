//! Statement classification for the SQL passthrough.
//!
//! A token-level scanner, not a SQL parser: it needs just enough structure
//! to skip leading comments and one CTE block, name the outer statement, and
//! pull out the target table with quoting and schema prefixes intact.

use errors::ErrorMetadata;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatementKind {
    Insert,
    Update,
    Delete,
    Select,
}

impl StatementKind {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, StatementKind::Select)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetectedStatement {
    pub kind: StatementKind,
    /// Unquoted target table, schema prefix stripped. `None` for SELECT.
    pub table: Option<String>,
}

struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(sql: &'a str) -> Self {
        Self {
            bytes: sql.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_ascii_whitespace() => self.pos += 1,
                Some(b'-') if self.peek_at(1) == Some(b'-') => self.skip_line_comment(),
                Some(b'/') if self.peek_at(1) == Some(b'/') => self.skip_line_comment(),
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    self.pos += 2;
                    while self.pos < self.bytes.len() {
                        if self.peek() == Some(b'*') && self.peek_at(1) == Some(b'/') {
                            self.pos += 2;
                            break;
                        }
                        self.pos += 1;
                    }
                },
                _ => break,
            }
        }
    }

    fn skip_line_comment(&mut self) {
        while let Some(c) = self.peek() {
            self.pos += 1;
            if c == b'\n' {
                break;
            }
        }
    }

    /// Read a bare keyword (letters and underscores), uppercased.
    fn keyword(&mut self) -> Option<String> {
        self.skip_trivia();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return None;
        }
        Some(
            std::str::from_utf8(&self.bytes[start..self.pos])
                .ok()?
                .to_ascii_uppercase(),
        )
    }

    /// Read one identifier segment: quoted (`"…"`, `` `…` ``, `[…]`) or bare.
    fn identifier_segment(&mut self) -> Option<String> {
        self.skip_trivia();
        match self.peek()? {
            quote @ (b'"' | b'`') => {
                self.pos += 1;
                let mut out = String::new();
                while let Some(c) = self.peek() {
                    self.pos += 1;
                    if c == quote {
                        // Doubled quote is an escaped quote inside the name.
                        if self.peek() == Some(quote) {
                            self.pos += 1;
                            out.push(quote as char);
                            continue;
                        }
                        return Some(out);
                    }
                    out.push(c as char);
                }
                Some(out)
            },
            b'[' => {
                self.pos += 1;
                let mut out = String::new();
                while let Some(c) = self.peek() {
                    self.pos += 1;
                    if c == b']' {
                        return Some(out);
                    }
                    out.push(c as char);
                }
                Some(out)
            },
            _ => {
                let start = self.pos;
                while let Some(c) = self.peek() {
                    if c.is_ascii_alphanumeric() || c == b'_' {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                if self.pos == start {
                    None
                } else {
                    Some(std::str::from_utf8(&self.bytes[start..self.pos]).ok()?.to_owned())
                }
            },
        }
    }

    /// Read a possibly schema-qualified name, returning the final segment.
    fn table_name(&mut self) -> Option<String> {
        let mut name = self.identifier_segment()?;
        loop {
            self.skip_trivia();
            if self.peek() == Some(b'.') {
                self.pos += 1;
                name = self.identifier_segment()?;
            } else {
                return Some(name);
            }
        }
    }

    /// Skip a balanced parenthesized group, honoring strings and comments.
    fn skip_parens(&mut self) {
        debug_assert_eq!(self.peek(), Some(b'('));
        let mut depth = 0usize;
        while let Some(c) = self.peek() {
            match c {
                b'(' => {
                    depth += 1;
                    self.pos += 1;
                },
                b')' => {
                    self.pos += 1;
                    depth -= 1;
                    if depth == 0 {
                        return;
                    }
                },
                b'\'' | b'"' | b'`' => self.skip_string(c),
                b'-' if self.peek_at(1) == Some(b'-') => self.skip_line_comment(),
                b'/' if self.peek_at(1) == Some(b'*') => self.skip_trivia(),
                _ => self.pos += 1,
            }
        }
    }

    fn skip_string(&mut self, quote: u8) {
        self.pos += 1;
        while let Some(c) = self.peek() {
            self.pos += 1;
            if c == quote {
                if self.peek() == Some(quote) {
                    self.pos += 1;
                    continue;
                }
                return;
            }
        }
    }

    /// Skip `WITH [RECURSIVE] name [(cols)] AS (…) [, name AS (…)]*`.
    fn skip_cte_block(&mut self) -> anyhow::Result<()> {
        if self.keyword().as_deref() != Some("WITH") {
            anyhow::bail!("not a CTE block");
        }
        let checkpoint = self.pos;
        if self.keyword().as_deref() != Some("RECURSIVE") {
            self.pos = checkpoint;
        }
        loop {
            self.identifier_segment()
                .ok_or_else(|| anyhow::anyhow!("CTE missing name"))?;
            self.skip_trivia();
            if self.peek() == Some(b'(') {
                self.skip_parens();
            }
            let as_kw = self.keyword();
            anyhow::ensure!(as_kw.as_deref() == Some("AS"), "CTE missing AS");
            self.skip_trivia();
            anyhow::ensure!(self.peek() == Some(b'('), "CTE body must be parenthesized");
            self.skip_parens();
            self.skip_trivia();
            if self.peek() == Some(b',') {
                self.pos += 1;
                continue;
            }
            return Ok(());
        }
    }
}

pub fn detect_statement(sql: &str) -> anyhow::Result<DetectedStatement> {
    let mut scanner = Scanner::new(sql);
    scanner.skip_trivia();

    // A leading CTE block belongs to the outer statement that follows it.
    let checkpoint = scanner.pos;
    if scanner.keyword().as_deref() == Some("WITH") {
        scanner.pos = checkpoint;
        scanner.skip_cte_block()?;
    } else {
        scanner.pos = checkpoint;
    }

    let keyword = scanner
        .keyword()
        .ok_or_else(|| anyhow::anyhow!(ErrorMetadata::invalid_request("empty SQL statement")))?;
    let detected = match keyword.as_str() {
        "SELECT" => DetectedStatement {
            kind: StatementKind::Select,
            table: None,
        },
        "INSERT" | "REPLACE" => {
            // INSERT [OR …] INTO <table>
            let mut next = scanner.keyword();
            if next.as_deref() == Some("OR") {
                scanner.keyword();
                next = scanner.keyword();
            }
            anyhow::ensure!(
                next.as_deref() == Some("INTO") || keyword == "REPLACE",
                "INSERT without INTO"
            );
            if keyword == "REPLACE" && next.as_deref() != Some("INTO") {
                anyhow::bail!("REPLACE without INTO");
            }
            DetectedStatement {
                kind: StatementKind::Insert,
                table: scanner.table_name(),
            }
        },
        "UPDATE" => {
            // UPDATE [OR …] <table>
            let checkpoint = scanner.pos;
            let maybe_or = scanner.keyword();
            if maybe_or.as_deref() == Some("OR") {
                scanner.keyword();
            } else {
                scanner.pos = checkpoint;
            }
            DetectedStatement {
                kind: StatementKind::Update,
                table: scanner.table_name(),
            }
        },
        "DELETE" => {
            anyhow::ensure!(
                scanner.keyword().as_deref() == Some("FROM"),
                "DELETE without FROM"
            );
            DetectedStatement {
                kind: StatementKind::Delete,
                table: scanner.table_name(),
            }
        },
        other => anyhow::bail!(ErrorMetadata::invalid_request(format!(
            "unsupported statement {other}"
        ))),
    };
    if detected.kind.is_mutation() {
        anyhow::ensure!(
            detected.table.is_some(),
            ErrorMetadata::invalid_request("mutation without a target table")
        );
    }
    Ok(detected)
}

/// Ensure a mutation against a synced table yields every affected row.
/// Appends `RETURNING *` when absent; rejects a `RETURNING` clause that is
/// not the wildcard, since a partial row cannot synthesize an oplog entry.
pub fn ensure_returning_star(sql: &str) -> anyhow::Result<String> {
    if let Some(offset) = find_returning(sql) {
        let after = &sql[offset + "RETURNING".len()..];
        let mut scanner = Scanner::new(after);
        scanner.skip_trivia();
        if scanner.peek() == Some(b'*') {
            return Ok(sql.to_owned());
        }
        anyhow::bail!(ErrorMetadata::invalid_request(
            "synced-table mutations must use RETURNING * so the oplog sees whole rows",
        ));
    }
    let trimmed = sql.trim_end().trim_end_matches(';');
    Ok(format!("{trimmed} RETURNING *"))
}

/// Byte offset of a top-level RETURNING keyword, ignoring strings, comments,
/// and parenthesized subexpressions.
fn find_returning(sql: &str) -> Option<usize> {
    let mut scanner = Scanner::new(sql);
    loop {
        scanner.skip_trivia();
        let c = scanner.peek()?;
        match c {
            b'\'' | b'"' | b'`' => scanner.skip_string(c),
            b'(' => scanner.skip_parens(),
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let at = scanner.pos;
                let keyword = scanner.keyword()?;
                if keyword == "RETURNING" {
                    return Some(at);
                }
            },
            _ => scanner.pos += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn table_of(sql: &str) -> Option<String> {
        detect_statement(sql).unwrap().table
    }

    #[test]
    fn test_basic_classification() {
        assert_eq!(
            detect_statement("INSERT INTO tasks (id) VALUES ('t1')").unwrap(),
            DetectedStatement {
                kind: StatementKind::Insert,
                table: Some("tasks".to_owned()),
            }
        );
        assert_eq!(
            detect_statement("UPDATE tasks SET title = 'x'").unwrap().kind,
            StatementKind::Update
        );
        assert_eq!(
            detect_statement("DELETE FROM tasks WHERE id = 't1'")
                .unwrap()
                .kind,
            StatementKind::Delete
        );
        assert_eq!(
            detect_statement("SELECT * FROM tasks").unwrap(),
            DetectedStatement {
                kind: StatementKind::Select,
                table: None,
            }
        );
    }

    #[test]
    fn test_leading_comments_are_skipped() {
        let sql = "-- admin backfill\n/* touches tasks */\n  // note\nUPDATE tasks SET done = 1";
        assert_eq!(table_of(sql), Some("tasks".to_owned()));
    }

    #[test]
    fn test_leading_cte_block_is_skipped() {
        let sql = "WITH stale AS (SELECT id FROM tasks WHERE updated_at < 5),
                        doomed (id) AS (SELECT id FROM stale)
                   DELETE FROM tasks WHERE id IN (SELECT id FROM doomed)";
        let detected = detect_statement(sql).unwrap();
        assert_eq!(detected.kind, StatementKind::Delete);
        assert_eq!(detected.table, Some("tasks".to_owned()));

        let recursive = "WITH RECURSIVE tree AS (SELECT 1) UPDATE tasks SET depth = 0";
        assert_eq!(table_of(recursive), Some("tasks".to_owned()));
    }

    #[test]
    fn test_quoted_and_schema_prefixed_identifiers() {
        assert_eq!(table_of(r#"UPDATE "task list" SET x = 1"#), Some("task list".to_owned()));
        assert_eq!(table_of("UPDATE `tasks` SET x = 1"), Some("tasks".to_owned()));
        assert_eq!(table_of("UPDATE [tasks] SET x = 1"), Some("tasks".to_owned()));
        assert_eq!(table_of("UPDATE main.tasks SET x = 1"), Some("tasks".to_owned()));
        assert_eq!(
            table_of(r#"DELETE FROM app."weird.name""#),
            Some("weird.name".to_owned())
        );
        assert_eq!(
            table_of(r#"UPDATE "quoted""name" SET x = 1"#),
            Some("quoted\"name".to_owned())
        );
    }

    #[test]
    fn test_returning_enforcement() {
        assert_eq!(
            ensure_returning_star("DELETE FROM tasks WHERE id = 't1';").unwrap(),
            "DELETE FROM tasks WHERE id = 't1' RETURNING *"
        );
        // Already wildcard: unchanged.
        let sql = "UPDATE tasks SET x = 1 RETURNING *";
        assert_eq!(ensure_returning_star(sql).unwrap(), sql);
        // Partial list: rejected.
        assert!(ensure_returning_star("UPDATE tasks SET x = 1 RETURNING id").is_err());
        // RETURNING inside a string literal is not a clause.
        let tricky = "UPDATE tasks SET note = 'use RETURNING id' WHERE id = 't1'";
        assert!(ensure_returning_star(tricky).unwrap().ends_with("RETURNING *"));
    }
}
