//! Reading schema metadata from DDL scripts.
//!
//! Understands `CREATE TABLE` (columns, inline and table-level keys, inline
//! `REFERENCES`), `ALTER TABLE ... ADD` constraints and `CREATE [UNIQUE] INDEX`.
//! Identifiers may be quoted MySQL, PostgreSQL or MSSQL style and qualified
//! with a schema; only the last segment is kept. Other statements are skipped.

use super::{Column, Reference, Relation, Schema};
use once_cell::sync::Lazy;
use regex::Regex;

static CREATE_TABLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)^CREATE\s+(?:(?:GLOBAL|LOCAL)\s+)?(?:TEMP(?:ORARY)?\s+)?(?:UNLOGGED\s+)?TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?(?P<name>[^\s(]+)\s*\(",
    )
    .unwrap()
});

static ALTER_TABLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^ALTER\s+TABLE\s+(?:ONLY\s+)?(?:IF\s+EXISTS\s+)?(?P<name>\S+)\s+(?P<actions>.+)$")
        .unwrap()
});

static CREATE_INDEX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)^CREATE\s+(?P<unique>UNIQUE\s+)?(?:(?:NON)?CLUSTERED\s+)?INDEX\s+(?:CONCURRENTLY\s+)?(?:IF\s+NOT\s+EXISTS\s+)?\S+\s+ON\s+(?:ONLY\s+)?(?P<table>[^\s(]+)\s*(?:USING\s+\w+\s*)?\((?P<columns>[^)]*)\)",
    )
    .unwrap()
});

static COLUMN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)^(?P<name>"[^"]+"|`[^`]+`|\[[^\]]+\]|\S+)\s+(?P<type>\w+(?:\s+(?:PRECISION|VARYING|UNSIGNED))*(?:\s*\([^)]*\))?)"#,
    )
    .unwrap()
});

static PRIMARY_KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)PRIMARY\s+KEY\s*(?:(?:NON)?CLUSTERED\s*)?\((?P<columns>[^)]*)\)").unwrap()
});

static FOREIGN_KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)(?:CONSTRAINT\s+(?P<constraint>\S+)\s+)?FOREIGN\s+KEY\s*\((?P<columns>[^)]*)\)\s*REFERENCES\s+(?P<target>[^\s(]+)\s*\((?P<target_columns>[^)]*)\)",
    )
    .unwrap()
});

static REFERENCES_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)(?:CONSTRAINT\s+(?P<constraint>\S+)\s+)?\bREFERENCES\s+(?P<target>[^\s(]+)\s*\((?P<target_columns>[^)]*)\)",
    )
    .unwrap()
});

static UNIQUE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^(?:CONSTRAINT\s+\S+\s+)?UNIQUE\s*(?:(?:KEY|INDEX)\s*(?:[^\s(]+\s*)?)?\((?P<columns>[^)]*)\)")
        .unwrap()
});

static NOT_NULL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bNOT\s+NULL\b").unwrap());
static INLINE_KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bPRIMARY\s+KEY\b").unwrap());
static INLINE_UNIQUE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bUNIQUE\b").unwrap());

/// Leading keywords of a table-level constraint inside `CREATE TABLE (...)`
const CONSTRAINT_KEYWORDS: &[&str] = &[
    "CONSTRAINT", "PRIMARY", "FOREIGN", "UNIQUE", "CHECK", "KEY", "INDEX", "EXCLUDE",
];

/// The statements the builder acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DdlKind {
    CreateTable,
    AlterTable,
    CreateIndex,
    Other,
}

fn classify(stmt: &str) -> DdlKind {
    if CREATE_INDEX_RE.is_match(stmt) {
        DdlKind::CreateIndex
    } else if CREATE_TABLE_RE.is_match(stmt) {
        DdlKind::CreateTable
    } else if ALTER_TABLE_RE.is_match(stmt) {
        DdlKind::AlterTable
    } else {
        DdlKind::Other
    }
}

/// Accumulates a [`Schema`] statement by statement
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    schema: Schema,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed every statement of a DDL script
    pub fn parse_script(&mut self, sql: &str) -> &mut Self {
        for stmt in split_statements(sql) {
            self.feed(&stmt);
        }
        self
    }

    /// Apply one statement; returns false when it was not understood
    pub fn feed(&mut self, stmt: &str) -> bool {
        match classify(stmt) {
            DdlKind::CreateTable => self.create_table(stmt),
            DdlKind::AlterTable => self.alter_table(stmt),
            DdlKind::CreateIndex => self.create_index(stmt),
            DdlKind::Other => false,
        }
    }

    pub fn build(self) -> Schema {
        self.schema
    }

    fn create_table(&mut self, stmt: &str) -> bool {
        let Some(caps) = CREATE_TABLE_RE.captures(stmt) else {
            return false;
        };
        let open = caps.get(0).map(|m| m.end() - 1).unwrap_or_default();
        let Some(body) = enclosed(stmt, open) else {
            return false;
        };
        let Some(relation) = self.schema.declare(object_name(&caps["name"])) else {
            tracing::debug!(table = &caps["name"], "duplicate CREATE TABLE ignored");
            return false;
        };

        for element in split_top_level(body) {
            if is_constraint(element) {
                apply_constraint(relation, element);
            } else {
                add_column(relation, element);
            }
        }
        true
    }

    fn alter_table(&mut self, stmt: &str) -> bool {
        let Some(caps) = ALTER_TABLE_RE.captures(stmt) else {
            return false;
        };
        let Some(relation) = self.schema.relation_mut(&object_name(&caps["name"])) else {
            return false;
        };
        for action in split_top_level(&caps["actions"]) {
            let action = strip_keyword(action, "ADD");
            if is_constraint(action) {
                apply_constraint(relation, action);
            }
        }
        true
    }

    fn create_index(&mut self, stmt: &str) -> bool {
        let Some(caps) = CREATE_INDEX_RE.captures(stmt) else {
            return false;
        };
        if caps.name("unique").is_none() {
            return true;
        }
        match self.schema.relation_mut(&object_name(&caps["table"])) {
            Some(relation) => {
                relation.unique_sets.push(identifier_list(&caps["columns"]));
                true
            }
            None => false,
        }
    }
}

/// Parse a DDL script into a [`Schema`]
pub fn parse_schema(sql: &str) -> Schema {
    let mut builder = SchemaBuilder::new();
    builder.parse_script(sql);
    builder.build()
}

fn add_column(relation: &mut Relation, element: &str) {
    let Some(caps) = COLUMN_RE.captures(element) else {
        return;
    };
    let name = unquote(&caps["name"]);
    let in_key = INLINE_KEY_RE.is_match(element);
    relation.columns.push(Column {
        name: name.clone(),
        sql_type: caps["type"].to_string(),
        nullable: !in_key && !NOT_NULL_RE.is_match(element),
        in_key,
    });

    if in_key {
        relation.key = vec![name.clone()];
    } else if INLINE_UNIQUE_RE.is_match(element) {
        relation.unique_sets.push(vec![name.clone()]);
    }
    if let Some(r) = REFERENCES_RE.captures(element) {
        relation.references.push(Reference {
            constraint: r.name("constraint").map(|m| unquote(m.as_str())),
            columns: vec![name],
            target: object_name(&r["target"]),
            target_columns: identifier_list(&r["target_columns"]),
        });
    }
}

/// Primary key, foreign key or unique constraint, from a table body or `ALTER TABLE ADD`
fn apply_constraint(relation: &mut Relation, element: &str) {
    if let Some(fk) = FOREIGN_KEY_RE.captures(element) {
        relation.references.push(Reference {
            constraint: fk.name("constraint").map(|m| unquote(m.as_str())),
            columns: identifier_list(&fk["columns"]),
            target: object_name(&fk["target"]),
            target_columns: identifier_list(&fk["target_columns"]),
        });
    } else if let Some(pk) = PRIMARY_KEY_RE.captures(element) {
        relation.set_key(identifier_list(&pk["columns"]));
    } else if let Some(unique) = UNIQUE_RE.captures(element) {
        relation.unique_sets.push(identifier_list(&unique["columns"]));
    }
}

fn is_constraint(element: &str) -> bool {
    let first = element
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default();
    CONSTRAINT_KEYWORDS
        .iter()
        .any(|k| first.eq_ignore_ascii_case(k))
}

fn strip_keyword<'a>(s: &'a str, keyword: &str) -> &'a str {
    let trimmed = s.trim_start();
    match trimmed.get(..keyword.len()) {
        Some(head)
            if head.eq_ignore_ascii_case(keyword)
                && trimmed[keyword.len()..].starts_with(char::is_whitespace) =>
        {
            trimmed[keyword.len()..].trim_start()
        }
        _ => trimmed,
    }
}

/// Strip one level of identifier quoting
pub fn unquote(ident: &str) -> String {
    let ident = ident.trim();
    let stripped = ident
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| ident.strip_prefix('`').and_then(|s| s.strip_suffix('`')))
        .or_else(|| ident.strip_prefix('[').and_then(|s| s.strip_suffix(']')));
    stripped.unwrap_or(ident).to_string()
}

/// Unqualified, unquoted object name: `"sales"."Orders"` is `Orders`
pub fn object_name(qualified: &str) -> String {
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, ch) in qualified.char_indices() {
        match (quote, ch) {
            (None, '"') | (None, '`') => quote = Some(ch),
            (None, '[') => quote = Some(']'),
            (Some(q), c) if c == q => quote = None,
            (None, '.') => start = i + 1,
            _ => {}
        }
    }
    unquote(&qualified[start..])
}

/// Comma-separated identifiers, unquoted; sort order suffixes are dropped
pub fn identifier_list(s: &str) -> Vec<String> {
    s.split(',')
        .filter_map(|part| {
            let part = part.trim();
            let close = match part.chars().next() {
                Some('"') => Some('"'),
                Some('`') => Some('`'),
                Some('[') => Some(']'),
                _ => None,
            };
            let end = match close {
                Some(q) => part[1..].find(q).map(|p| p + 2),
                None => part.find(char::is_whitespace),
            };
            let ident = unquote(&part[..end.unwrap_or(part.len())]);
            (!ident.is_empty()).then_some(ident)
        })
        .collect()
}

/// Text between the parenthesis at byte `open` and its partner
fn enclosed(s: &str, open: usize) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    for (i, ch) in s.char_indices().skip_while(|(i, _)| *i < open) {
        match ch {
            '\'' => in_string = !in_string,
            '(' if !in_string => depth += 1,
            ')' if !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&s[open + 1..i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on commas that are not nested in parentheses or quotes
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, ch) in s.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'') | (None, '"') | (None, '`') => quote = Some(ch),
            (None, '(') => depth += 1,
            (None, ')') => depth -= 1,
            (None, ',') if depth == 0 => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim());
    parts.retain(|p| !p.is_empty());
    parts
}

/// Split a script into statements on `;`, dropping `--` and `/* */` comments
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();

    while let Some(ch) = chars.next() {
        if let Some(q) = quote {
            current.push(ch);
            if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '-' if chars.peek() == Some(&'-') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
                current.push('\n');
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                current.push(' ');
            }
            ';' => {
                let stmt = current.trim();
                if !stmt.is_empty() {
                    statements.push(stmt.to_string());
                }
                current.clear();
            }
            '\'' | '"' | '`' => {
                quote = Some(ch);
                current.push(ch);
            }
            _ => current.push(ch),
        }
    }

    let tail = current.trim();
    if !tail.is_empty() {
        statements.push(tail.to_string());
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_statements_skips_comments_and_quoted_semicolons() {
        let sql = "-- header; not a statement\nCREATE TABLE a (id INT);\n/* b; c */ INSERT INTO a VALUES (';');";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TABLE a"));
        assert_eq!(stmts[1], "INSERT INTO a VALUES (';')");
    }

    #[test]
    fn test_inline_reference_and_not_null() {
        let schema = parse_schema(
            "CREATE TABLE parent (id INTEGER PRIMARY KEY);
             CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER NOT NULL REFERENCES parent(id));",
        );
        let child = schema.relation_by_name("child").unwrap();
        assert_eq!(
            child.references,
            vec![Reference {
                constraint: None,
                columns: vec!["parent_id".to_string()],
                target: "parent".to_string(),
                target_columns: vec!["id".to_string()],
            }]
        );
        assert!(!child.column("parent_id").unwrap().nullable);
        assert_eq!(child.key, vec!["id".to_string()]);
    }

    #[test]
    fn test_unique_constraint_detected() {
        let schema =
            parse_schema("CREATE TABLE profile (id INT PRIMARY KEY, user_id INT, UNIQUE (user_id));");
        let profile = schema.relation_by_name("profile").unwrap();
        assert!(profile.is_unique(&["user_id".to_string()]));
        assert!(profile.is_unique(&["id".to_string()]));
        assert!(!profile.is_unique(&["id".to_string(), "user_id".to_string()]));
    }

    #[test]
    fn test_alter_table_adds_constraints() {
        let schema = parse_schema(
            "CREATE TABLE a (id INT, b_id INT);
             CREATE TABLE b (id INT PRIMARY KEY);
             ALTER TABLE ONLY public.a ADD CONSTRAINT fk_a_b FOREIGN KEY (b_id) REFERENCES public.b (id),
                 ADD PRIMARY KEY (id);",
        );
        let a = schema.relation_by_name("a").unwrap();
        assert_eq!(a.references.len(), 1);
        assert_eq!(a.references[0].constraint.as_deref(), Some("fk_a_b"));
        assert_eq!(a.references[0].target, "b");
        assert_eq!(a.key, vec!["id".to_string()]);
        assert!(a.column("id").unwrap().in_key);
    }

    #[test]
    fn test_qualified_and_quoted_names() {
        assert_eq!(object_name(r#""sales"."Orders""#), "Orders");
        assert_eq!(object_name("[dbo].[order.lines]"), "order.lines");
        assert_eq!(object_name("`shop`.customer"), "customer");
        assert_eq!(identifier_list(r#""a", b DESC, [c]"#), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_column_types_keep_arguments() {
        let schema = parse_schema(
            "CREATE TABLE m (price DECIMAL(10, 2) NOT NULL, ratio DOUBLE PRECISION, label CHARACTER VARYING(20));",
        );
        let m = schema.relation_by_name("m").unwrap();
        let types: Vec<&str> = m.columns.iter().map(|c| c.sql_type.as_str()).collect();
        assert_eq!(types, vec!["DECIMAL(10, 2)", "DOUBLE PRECISION", "CHARACTER VARYING(20)"]);
        assert!(m.key.is_empty());
    }
}
