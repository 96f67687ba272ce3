//! Filter expression compiler.
//!
//! Untrusted `?filter=` strings are lexed and parsed into a small AST, then
//! compiled against the schema snapshot into a SQL fragment in which every
//! literal value is a bound parameter. The compiler never interpolates user
//! values into SQL text.

use crate::{
    error::DbError,
    schema::{quote_ident, ColumnDescriptor, TableDescriptor},
};

/// Hard caps protecting against pathological inputs.
const MAX_NODES: usize = 64;
const MAX_DEPTH: usize = 16;
const MAX_TOKENS: usize = 256;

/// Bound parameter carried next to the generated SQL. Values travel as text
/// and the SQL casts them to the column's type (`$1::int8`).
#[derive(Clone, Debug, PartialEq)]
pub enum SqlParam {
    Text(String),
    Int(i64),
    TextArray(Vec<String>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    NotLike,
}

impl CmpOp {
    fn sql(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Like => "LIKE",
            CmpOp::NotLike => "NOT LIKE",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(String),
    Bool(bool),
    Null,
    Op(CmpOp),
    And,
    Or,
    In,
    Not,
    LParen,
    RParen,
    Comma,
}

#[derive(Clone, Debug, PartialEq)]
enum Literal {
    Str(String),
    Num(String),
    Bool(bool),
    Null,
}

#[derive(Clone, Debug)]
enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Cmp {
        column: String,
        op: CmpOp,
        value: Literal,
    },
    In {
        column: String,
        negated: bool,
        values: Vec<Literal>,
    },
}

fn lex(input: &str) -> Result<Vec<Token>, DbError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if tokens.len() > MAX_TOKENS {
            return Err(DbError::validation("filter expression is too long"));
        }
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '\'' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => {
                            // Doubled quote is an escaped quote.
                            if chars.peek() == Some(&'\'') {
                                chars.next();
                                value.push('\'');
                            } else {
                                break;
                            }
                        }
                        Some(other) => value.push(other),
                        None => {
                            return Err(DbError::validation("unterminated string literal in filter"))
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err(DbError::validation("expected '&&' in filter"));
                }
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err(DbError::validation("expected '||' in filter"));
                }
                tokens.push(Token::Or);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Op(CmpOp::Eq));
            }
            '!' => {
                chars.next();
                match chars.next() {
                    Some('=') => tokens.push(Token::Op(CmpOp::Ne)),
                    Some('~') => tokens.push(Token::Op(CmpOp::NotLike)),
                    _ => return Err(DbError::validation("expected '!=' or '!~' in filter")),
                }
            }
            '~' => {
                chars.next();
                tokens.push(Token::Op(CmpOp::Like));
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CmpOp::Ge));
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CmpOp::Le));
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                }
            }
            c if c.is_ascii_digit() || c == '-' => {
                chars.next();
                let mut value = String::from(c);
                let mut seen_dot = false;
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || (d == '.' && !seen_dot) {
                        seen_dot |= d == '.';
                        value.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if value == "-" {
                    return Err(DbError::validation("dangling '-' in filter"));
                }
                tokens.push(Token::Num(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        word.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match word.to_ascii_uppercase().as_str() {
                    "AND" => tokens.push(Token::And),
                    "OR" => tokens.push(Token::Or),
                    "IN" => tokens.push(Token::In),
                    "NOT" => tokens.push(Token::Not),
                    "TRUE" => tokens.push(Token::Bool(true)),
                    "FALSE" => tokens.push(Token::Bool(false)),
                    "NULL" => tokens.push(Token::Null),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => {
                return Err(DbError::validation(format!(
                    "unexpected character '{other}' in filter"
                )))
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    nodes: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn bump_node(&mut self) -> Result<(), DbError> {
        self.nodes += 1;
        if self.nodes > MAX_NODES {
            return Err(DbError::validation("filter expression is too complex"));
        }
        Ok(())
    }

    fn parse_or(&mut self, depth: usize) -> Result<Expr, DbError> {
        if depth > MAX_DEPTH {
            return Err(DbError::validation("filter expression nests too deeply"));
        }
        let mut branches = vec![self.parse_and(depth)?];
        while matches!(self.peek(), Some(Token::Or)) {
            self.next();
            branches.push(self.parse_and(depth)?);
        }
        if branches.len() == 1 {
            Ok(branches.pop().unwrap())
        } else {
            self.bump_node()?;
            Ok(Expr::Or(branches))
        }
    }

    fn parse_and(&mut self, depth: usize) -> Result<Expr, DbError> {
        let mut branches = vec![self.parse_cmp(depth)?];
        while matches!(self.peek(), Some(Token::And)) {
            self.next();
            branches.push(self.parse_cmp(depth)?);
        }
        if branches.len() == 1 {
            Ok(branches.pop().unwrap())
        } else {
            self.bump_node()?;
            Ok(Expr::And(branches))
        }
    }

    fn parse_cmp(&mut self, depth: usize) -> Result<Expr, DbError> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or(depth + 1)?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(DbError::validation("unbalanced parentheses in filter")),
                }
            }
            Some(Token::Ident(column)) => self.parse_predicate(column),
            other => Err(DbError::validation(format!(
                "expected column or '(' in filter, found {other:?}"
            ))),
        }
    }

    fn parse_predicate(&mut self, column: String) -> Result<Expr, DbError> {
        self.bump_node()?;
        match self.next() {
            Some(Token::Op(op)) => {
                let value = self.parse_literal()?;
                Ok(Expr::Cmp { column, op, value })
            }
            Some(Token::In) => self.parse_in(column, false),
            Some(Token::Not) => match self.next() {
                Some(Token::In) => self.parse_in(column, true),
                _ => Err(DbError::validation("expected IN after NOT in filter")),
            },
            other => Err(DbError::validation(format!(
                "expected operator after '{column}', found {other:?}"
            ))),
        }
    }

    fn parse_in(&mut self, column: String, negated: bool) -> Result<Expr, DbError> {
        if self.next() != Some(Token::LParen) {
            return Err(DbError::validation("expected '(' after IN"));
        }
        let mut values = Vec::new();
        loop {
            values.push(self.parse_literal()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                _ => return Err(DbError::validation("unbalanced parentheses in IN list")),
            }
        }
        Ok(Expr::In {
            column,
            negated,
            values,
        })
    }

    fn parse_literal(&mut self) -> Result<Literal, DbError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Literal::Str(s)),
            Some(Token::Num(n)) => Ok(Literal::Num(n)),
            Some(Token::Bool(b)) => Ok(Literal::Bool(b)),
            Some(Token::Null) => Ok(Literal::Null),
            other => Err(DbError::validation(format!(
                "expected literal value in filter, found {other:?}"
            ))),
        }
    }
}

/// Compiles a filter expression into a SQL predicate, pushing bound values
/// onto `params`. Placeholders continue from `params.len()`.
pub fn compile(
    input: &str,
    table: &TableDescriptor,
    params: &mut Vec<SqlParam>,
) -> Result<String, DbError> {
    let tokens = lex(input)?;
    if tokens.is_empty() {
        return Err(DbError::validation("empty filter expression"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        nodes: 0,
    };
    let expr = parser.parse_or(0)?;
    if parser.pos != parser.tokens.len() {
        return Err(DbError::validation("trailing tokens in filter expression"));
    }
    emit(&expr, table, params)
}

fn emit(expr: &Expr, table: &TableDescriptor, params: &mut Vec<SqlParam>) -> Result<String, DbError> {
    match expr {
        Expr::Or(branches) => {
            let parts = branches
                .iter()
                .map(|b| emit(b, table, params))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(format!("({})", parts.join(" OR ")))
        }
        Expr::And(branches) => {
            let parts = branches
                .iter()
                .map(|b| emit(b, table, params))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(format!("({})", parts.join(" AND ")))
        }
        Expr::Cmp { column, op, value } => {
            let col = resolve_column(table, column)?;
            emit_cmp(col, *op, value, params)
        }
        Expr::In {
            column,
            negated,
            values,
        } => {
            let col = resolve_column(table, column)?;
            let mut placeholders = Vec::with_capacity(values.len());
            for value in values {
                let text = match value {
                    Literal::Null => {
                        return Err(DbError::validation("null is not allowed inside IN (...)"))
                    }
                    other => literal_text(other),
                };
                params.push(SqlParam::Text(text));
                placeholders.push(format!("${}::{}", params.len(), col.pg_type.cast_name()));
            }
            let keyword = if *negated { "NOT IN" } else { "IN" };
            Ok(format!(
                "{} {} ({})",
                quote_ident(&col.name),
                keyword,
                placeholders.join(", ")
            ))
        }
    }
}

fn emit_cmp(
    col: &ColumnDescriptor,
    op: CmpOp,
    value: &Literal,
    params: &mut Vec<SqlParam>,
) -> Result<String, DbError> {
    let ident = quote_ident(&col.name);
    match (op, value) {
        (CmpOp::Eq, Literal::Null) => Ok(format!("{ident} IS NULL")),
        (CmpOp::Ne, Literal::Null) => Ok(format!("{ident} IS NOT NULL")),
        (_, Literal::Null) => Err(DbError::validation(
            "null may only be compared with = or !=",
        )),
        (CmpOp::Like | CmpOp::NotLike, value) => {
            let Literal::Str(text) = value else {
                return Err(DbError::validation("~ and !~ require a string value"));
            };
            params.push(SqlParam::Text(text.clone()));
            Ok(format!("{ident}::text {} ${}", op.sql(), params.len()))
        }
        (_, value) => {
            params.push(SqlParam::Text(literal_text(value)));
            Ok(format!(
                "{ident} {} ${}::{}",
                op.sql(),
                params.len(),
                col.pg_type.cast_name()
            ))
        }
    }
}

fn literal_text(value: &Literal) -> String {
    match value {
        Literal::Str(s) => s.clone(),
        Literal::Num(n) => n.clone(),
        Literal::Bool(true) => "true".to_owned(),
        Literal::Bool(false) => "false".to_owned(),
        Literal::Null => String::new(),
    }
}

fn resolve_column<'t>(
    table: &'t TableDescriptor,
    name: &str,
) -> Result<&'t ColumnDescriptor, DbError> {
    table
        .column(name)
        .ok_or_else(|| DbError::validation(format!("unknown column \"{name}\"")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDescriptor, PgType, TableDescriptor};

    fn posts() -> TableDescriptor {
        let column = |name: &str, pg_type: PgType, ordinal: i32| ColumnDescriptor {
            name: name.into(),
            pg_type,
            nullable: true,
            has_default: false,
            ordinal,
        };
        TableDescriptor {
            schema: "public".into(),
            name: "posts".into(),
            is_view: false,
            rls_enabled: false,
            columns: vec![
                column("id", PgType::Int8, 1),
                column("title", PgType::Text, 2),
                column("published", PgType::Bool, 3),
                column("views", PgType::Int4, 4),
            ],
            primary_key: Some("id".into()),
            unique_indexes: vec![],
            foreign_keys: vec![],
        }
    }

    fn compile_ok(input: &str) -> (String, Vec<SqlParam>) {
        let mut params = Vec::new();
        let sql = compile(input, &posts(), &mut params).expect("filter compiles");
        (sql, params)
    }

    #[test]
    fn values_become_parameters_never_text() {
        let (sql, params) = compile_ok("title = 'a''b' && views > 10");
        assert!(!sql.contains("a'b"));
        assert!(!sql.contains("10"));
        assert_eq!(
            params,
            vec![
                SqlParam::Text("a'b".into()),
                SqlParam::Text("10".into()),
            ]
        );
        assert_eq!(sql, "(\"title\" = $1::text AND \"views\" > $2::int4)");
    }

    #[test]
    fn null_compiles_to_is_null() {
        let (sql, params) = compile_ok("title = null || title != null");
        assert_eq!(sql, "(\"title\" IS NULL OR \"title\" IS NOT NULL)");
        assert!(params.is_empty());
    }

    #[test]
    fn keywords_match_case_insensitively() {
        let (sql, _) = compile_ok("published = TRUE and views < 5 OR id IN (1, 2)");
        assert!(sql.contains("AND"));
        assert!(sql.contains("OR"));
        assert!(sql.contains("IN ($3::int8, $4::int8)"));
    }

    #[test]
    fn not_in_is_supported() {
        let (sql, params) = compile_ok("id NOT IN (1, 2, 3)");
        assert_eq!(sql, "\"id\" NOT IN ($1::int8, $2::int8, $3::int8)");
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn like_requires_string() {
        let mut params = Vec::new();
        let err = compile("title ~ 5", &posts(), &mut params).unwrap_err();
        assert!(matches!(err, DbError::Validation(_)));

        let (sql, _) = compile_ok("title ~ '%go%'");
        assert_eq!(sql, "\"title\"::text LIKE $1");
    }

    #[test]
    fn unknown_column_is_rejected() {
        let mut params = Vec::new();
        let err = compile("secret = 1", &posts(), &mut params).unwrap_err();
        assert!(err.to_string().contains("unknown column"));
    }

    #[test]
    fn unbalanced_parens_are_rejected() {
        for bad in ["(title = 'a'", "title = 'a')", "id IN (1, 2", ")("] {
            let mut params = Vec::new();
            assert!(
                compile(bad, &posts(), &mut params).is_err(),
                "{bad} should not parse"
            );
        }
    }

    #[test]
    fn node_cap_rejects_pathological_input() {
        let clause = (0..70)
            .map(|i| format!("views = {i}"))
            .collect::<Vec<_>>()
            .join(" && ");
        let mut params = Vec::new();
        let err = compile(&clause, &posts(), &mut params).unwrap_err();
        assert!(err.to_string().contains("too complex"));
    }

    #[test]
    fn depth_cap_rejects_deep_nesting() {
        let depth = 20;
        let input = format!(
            "{}views = 1{}",
            "(".repeat(depth),
            ")".repeat(depth)
        );
        let mut params = Vec::new();
        let err = compile(&input, &posts(), &mut params).unwrap_err();
        assert!(err.to_string().contains("nests too deeply"));
    }

    #[test]
    fn empty_in_list_is_rejected() {
        let mut params = Vec::new();
        assert!(compile("id IN ()", &posts(), &mut params).is_err());
    }
}
