// SQL front end.
//
// A small recursive-descent parser over the token stream. This surface is
// deliberately thin: it covers the statements the engine executes, plus
// the LatticeDB extensions (vector and set column types, `MERGE <policy>`
// column options, `ON CONFLICT MERGE`, `FOR SYSTEM_TIME AS OF TX n`,
// `VALID PERIOD [...]`).

pub mod ast;
pub mod lexer;

pub use ast::{BinaryOp, Expr, JoinClause, SelectItem, SelectStatement, Statement, UnaryOp};

use crate::crdt::MergePolicy;
use crate::error::{DbError, Result};
use crate::transaction::IsolationLevel;
use crate::types::schema::Column;
use crate::types::value::{DataType, Value};
use lexer::{tokenize, Token};

/// Parses a script into statements. Statements are separated by `;`.
pub fn parse(sql: &str) -> Result<Vec<Statement>> {
    let tokens = tokenize(sql)?;
    let mut parser = Parser { tokens, pos: 0 };
    let mut statements = Vec::new();
    loop {
        while parser.eat(&Token::Semicolon) {}
        if parser.at_end() {
            break;
        }
        statements.push(parser.statement()?);
        if !parser.at_end() && !parser.eat(&Token::Semicolon) {
            return Err(parser.unexpected("end of statement"));
        }
    }
    Ok(statements)
}

/// Words that terminate a table alias position.
const RESERVED_AFTER_TABLE: &[&str] = &[
    "for", "inner", "join", "on", "where", "group", "order", "limit", "values",
];

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.peek().is_some_and(|t| t.is_kw(kw)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn expect_kw(&mut self, kw: &str) -> Result<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.unexpected(kw))
        }
    }

    fn unexpected(&self, expected: &str) -> DbError {
        match self.peek() {
            Some(t) => DbError::Parse(format!("expected {}, found {:?}", expected, t)),
            None => DbError::Parse(format!("expected {}, found end of input", expected)),
        }
    }

    fn ident(&mut self, what: &str) -> Result<String> {
        match self.next() {
            Some(Token::Ident(s)) => Ok(s),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected(what))
            }
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn statement(&mut self) -> Result<Statement> {
        if self.eat_kw("create") {
            return self.create();
        }
        if self.eat_kw("drop") {
            return self.drop();
        }
        if self.eat_kw("insert") {
            return self.insert();
        }
        if self.eat_kw("update") {
            return self.update();
        }
        if self.eat_kw("delete") {
            return self.delete();
        }
        if self.eat_kw("select") {
            return Ok(Statement::Select(self.select()?));
        }
        if self.eat_kw("set") {
            return self.set();
        }
        if self.eat_kw("save") {
            self.expect_kw("database")?;
            let path = self.optional_string();
            return Ok(Statement::SaveDatabase { path });
        }
        if self.eat_kw("load") {
            self.expect_kw("database")?;
            let path = self.optional_string();
            return Ok(Statement::LoadDatabase { path });
        }
        if self.eat_kw("vacuum") {
            return Ok(Statement::Vacuum);
        }
        if self.eat_kw("exit") || self.eat_kw("quit") {
            return Ok(Statement::Exit);
        }
        Err(self.unexpected("a statement"))
    }

    fn optional_string(&mut self) -> Option<String> {
        match self.peek() {
            Some(Token::Str(s)) => {
                let s = s.clone();
                self.pos += 1;
                Some(s)
            }
            _ => None,
        }
    }

    fn create(&mut self) -> Result<Statement> {
        if self.eat_kw("table") {
            let name = self.ident("table name")?;
            self.expect(&Token::LParen, "(")?;
            let mut columns = Vec::new();
            loop {
                columns.push(self.column_def()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RParen, ")")?;
            return Ok(Statement::CreateTable { name, columns });
        }
        let unique = self.eat_kw("unique");
        self.expect_kw("index")?;
        let name = self.ident("index name")?;
        self.expect_kw("on")?;
        let table = self.ident("table name")?;
        self.expect(&Token::LParen, "(")?;
        let mut columns = Vec::new();
        loop {
            columns.push(self.ident("column name")?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen, ")")?;
        Ok(Statement::CreateIndex {
            name,
            table,
            columns,
            unique,
        })
    }

    fn drop(&mut self) -> Result<Statement> {
        if self.eat_kw("table") {
            return Ok(Statement::DropTable {
                name: self.ident("table name")?,
            });
        }
        self.expect_kw("index")?;
        Ok(Statement::DropIndex {
            name: self.ident("index name")?,
        })
    }

    fn column_def(&mut self) -> Result<Column> {
        let name = self.ident("column name")?;
        let data_type = self.data_type()?;
        let mut column = Column::new(name, data_type);
        loop {
            if self.eat_kw("primary") {
                self.expect_kw("key")?;
                column = column.primary_key();
            } else if self.eat_kw("not") {
                self.expect_kw("null")?;
                column = column.not_null();
            } else if self.eat_kw("null") {
                column.nullable = true;
            } else if self.eat_kw("merge") {
                let policy_name = self.ident("merge policy")?;
                let mut args = Vec::new();
                if self.eat(&Token::LParen) {
                    loop {
                        args.push(self.signed_number()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(&Token::RParen, ")")?;
                }
                column = column.with_merge_policy(MergePolicy::parse(&policy_name, &args)?);
            } else {
                break;
            }
        }
        Ok(column)
    }

    fn data_type(&mut self) -> Result<DataType> {
        let name = self.ident("a data type")?.to_ascii_lowercase();
        match name.as_str() {
            "boolean" | "bool" => Ok(DataType::Boolean),
            "tinyint" => Ok(DataType::TinyInt),
            "smallint" => Ok(DataType::SmallInt),
            "int" | "integer" => Ok(DataType::Integer),
            "bigint" => Ok(DataType::BigInt),
            "double" | "float" | "real" => Ok(DataType::Double),
            "varchar" => {
                self.expect(&Token::LParen, "(")?;
                let n = self.unsigned_integer()? as usize;
                self.expect(&Token::RParen, ")")?;
                Ok(DataType::Varchar(n))
            }
            "text" | "string" => Ok(DataType::Text),
            "timestamp" => Ok(DataType::Timestamp),
            "date" => Ok(DataType::Date),
            "time" => Ok(DataType::Time),
            "blob" => Ok(DataType::Blob),
            "vector" => {
                self.expect(&Token::Lt, "<")?;
                let d = self.unsigned_integer()? as usize;
                self.expect(&Token::Gt, ">")?;
                Ok(DataType::Vector(d))
            }
            "set" => {
                self.expect(&Token::Lt, "<")?;
                let inner = self.data_type()?;
                self.expect(&Token::Gt, ">")?;
                Ok(DataType::Set(Box::new(inner)))
            }
            other => Err(DbError::Parse(format!("unknown data type {}", other))),
        }
    }

    fn unsigned_integer(&mut self) -> Result<u64> {
        match self.next() {
            Some(Token::Number(n)) => n
                .parse::<u64>()
                .map_err(|_| DbError::Parse(format!("expected an integer, found {}", n))),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected("an integer"))
            }
        }
    }

    fn signed_number(&mut self) -> Result<f64> {
        let negative = self.eat(&Token::Minus);
        match self.next() {
            Some(Token::Number(n)) => {
                let v: f64 = n
                    .parse()
                    .map_err(|_| DbError::Parse(format!("bad number {}", n)))?;
                Ok(if negative { -v } else { v })
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected("a number"))
            }
        }
    }

    fn insert(&mut self) -> Result<Statement> {
        self.eat_kw("into");
        let table = self.ident("table name")?;
        let mut columns = Vec::new();
        if self.eat(&Token::LParen) {
            loop {
                columns.push(self.ident("column name")?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RParen, ")")?;
        }
        self.expect_kw("values")?;
        let mut rows = Vec::new();
        loop {
            self.expect(&Token::LParen, "(")?;
            let mut row = Vec::new();
            loop {
                row.push(self.expr()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RParen, ")")?;
            rows.push(row);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        let mut on_conflict_merge = false;
        if self.eat_kw("on") {
            self.expect_kw("conflict")?;
            self.expect_kw("merge")?;
            on_conflict_merge = true;
        }
        let mut valid_period = false;
        if self.eat_kw("valid") {
            self.expect_kw("period")?;
            self.expect(&Token::LBracket, "[")?;
            let _from = self.expr()?;
            self.expect(&Token::Comma, ",")?;
            let _to = self.expr()?;
            self.expect(&Token::RBracket, "]")?;
            valid_period = true;
        }
        Ok(Statement::Insert {
            table,
            columns,
            rows,
            on_conflict_merge,
            valid_period,
        })
    }

    fn update(&mut self) -> Result<Statement> {
        let table = self.ident("table name")?;
        self.expect_kw("set")?;
        let mut assignments = Vec::new();
        loop {
            let column = self.ident("column name")?;
            self.expect(&Token::Eq, "=")?;
            assignments.push((column, self.expr()?));
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        let filter = if self.eat_kw("where") {
            Some(self.expr()?)
        } else {
            None
        };
        Ok(Statement::Update {
            table,
            assignments,
            filter,
        })
    }

    fn delete(&mut self) -> Result<Statement> {
        self.expect_kw("from")?;
        let table = self.ident("table name")?;
        let filter = if self.eat_kw("where") {
            Some(self.expr()?)
        } else {
            None
        };
        Ok(Statement::Delete { table, filter })
    }

    fn set(&mut self) -> Result<Statement> {
        if self.eat_kw("dp_epsilon") {
            self.expect(&Token::Eq, "=")?;
            return Ok(Statement::SetDpEpsilon(self.signed_number()?));
        }
        if self.eat_kw("isolation") {
            self.expect_kw("level")?;
            let level = if self.eat_kw("read") {
                if self.eat_kw("committed") {
                    IsolationLevel::ReadCommitted
                } else {
                    self.expect_kw("uncommitted")?;
                    IsolationLevel::ReadUncommitted
                }
            } else if self.eat_kw("repeatable") {
                self.expect_kw("read")?;
                IsolationLevel::RepeatableRead
            } else {
                self.expect_kw("serializable")?;
                IsolationLevel::Serializable
            };
            return Ok(Statement::SetIsolation(level));
        }
        Err(self.unexpected("DP_EPSILON or ISOLATION LEVEL"))
    }

    fn select(&mut self) -> Result<SelectStatement> {
        let mut projection = Vec::new();
        loop {
            if self.eat(&Token::Star) {
                projection.push(SelectItem::Star);
            } else {
                let expr = self.expr()?;
                let alias = if self.eat_kw("as") {
                    Some(self.ident("alias")?)
                } else {
                    None
                };
                projection.push(SelectItem::Expr { expr, alias });
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect_kw("from")?;
        let table = self.ident("table name")?;
        let table_alias = self.table_alias()?;

        let mut as_of_tx = None;
        if self.eat_kw("for") {
            self.expect_kw("system_time")?;
            self.expect_kw("as")?;
            self.expect_kw("of")?;
            self.expect_kw("tx")?;
            as_of_tx = Some(self.unsigned_integer()?);
        }

        let mut join = None;
        if self.eat_kw("inner") {
            self.expect_kw("join")?;
            join = Some(self.join_clause()?);
        } else if self.eat_kw("join") {
            join = Some(self.join_clause()?);
        }

        let filter = if self.eat_kw("where") {
            Some(self.expr()?)
        } else {
            None
        };

        let mut group_by = Vec::new();
        if self.eat_kw("group") {
            self.expect_kw("by")?;
            loop {
                group_by.push(self.expr()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }

        let mut order_by = Vec::new();
        if self.eat_kw("order") {
            self.expect_kw("by")?;
            loop {
                let expr = self.expr()?;
                let asc = if self.eat_kw("desc") {
                    false
                } else {
                    self.eat_kw("asc");
                    true
                };
                order_by.push((expr, asc));
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }

        let limit = if self.eat_kw("limit") {
            Some(self.unsigned_integer()? as usize)
        } else {
            None
        };

        Ok(SelectStatement {
            projection,
            table,
            table_alias,
            join,
            filter,
            group_by,
            order_by,
            limit,
            as_of_tx,
        })
    }

    fn table_alias(&mut self) -> Result<Option<String>> {
        if self.eat_kw("as") {
            return Ok(Some(self.ident("alias")?));
        }
        if let Some(Token::Ident(s)) = self.peek() {
            if !RESERVED_AFTER_TABLE
                .iter()
                .any(|kw| s.eq_ignore_ascii_case(kw))
            {
                let alias = s.clone();
                self.pos += 1;
                return Ok(Some(alias));
            }
        }
        Ok(None)
    }

    fn join_clause(&mut self) -> Result<JoinClause> {
        let table = self.ident("table name")?;
        let alias = self.table_alias()?;
        self.expect_kw("on")?;
        let on = self.expr()?;
        Ok(JoinClause { table, alias, on })
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn expr(&mut self) -> Result<Expr> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut left = self.and_expr()?;
        while self.eat_kw("or") {
            let right = self.and_expr()?;
            left = Expr::Binary {
                left: Box::new(left),
                op: BinaryOp::Or,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut left = self.not_expr()?;
        while self.eat_kw("and") {
            let right = self.not_expr()?;
            left = Expr::Binary {
                left: Box::new(left),
                op: BinaryOp::And,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr> {
        if self.eat_kw("not") {
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(self.not_expr()?),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let left = self.additive()?;
        if self.eat_kw("is") {
            let negated = self.eat_kw("not");
            self.expect_kw("null")?;
            return Ok(Expr::IsNull {
                expr: Box::new(left),
                negated,
            });
        }
        let op = match self.peek() {
            Some(Token::Eq) => Some(BinaryOp::Eq),
            Some(Token::Neq) => Some(BinaryOp::NotEq),
            Some(Token::Lt) => Some(BinaryOp::Lt),
            Some(Token::LtEq) => Some(BinaryOp::LtEq),
            Some(Token::Gt) => Some(BinaryOp::Gt),
            Some(Token::GtEq) => Some(BinaryOp::GtEq),
            _ => None,
        };
        match op {
            Some(op) => {
                self.pos += 1;
                let right = self.additive()?;
                Ok(Expr::Binary {
                    left: Box::new(left),
                    op,
                    right: Box::new(right),
                })
            }
            None => Ok(left),
        }
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.eat(&Token::Minus) {
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(self.unary()?),
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Number(n)) => {
                if n.contains('.') || n.contains('e') || n.contains('E') {
                    let v: f64 = n
                        .parse()
                        .map_err(|_| DbError::Parse(format!("bad number {}", n)))?;
                    Ok(Expr::Literal(Value::Double(v)))
                } else {
                    let v: i64 = n
                        .parse()
                        .map_err(|_| DbError::Parse(format!("bad number {}", n)))?;
                    Ok(Expr::Literal(Value::BigInt(v)))
                }
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Varchar(s))),
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.expr()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(&Token::RBracket, "]")?;
                }
                Ok(Expr::Array(items))
            }
            Some(Token::LBrace) => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBrace) {
                    loop {
                        items.push(self.expr()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(&Token::RBrace, "}")?;
                }
                Ok(Expr::SetLiteral(items))
            }
            Some(Token::LParen) => {
                let expr = self.expr()?;
                self.expect(&Token::RParen, ")")?;
                Ok(expr)
            }
            Some(Token::Ident(name)) => {
                if name.eq_ignore_ascii_case("true") {
                    return Ok(Expr::Literal(Value::Boolean(true)));
                }
                if name.eq_ignore_ascii_case("false") {
                    return Ok(Expr::Literal(Value::Boolean(false)));
                }
                if name.eq_ignore_ascii_case("null") {
                    return Ok(Expr::Literal(Value::Null));
                }
                if self.eat(&Token::LParen) {
                    // Function call.
                    if self.eat(&Token::Star) {
                        self.expect(&Token::RParen, ")")?;
                        return Ok(Expr::Function {
                            name,
                            args: Vec::new(),
                            star: true,
                        });
                    }
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.expr()?);
                            if !self.eat(&Token::Comma) {
                                break;
                            }
                        }
                        self.expect(&Token::RParen, ")")?;
                    }
                    return Ok(Expr::Function {
                        name,
                        args,
                        star: false,
                    });
                }
                if self.eat(&Token::Dot) {
                    let column = self.ident("column name")?;
                    return Ok(Expr::Column(Some(name), column));
                }
                Ok(Expr::Column(None, name))
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected("an expression"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_table_with_extensions() {
        let stmts = parse(
            "CREATE TABLE people(id TEXT PRIMARY KEY, name TEXT MERGE lww, \
             tags SET<TEXT> MERGE gset, credits INT MERGE sum_bounded(0, 1000000), \
             v VECTOR<3>);",
        )
        .unwrap();
        assert_eq!(stmts.len(), 1);
        match &stmts[0] {
            Statement::CreateTable { name, columns } => {
                assert_eq!(name, "people");
                assert_eq!(columns.len(), 5);
                assert!(columns[0].primary_key);
                assert_eq!(columns[1].merge_policy, Some(MergePolicy::Lww));
                assert_eq!(
                    columns[2].data_type,
                    DataType::Set(Box::new(DataType::Text))
                );
                assert_eq!(
                    columns[3].merge_policy,
                    Some(MergePolicy::SumBounded { lo: 0.0, hi: 1000000.0 })
                );
                assert_eq!(columns[4].data_type, DataType::Vector(3));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_insert_with_merge_and_sets() {
        let stmts = parse(
            "INSERT INTO people VALUES('u1', 'Ada', {'engineer','math'}, 10) ON CONFLICT MERGE;",
        )
        .unwrap();
        match &stmts[0] {
            Statement::Insert {
                table,
                rows,
                on_conflict_merge,
                ..
            } => {
                assert_eq!(table, "people");
                assert!(*on_conflict_merge);
                assert_eq!(rows.len(), 1);
                assert!(matches!(rows[0][2], Expr::SetLiteral(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_select_temporal_and_distance() {
        let stmts = parse(
            "SELECT id, v FROM t FOR SYSTEM_TIME AS OF TX 1 WHERE DISTANCE(v, [0,0,0]) < 0.2 \
             ORDER BY id DESC LIMIT 3;",
        )
        .unwrap();
        match &stmts[0] {
            Statement::Select(select) => {
                assert_eq!(select.as_of_tx, Some(1));
                assert_eq!(select.order_by.len(), 1);
                assert!(!select.order_by[0].1);
                assert_eq!(select.limit, Some(3));
                assert!(matches!(
                    select.filter,
                    Some(Expr::Binary {
                        op: BinaryOp::Lt,
                        ..
                    })
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_select_join_group() {
        let stmts = parse(
            "SELECT a.id, COUNT(*) FROM orders a INNER JOIN users u ON a.uid = u.id \
             WHERE u.active = true GROUP BY a.id;",
        )
        .unwrap();
        match &stmts[0] {
            Statement::Select(select) => {
                assert_eq!(select.table_alias.as_deref(), Some("a"));
                let join = select.join.as_ref().unwrap();
                assert_eq!(join.table, "users");
                assert_eq!(join.alias.as_deref(), Some("u"));
                assert_eq!(select.group_by.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_misc_statements() {
        assert_eq!(
            parse("SET DP_EPSILON = 0.5;").unwrap()[0],
            Statement::SetDpEpsilon(0.5)
        );
        assert_eq!(parse("VACUUM;").unwrap()[0], Statement::Vacuum);
        assert_eq!(parse("EXIT;").unwrap()[0], Statement::Exit);
        assert!(matches!(
            parse("SAVE DATABASE 'backup.db';").unwrap()[0],
            Statement::SaveDatabase { path: Some(_) }
        ));
        assert!(matches!(
            parse("SET ISOLATION LEVEL SERIALIZABLE;").unwrap()[0],
            Statement::SetIsolation(IsolationLevel::Serializable)
        ));
    }

    #[test]
    fn test_valid_period_recognized() {
        let stmts =
            parse("INSERT INTO t VALUES(1) VALID PERIOD ['2024-01-01', '2025-01-01'];").unwrap();
        assert!(matches!(
            stmts[0],
            Statement::Insert {
                valid_period: true,
                ..
            }
        ));
    }

    #[test]
    fn test_syntax_error_reported() {
        assert!(matches!(parse("SELEC 1;"), Err(DbError::Parse(_))));
        assert!(matches!(
            parse("CREATE TABLE t(id FOO);"),
            Err(DbError::Parse(_))
        ));
    }

    #[test]
    fn test_multiple_statements() {
        let stmts = parse("CREATE TABLE t(id INT); INSERT INTO t VALUES(1); SELECT * FROM t;")
            .unwrap();
        assert_eq!(stmts.len(), 3);
    }
}
