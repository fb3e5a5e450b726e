// Statement and expression trees handed to the executor.

use crate::types::schema::Column;
use crate::types::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateTable {
        name: String,
        columns: Vec<Column>,
    },
    DropTable {
        name: String,
    },
    CreateIndex {
        name: String,
        table: String,
        columns: Vec<String>,
        unique: bool,
    },
    DropIndex {
        name: String,
    },
    Insert {
        table: String,
        columns: Vec<String>,
        rows: Vec<Vec<Expr>>,
        on_conflict_merge: bool,
        /// `VALID PERIOD [...]` was present; application-time temporality
        /// is recognized but not executed.
        valid_period: bool,
    },
    Update {
        table: String,
        assignments: Vec<(String, Expr)>,
        filter: Option<Expr>,
    },
    Delete {
        table: String,
        filter: Option<Expr>,
    },
    Select(SelectStatement),
    SetDpEpsilon(f64),
    SetIsolation(crate::transaction::IsolationLevel),
    SaveDatabase {
        path: Option<String>,
    },
    LoadDatabase {
        path: Option<String>,
    },
    Vacuum,
    Exit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub projection: Vec<SelectItem>,
    pub table: String,
    pub table_alias: Option<String>,
    pub join: Option<JoinClause>,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub order_by: Vec<(Expr, bool)>,
    pub limit: Option<usize>,
    /// `FOR SYSTEM_TIME AS OF TX n`.
    pub as_of_tx: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Star,
    Expr { expr: Expr, alias: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub table: String,
    pub alias: Option<String>,
    pub on: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Optionally qualified column reference (`t.v` or `v`).
    Column(Option<String>, String),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    /// `COUNT(*)`, `SUM(x)`, `DISTANCE(v, [..])`, ...
    Function {
        name: String,
        args: Vec<Expr>,
        star: bool,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    /// `[a, b, c]` — vector or generic array literal.
    Array(Vec<Expr>),
    /// `{'a', 'b'}` — set literal.
    SetLiteral(Vec<Expr>),
}

impl Expr {
    /// Whether the expression contains an aggregate call.
    pub fn has_aggregate(&self) -> bool {
        match self {
            Expr::Function { name, .. } => {
                matches!(
                    name.to_ascii_lowercase().as_str(),
                    "count" | "sum" | "min" | "max" | "avg"
                )
            }
            Expr::Unary { expr, .. } => expr.has_aggregate(),
            Expr::Binary { left, right, .. } => left.has_aggregate() || right.has_aggregate(),
            Expr::IsNull { expr, .. } => expr.has_aggregate(),
            Expr::Array(items) | Expr::SetLiteral(items) => {
                items.iter().any(|e| e.has_aggregate())
            }
            _ => false,
        }
    }
}
