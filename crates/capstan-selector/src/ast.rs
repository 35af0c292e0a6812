//! Expression tree shared by the CEL parser and the legacy JSON form.

/// A parsed selector expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal scalar (string, number, bool, null).
    Lit(serde_json::Value),
    /// Top-level document field.
    Ident(String),
    /// `expr.field`
    Member(Box<Expr>, String),
    /// `expr[index]`
    Index(Box<Expr>, Box<Expr>),
    /// `expr.method(args...)`
    Call {
        recv: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}
