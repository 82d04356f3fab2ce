use regex::Regex;
use serde_json::Value;

/// One step of a `.a.b[0]["k"]` path.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum PathSeg {
    Field(String),
    Index(i64),
    Key(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOp {
    pub(crate) fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) enum Expr {
    /// `.`, `.a.b`, or a path applied to another expression.
    Path {
        target: Option<Box<Expr>>,
        segs: Vec<PathSeg>,
    },
    Literal(Value),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Pipe(Box<Expr>, Box<Expr>),
    /// `a // b`: `b` when `a` yields nothing, `null`/`false`, or fails.
    Alternative(Box<Expr>, Box<Expr>),
    If {
        clauses: Vec<(Expr, Expr)>,
        otherwise: Option<Box<Expr>>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    /// `test("...")` with its pattern compiled ahead of time.
    RegexTest(Regex),
}
