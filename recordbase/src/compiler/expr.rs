/// Computed-field expression AST.
///
/// Bodies are written in a small arrow-function language:
/// `(family) => sumMap(family.children, (child) => child.happy ? 1 : 0)`.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Ident(String),
    Member(Box<Expr>, String),
    Str(String),
    Number(String),
    Bool(bool),
    Null,
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    Array(Vec<Expr>),
    Template(Vec<TemplatePart>),
    Call {
        target: Option<Box<Expr>>,
        name: String,
        args: Vec<Expr>,
    },
    Lambda {
        params: Vec<String>,
        body: Box<Expr>,
    },
    New {
        class: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    And,
    Or,
    Coalesce,
}

impl BinaryOp {
    pub fn sql(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "!=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Coalesce => "??",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(String),
    Expr(Expr),
}

// ── Builders ────────────────────────────────────────────────────────

impl Expr {
    pub fn ident(name: &str) -> Expr {
        Expr::Ident(name.to_string())
    }

    pub fn string(value: &str) -> Expr {
        Expr::Str(value.to_string())
    }

    pub fn member(self, field: &str) -> Expr {
        Expr::Member(Box::new(self), field.to_string())
    }

    pub fn method(self, name: &str, args: Vec<Expr>) -> Expr {
        Expr::Call {
            target: Some(Box::new(self)),
            name: name.to_string(),
            args,
        }
    }

    pub fn call(name: &str, args: Vec<Expr>) -> Expr {
        Expr::Call {
            target: None,
            name: name.to_string(),
            args,
        }
    }

    pub fn lambda(params: &[&str], body: Expr) -> Expr {
        Expr::Lambda {
            params: params.iter().map(|p| p.to_string()).collect(),
            body: Box::new(body),
        }
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary(op, Box::new(left), Box::new(right))
    }

    pub fn conditional(test: Expr, then: Expr, otherwise: Expr) -> Expr {
        Expr::Conditional(Box::new(test), Box::new(then), Box::new(otherwise))
    }
}
