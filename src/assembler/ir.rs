//! Typed intermediate representation accepted by the assembler.
//!
//! The IR is already resolved: names refer either to locals of the
//! enclosing function or to symbols listed in [`SymbolBindings`].
//! Every statement and expression carries a [`NodeId`] that assembly
//! errors report back to the producer.

use std::collections::HashMap;
use std::fmt;

use crate::error::FaultKind;
use crate::object::{SymbolKind, TypeKind};

/// Identifies an IR node in error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One module's worth of declarations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleIr {
    pub name: String,
    /// Imports declared up front, in table order. Other imports are added
    /// on first use.
    pub imports: Vec<ImportDecl>,
    pub types: Vec<TypeDecl>,
    pub values: Vec<ValueDecl>,
    pub functions: Vec<FunctionDecl>,
    /// Module-level mutable slots, by name. Each starts out nil.
    pub statics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportDecl {
    pub node: NodeId,
    pub module: String,
    pub name: String,
    pub kind: SymbolKind,
    /// Re-export the import under this name.
    pub export_as: Option<String>,
}

/// Declared type of a field or capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldTy {
    Any,
    Nil,
    Bool,
    Int,
    Float,
    Str,
    /// A record or closure type, by symbol name.
    Named(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeDecl {
    pub node: NodeId,
    pub name: String,
    pub kind: TypeKind,
    pub parent: Option<String>,
    pub fields: Vec<(String, FieldTy)>,
    /// Method name to the local function implementing it. The function
    /// receives the record as its first parameter.
    pub methods: Vec<(String, String)>,
    pub exported: bool,
}

/// A compile-time constant.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstExpr {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Record { ty: String, fields: Vec<ConstExpr> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueDecl {
    pub node: NodeId,
    pub name: String,
    pub value: ConstExpr,
    pub exported: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub node: NodeId,
    pub name: String,
    pub params: Vec<String>,
    /// Collects arguments past `params` into a list.
    pub rest: Option<String>,
    /// Names of the captures, when the function is the body of a closure.
    pub captures: Vec<String>,
    pub body: Vec<Stmt>,
    pub exported: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub node: NodeId,
    pub kind: StmtKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Let { name: String, value: Expr },
    Assign { name: String, value: Expr },
    Expr(Expr),
    If {
        condition: Expr,
        then_branch: Vec<Stmt>,
        else_branch: Vec<Stmt>,
    },
    While { condition: Expr, body: Vec<Stmt> },
    Break,
    Continue,
    Return(Option<Expr>),
    Raise(Expr),
    Try { body: Vec<Stmt>, catches: Vec<CatchClause> },
    SetField {
        record: Expr,
        /// Record type, when known, for bounds checking.
        ty: Option<String>,
        index: usize,
        value: Expr,
    },
    SetIndex { list: Expr, index: Expr, value: Expr },
    Push { list: Expr, value: Expr },
    SetStatic { name: String, value: Expr },
    Block(Vec<Stmt>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CatchKind {
    Any,
    Type(String),
    Fault(FaultKind),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatchClause {
    pub node: NodeId,
    pub catch: CatchKind,
    /// Local that receives the exception.
    pub binding: Option<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Short-circuit
    And,
    /// Short-circuit
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub node: NodeId,
    pub kind: ExprKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Local(String),
    Capture(String),
    /// A value symbol: a module-level value or an imported value.
    Symbol(String),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary { op: UnaryOp, operand: Box<Expr> },
    /// Direct call of a function symbol.
    Call { callee: String, args: Vec<Expr> },
    CallClosure { closure: Box<Expr>, args: Vec<Expr> },
    Record { ty: String, fields: Vec<Expr> },
    Field {
        record: Box<Expr>,
        ty: Option<String>,
        index: usize,
    },
    Closure {
        function: String,
        ty: String,
        captures: Vec<Expr>,
    },
    List(Vec<Expr>),
    Index { list: Box<Expr>, index: Box<Expr> },
    Len(Box<Expr>),
    TypeOf(Box<Expr>),
    /// A type symbol as a first-class value.
    TypeValue(String),
    IsInstance { value: Box<Expr>, ty: String },
    /// -1 when `lhs` descends from `rhs`, 0 when equal, 1 otherwise.
    TypeCompare { lhs: Box<Expr>, rhs: Box<Expr> },
    /// Call a method looked up on the receiver's type at run time.
    MethodCall {
        receiver: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
    Static(String),
}

/// What a name in the IR refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolRef {
    /// Index into [`ModuleIr::functions`].
    Function(u32),
    /// Index into [`ModuleIr::types`].
    Type(u32),
    /// Index into [`ModuleIr::values`].
    Value(u32),
    Import {
        module: String,
        name: String,
        kind: SymbolKind,
    },
}

impl SymbolRef {
    pub fn kind(&self) -> SymbolKind {
        match self {
            SymbolRef::Function(_) => SymbolKind::Function,
            SymbolRef::Type(_) => SymbolKind::Type,
            SymbolRef::Value(_) => SymbolKind::Value,
            SymbolRef::Import { kind, .. } => *kind,
        }
    }
}

/// Side table from source names to symbols, produced upstream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolBindings {
    symbols: HashMap<String, SymbolRef>,
}

impl SymbolBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bindings for every declaration of `module`, by declared name.
    pub fn for_module(module: &ModuleIr) -> Self {
        let mut bindings = Self::new();
        for (i, ty) in module.types.iter().enumerate() {
            bindings.bind(&ty.name, SymbolRef::Type(i as u32));
        }
        for (i, value) in module.values.iter().enumerate() {
            bindings.bind(&value.name, SymbolRef::Value(i as u32));
        }
        for (i, function) in module.functions.iter().enumerate() {
            bindings.bind(&function.name, SymbolRef::Function(i as u32));
        }
        for import in &module.imports {
            bindings.bind_import(&import.name, &import.module, &import.name, import.kind);
        }
        bindings
    }

    pub fn bind(&mut self, name: &str, symbol: SymbolRef) -> &mut Self {
        self.symbols.insert(name.to_string(), symbol);
        self
    }

    pub fn bind_import(
        &mut self,
        local_name: &str,
        module: &str,
        name: &str,
        kind: SymbolKind,
    ) -> &mut Self {
        self.bind(
            local_name,
            SymbolRef::Import {
                module: module.to_string(),
                name: name.to_string(),
                kind,
            },
        )
    }

    pub fn get(&self, name: &str) -> Option<&SymbolRef> {
        self.symbols.get(name)
    }
}

/// Hands out fresh node ids while building IR by hand.
#[derive(Debug, Default)]
pub struct Builder {
    next: u32,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&mut self) -> NodeId {
        self.next += 1;
        NodeId(self.next)
    }

    pub fn expr(&mut self, kind: ExprKind) -> Expr {
        Expr {
            node: self.node(),
            kind,
        }
    }

    pub fn stmt(&mut self, kind: StmtKind) -> Stmt {
        Stmt {
            node: self.node(),
            kind,
        }
    }

    pub fn int(&mut self, n: i64) -> Expr {
        self.expr(ExprKind::Int(n))
    }

    pub fn str(&mut self, s: &str) -> Expr {
        self.expr(ExprKind::Str(s.to_string()))
    }

    pub fn local(&mut self, name: &str) -> Expr {
        self.expr(ExprKind::Local(name.to_string()))
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        self.expr(ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    pub fn call(&mut self, callee: &str, args: Vec<Expr>) -> Expr {
        self.expr(ExprKind::Call {
            callee: callee.to_string(),
            args,
        })
    }

    pub fn let_(&mut self, name: &str, value: Expr) -> Stmt {
        self.stmt(StmtKind::Let {
            name: name.to_string(),
            value,
        })
    }

    pub fn assign(&mut self, name: &str, value: Expr) -> Stmt {
        self.stmt(StmtKind::Assign {
            name: name.to_string(),
            value,
        })
    }

    pub fn ret(&mut self, value: Expr) -> Stmt {
        self.stmt(StmtKind::Return(Some(value)))
    }

    pub fn raise(&mut self, value: Expr) -> Stmt {
        self.stmt(StmtKind::Raise(value))
    }

    pub fn function(&mut self, name: &str, params: &[&str], body: Vec<Stmt>) -> FunctionDecl {
        FunctionDecl {
            node: self.node(),
            name: name.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            rest: None,
            captures: Vec::new(),
            body,
            exported: true,
        }
    }

    pub fn record_type(&mut self, name: &str, parent: Option<&str>, fields: &[(&str, FieldTy)]) -> TypeDecl {
        TypeDecl {
            node: self.node(),
            name: name.to_string(),
            kind: TypeKind::Record,
            parent: parent.map(str::to_string),
            fields: fields
                .iter()
                .map(|(n, t)| (n.to_string(), t.clone()))
                .collect(),
            methods: Vec::new(),
            exported: true,
        }
    }
}
