//! The assembler: typed IR in, validated object file out.

pub mod compiler;
pub mod emitter;
pub mod ir;
pub mod pools;
pub mod slots;

pub use compiler::{assemble, AssemblyResult};
pub use ir::{
    BinaryOp, Builder, CatchClause, CatchKind, ConstExpr, Expr, ExprKind, FieldTy, FunctionDecl,
    ImportDecl, ModuleIr, NodeId, Stmt, StmtKind, SymbolBindings, SymbolRef, TypeDecl, UnaryOp,
    ValueDecl,
};
