//! Code buffer for one function: labels, jump fixups, the handler table and
//! operand stack depth tracking.

use crate::error::AssemblyErrorKind;
use crate::object::{Catch, Handler, Instruction};

/// A position in the code, placed at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

#[derive(Debug)]
struct Fixup {
    /// Offset of the 4-byte target operand.
    at: usize,
    label: Label,
}

#[derive(Debug)]
struct PendingHandler {
    start: Label,
    end: Label,
    target: Label,
    catch: Catch,
}

/// The finished code of a function.
#[derive(Debug)]
pub struct EmittedCode {
    pub code: Vec<u8>,
    pub handlers: Vec<Handler>,
    pub max_stack: u32,
}

#[derive(Debug, Default)]
pub struct Emitter {
    code: Vec<u8>,
    labels: Vec<Option<u32>>,
    fixups: Vec<Fixup>,
    handlers: Vec<PendingHandler>,
    depth: u32,
    max_depth: u32,
}

/// Values an instruction pops and pushes. Records and closures also pop
/// their fields; the caller passes those counts to [`Emitter::emit_popping`].
fn stack_effect(instruction: &Instruction) -> (u32, u32) {
    use Instruction::*;
    match *instruction {
        Nop | Jump(_) | Abort => (0, 0),
        Nil | True | False | Const(_) | Int(_) | LoadLocal(_) | LoadCapture(_)
        | LoadImport(_) | LoadStatic(_) | LoadType(_) => (0, 1),
        Pop | StoreLocal(_) | StoreStatic(_) | JumpIfFalse(_) | JumpIfTrue(_) | Return
        | Raise => (1, 0),
        Dup => (1, 2),
        Swap => (2, 2),
        Pick(n) => (u32::from(n) + 1, u32::from(n) + 2),
        Add | Sub | Mul | Div | Rem | Eq | Ne | Lt | Le | Gt | Ge | ListGet | TypeCmp => (2, 1),
        Neg | Not | GetField(_) | ListLen | TypeOf | IsInstance(_) => (1, 1),
        Call { argc, .. } | CallImport { argc, .. } | CallVirtual { argc, .. } => {
            (u32::from(argc), 1)
        }
        CallClosure { argc } => (u32::from(argc) + 1, 1),
        NewRecord(_) | MakeClosure { .. } => (0, 1),
        NewList(n) => (u32::from(n), 1),
        SetField(_) | ListPush => (2, 0),
        ListSet => (3, 0),
    }
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current code offset.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn emit(&mut self, instruction: Instruction) {
        self.emit_popping(instruction, 0);
    }

    /// Emit an instruction that additionally pops `extra` values.
    pub fn emit_popping(&mut self, instruction: Instruction, extra: u32) {
        let (pops, pushes) = stack_effect(&instruction);
        self.depth = self.depth.saturating_sub(pops + extra) + pushes;
        self.max_depth = self.max_depth.max(self.depth);
        instruction.encode(&mut self.code);
    }

    pub fn label(&mut self) -> Label {
        let id = self.labels.len() as u32;
        self.labels.push(None);
        Label(id)
    }

    pub fn place(&mut self, label: Label) {
        if let Some(slot) = self.labels.get_mut(label.0 as usize) {
            *slot = Some(self.code.len() as u32);
        }
    }

    /// A label placed at the current offset.
    pub fn here(&mut self) -> Label {
        let label = self.label();
        self.place(label);
        label
    }

    /// Emit a branch to `label`. `make` builds the instruction from its target.
    pub fn emit_jump(&mut self, make: fn(u32) -> Instruction, label: Label) {
        self.fixups.push(Fixup {
            at: self.code.len() + 1,
            label,
        });
        self.emit(make(u32::MAX));
    }

    /// Code reached from elsewhere with `depth` values on the stack, such as
    /// a handler target entered with the exception.
    pub fn set_depth(&mut self, depth: u32) {
        self.depth = depth;
        self.max_depth = self.max_depth.max(depth);
    }

    pub fn add_handler(&mut self, start: Label, end: Label, target: Label, catch: Catch) {
        self.handlers.push(PendingHandler {
            start,
            end,
            target,
            catch,
        });
    }

    fn resolve(&self, label: Label) -> Result<u32, AssemblyErrorKind> {
        self.labels
            .get(label.0 as usize)
            .copied()
            .flatten()
            .ok_or(AssemblyErrorKind::UnresolvedLabel)
    }

    /// Patch every jump and resolve the handler table.
    pub fn finish(mut self) -> Result<EmittedCode, AssemblyErrorKind> {
        if u32::try_from(self.code.len()).is_err() {
            return Err(AssemblyErrorKind::LimitExceeded("code bytes"));
        }
        for fixup in &self.fixups {
            let target = self.resolve(fixup.label)?;
            self.code[fixup.at..fixup.at + 4].copy_from_slice(&target.to_le_bytes());
        }
        let handlers = self
            .handlers
            .iter()
            .map(|h| {
                Ok(Handler {
                    start: self.resolve(h.start)?,
                    end: self.resolve(h.end)?,
                    target: self.resolve(h.target)?,
                    catch: h.catch,
                })
            })
            .collect::<Result<Vec<_>, AssemblyErrorKind>>()?;
        Ok(EmittedCode {
            code: self.code,
            handlers,
            max_stack: self.max_depth,
        })
    }
}
