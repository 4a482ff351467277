//! Instruction set of the Vellum stack machine.
//!
//! Each instruction is one opcode byte followed by fixed-width little-endian
//! operands. [`Instruction`] is the decoded form shared by the codec's
//! validator, the disassembler, the assembler and the interpreter.

/// Opcodes for the stack machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    // ============ Constants & Stack ============
    /// No operation
    Nop = 0,
    /// Push nil
    Nil,
    /// Push true
    True,
    /// Push false
    False,
    /// Push a constant: CONST <index:u32>
    Const,
    /// Push an inline integer: INT <value:i64>
    Int,
    /// Discard the top value
    Pop,
    /// Duplicate the top value
    Dup,
    /// Swap the two top values
    Swap,
    /// Copy the value `n` below the top: PICK <n:u16>
    Pick,

    // ============ Variables ============
    /// Push a local slot: LOAD_LOCAL <slot:u16>
    LoadLocal,
    /// Pop into a local slot: STORE_LOCAL <slot:u16>
    StoreLocal,
    /// Push a capture of the running closure: LOAD_CAPTURE <index:u16>
    LoadCapture,
    /// Push an imported value: LOAD_IMPORT <import:u32>
    LoadImport,
    /// Push a module static: LOAD_STATIC <index:u16>
    LoadStatic,
    /// Pop into a module static: STORE_STATIC <index:u16>
    StoreStatic,

    // ============ Arithmetic ============
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,

    // ============ Comparison & Logic ============
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Not,

    // ============ Control Flow ============
    /// Unconditional jump: JUMP <target:u32>
    Jump,
    /// Pop a bool and jump if false: JUMP_IF_FALSE <target:u32>
    JumpIfFalse,
    /// Pop a bool and jump if true: JUMP_IF_TRUE <target:u32>
    JumpIfTrue,

    // ============ Calls ============
    /// Call a local function: CALL <function:u32> <argc:u8>
    Call,
    /// Call an imported function: CALL_IMPORT <import:u32> <argc:u8>
    CallImport,
    /// Call the closure below the arguments: CALL_CLOSURE <argc:u8>
    CallClosure,
    /// Call a method of the first argument's type: CALL_VIRTUAL <name:u32> <argc:u8>
    CallVirtual,
    /// Return the top value to the caller
    Return,

    // ============ Heap ============
    /// Build a record from its fields: NEW_RECORD <type:u32>
    NewRecord,
    /// Replace a record with one of its fields: GET_FIELD <index:u16>
    GetField,
    /// Pop a value and a record and store the field: SET_FIELD <index:u16>
    SetField,
    /// Build a closure from its captures: MAKE_CLOSURE <function:u32> <type:u32>
    MakeClosure,
    /// Build a list from the top `n` values: NEW_LIST <n:u16>
    NewList,
    ListGet,
    ListSet,
    ListLen,
    ListPush,

    // ============ Types ============
    /// Push a type as a value: LOAD_TYPE <type:u32>
    LoadType,
    /// Replace a value with whether its type descends from a type: IS_INSTANCE <type:u32>
    IsInstance,
    /// Compare two type values: -1 if the first strictly extends the second,
    /// 0 if equal, 1 otherwise
    TypeCmp,

    // ============ Exceptions & Services ============
    /// Raise the top value as an exception
    Raise,
    /// Replace the top value with the name of its type
    TypeOf,
    /// Terminate the call stack
    Abort,
}

impl OpCode {
    /// Get the number of operand bytes for this opcode.
    pub fn operand_size(self) -> usize {
        match self {
            OpCode::CallClosure => 1,

            OpCode::Pick
            | OpCode::LoadLocal
            | OpCode::StoreLocal
            | OpCode::LoadCapture
            | OpCode::LoadStatic
            | OpCode::StoreStatic
            | OpCode::GetField
            | OpCode::SetField
            | OpCode::NewList => 2,

            OpCode::Const
            | OpCode::LoadImport
            | OpCode::Jump
            | OpCode::JumpIfFalse
            | OpCode::JumpIfTrue
            | OpCode::NewRecord
            | OpCode::LoadType
            | OpCode::IsInstance => 4,

            // 4 byte index + 1 byte argument count
            OpCode::Call | OpCode::CallImport | OpCode::CallVirtual => 5,

            OpCode::Int | OpCode::MakeClosure => 8,

            _ => 0,
        }
    }

    /// Convert from u8 to OpCode.
    pub fn from_u8(byte: u8) -> Option<OpCode> {
        use OpCode::*;
        const TABLE: [OpCode; 52] = [
            Nop, Nil, True, False, Const, Int, Pop, Dup, Swap, Pick, LoadLocal, StoreLocal,
            LoadCapture, LoadImport, LoadStatic, StoreStatic, Add, Sub, Mul, Div, Rem, Neg, Eq,
            Ne, Lt, Le, Gt, Ge, Not, Jump, JumpIfFalse, JumpIfTrue, Call, CallImport, CallClosure,
            CallVirtual, Return, NewRecord, GetField, SetField, MakeClosure, NewList, ListGet,
            ListSet, ListLen, ListPush, LoadType, IsInstance, TypeCmp, Raise, TypeOf, Abort,
        ];
        TABLE.get(byte as usize).copied()
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        op as u8
    }
}

/// A decoded instruction with its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    Nil,
    True,
    False,
    Const(u32),
    Int(i64),
    Pop,
    Dup,
    Swap,
    Pick(u16),
    LoadLocal(u16),
    StoreLocal(u16),
    LoadCapture(u16),
    LoadImport(u32),
    LoadStatic(u16),
    StoreStatic(u16),
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Not,
    Jump(u32),
    JumpIfFalse(u32),
    JumpIfTrue(u32),
    Call { function: u32, argc: u8 },
    CallImport { import: u32, argc: u8 },
    CallClosure { argc: u8 },
    /// `name` is a string of the calling object; the receiver is the first argument.
    CallVirtual { name: u32, argc: u8 },
    Return,
    NewRecord(u32),
    GetField(u16),
    SetField(u16),
    MakeClosure { function: u32, ty: u32 },
    NewList(u16),
    ListGet,
    ListSet,
    ListLen,
    ListPush,
    /// Operands name a [`TypeRef`](super::TypeRef) packed by `TypeRef::to_operand`.
    LoadType(u32),
    IsInstance(u32),
    TypeCmp,
    Raise,
    TypeOf,
    Abort,
}

/// Why an instruction could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionError {
    UnknownOpcode(u8),
    Truncated,
}

fn operand<const N: usize>(code: &[u8], at: usize) -> Result<[u8; N], InstructionError> {
    let end = at.checked_add(N).ok_or(InstructionError::Truncated)?;
    let bytes = code.get(at..end).ok_or(InstructionError::Truncated)?;
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

impl Instruction {
    pub fn opcode(&self) -> OpCode {
        match self {
            Instruction::Nop => OpCode::Nop,
            Instruction::Nil => OpCode::Nil,
            Instruction::True => OpCode::True,
            Instruction::False => OpCode::False,
            Instruction::Const(_) => OpCode::Const,
            Instruction::Int(_) => OpCode::Int,
            Instruction::Pop => OpCode::Pop,
            Instruction::Dup => OpCode::Dup,
            Instruction::Swap => OpCode::Swap,
            Instruction::Pick(_) => OpCode::Pick,
            Instruction::LoadLocal(_) => OpCode::LoadLocal,
            Instruction::StoreLocal(_) => OpCode::StoreLocal,
            Instruction::LoadCapture(_) => OpCode::LoadCapture,
            Instruction::LoadImport(_) => OpCode::LoadImport,
            Instruction::LoadStatic(_) => OpCode::LoadStatic,
            Instruction::StoreStatic(_) => OpCode::StoreStatic,
            Instruction::Add => OpCode::Add,
            Instruction::Sub => OpCode::Sub,
            Instruction::Mul => OpCode::Mul,
            Instruction::Div => OpCode::Div,
            Instruction::Rem => OpCode::Rem,
            Instruction::Neg => OpCode::Neg,
            Instruction::Eq => OpCode::Eq,
            Instruction::Ne => OpCode::Ne,
            Instruction::Lt => OpCode::Lt,
            Instruction::Le => OpCode::Le,
            Instruction::Gt => OpCode::Gt,
            Instruction::Ge => OpCode::Ge,
            Instruction::Not => OpCode::Not,
            Instruction::Jump(_) => OpCode::Jump,
            Instruction::JumpIfFalse(_) => OpCode::JumpIfFalse,
            Instruction::JumpIfTrue(_) => OpCode::JumpIfTrue,
            Instruction::Call { .. } => OpCode::Call,
            Instruction::CallImport { .. } => OpCode::CallImport,
            Instruction::CallClosure { .. } => OpCode::CallClosure,
            Instruction::CallVirtual { .. } => OpCode::CallVirtual,
            Instruction::Return => OpCode::Return,
            Instruction::NewRecord(_) => OpCode::NewRecord,
            Instruction::GetField(_) => OpCode::GetField,
            Instruction::SetField(_) => OpCode::SetField,
            Instruction::MakeClosure { .. } => OpCode::MakeClosure,
            Instruction::NewList(_) => OpCode::NewList,
            Instruction::ListGet => OpCode::ListGet,
            Instruction::ListSet => OpCode::ListSet,
            Instruction::ListLen => OpCode::ListLen,
            Instruction::ListPush => OpCode::ListPush,
            Instruction::LoadType(_) => OpCode::LoadType,
            Instruction::IsInstance(_) => OpCode::IsInstance,
            Instruction::TypeCmp => OpCode::TypeCmp,
            Instruction::Raise => OpCode::Raise,
            Instruction::TypeOf => OpCode::TypeOf,
            Instruction::Abort => OpCode::Abort,
        }
    }

    /// Encoded size in bytes, opcode included.
    pub fn size(&self) -> usize {
        1 + self.opcode().operand_size()
    }

    /// Append the encoded instruction to `code`.
    pub fn encode(&self, code: &mut Vec<u8>) {
        code.push(self.opcode().into());
        match *self {
            Instruction::Const(v)
            | Instruction::LoadImport(v)
            | Instruction::Jump(v)
            | Instruction::JumpIfFalse(v)
            | Instruction::JumpIfTrue(v)
            | Instruction::NewRecord(v)
            | Instruction::LoadType(v)
            | Instruction::IsInstance(v) => code.extend_from_slice(&v.to_le_bytes()),
            Instruction::Int(v) => code.extend_from_slice(&v.to_le_bytes()),
            Instruction::Pick(v)
            | Instruction::LoadLocal(v)
            | Instruction::StoreLocal(v)
            | Instruction::LoadCapture(v)
            | Instruction::LoadStatic(v)
            | Instruction::StoreStatic(v)
            | Instruction::GetField(v)
            | Instruction::SetField(v)
            | Instruction::NewList(v) => code.extend_from_slice(&v.to_le_bytes()),
            Instruction::Call { function: index, argc }
            | Instruction::CallImport {
                import: index,
                argc,
            }
            | Instruction::CallVirtual { name: index, argc } => {
                code.extend_from_slice(&index.to_le_bytes());
                code.push(argc);
            }
            Instruction::CallClosure { argc } => code.push(argc),
            Instruction::MakeClosure { function, ty } => {
                code.extend_from_slice(&function.to_le_bytes());
                code.extend_from_slice(&ty.to_le_bytes());
            }
            _ => {}
        }
    }

    /// Decode the instruction at `offset`, returning it with the offset of the next one.
    pub fn decode(code: &[u8], offset: usize) -> Result<(Instruction, usize), InstructionError> {
        let byte = *code.get(offset).ok_or(InstructionError::Truncated)?;
        let op = OpCode::from_u8(byte).ok_or(InstructionError::UnknownOpcode(byte))?;
        let at = offset + 1;
        let u16_at = |at: usize| operand::<2>(code, at).map(u16::from_le_bytes);
        let u32_at = |at: usize| operand::<4>(code, at).map(u32::from_le_bytes);

        let instruction = match op {
            OpCode::Nop => Instruction::Nop,
            OpCode::Nil => Instruction::Nil,
            OpCode::True => Instruction::True,
            OpCode::False => Instruction::False,
            OpCode::Const => Instruction::Const(u32_at(at)?),
            OpCode::Int => Instruction::Int(i64::from_le_bytes(operand::<8>(code, at)?)),
            OpCode::Pop => Instruction::Pop,
            OpCode::Dup => Instruction::Dup,
            OpCode::Swap => Instruction::Swap,
            OpCode::Pick => Instruction::Pick(u16_at(at)?),
            OpCode::LoadLocal => Instruction::LoadLocal(u16_at(at)?),
            OpCode::StoreLocal => Instruction::StoreLocal(u16_at(at)?),
            OpCode::LoadCapture => Instruction::LoadCapture(u16_at(at)?),
            OpCode::LoadImport => Instruction::LoadImport(u32_at(at)?),
            OpCode::LoadStatic => Instruction::LoadStatic(u16_at(at)?),
            OpCode::StoreStatic => Instruction::StoreStatic(u16_at(at)?),
            OpCode::Add => Instruction::Add,
            OpCode::Sub => Instruction::Sub,
            OpCode::Mul => Instruction::Mul,
            OpCode::Div => Instruction::Div,
            OpCode::Rem => Instruction::Rem,
            OpCode::Neg => Instruction::Neg,
            OpCode::Eq => Instruction::Eq,
            OpCode::Ne => Instruction::Ne,
            OpCode::Lt => Instruction::Lt,
            OpCode::Le => Instruction::Le,
            OpCode::Gt => Instruction::Gt,
            OpCode::Ge => Instruction::Ge,
            OpCode::Not => Instruction::Not,
            OpCode::Jump => Instruction::Jump(u32_at(at)?),
            OpCode::JumpIfFalse => Instruction::JumpIfFalse(u32_at(at)?),
            OpCode::JumpIfTrue => Instruction::JumpIfTrue(u32_at(at)?),
            OpCode::Call => Instruction::Call {
                function: u32_at(at)?,
                argc: operand::<1>(code, at + 4)?[0],
            },
            OpCode::CallImport => Instruction::CallImport {
                import: u32_at(at)?,
                argc: operand::<1>(code, at + 4)?[0],
            },
            OpCode::CallClosure => Instruction::CallClosure {
                argc: operand::<1>(code, at)?[0],
            },
            OpCode::CallVirtual => Instruction::CallVirtual {
                name: u32_at(at)?,
                argc: operand::<1>(code, at + 4)?[0],
            },
            OpCode::Return => Instruction::Return,
            OpCode::NewRecord => Instruction::NewRecord(u32_at(at)?),
            OpCode::GetField => Instruction::GetField(u16_at(at)?),
            OpCode::SetField => Instruction::SetField(u16_at(at)?),
            OpCode::MakeClosure => Instruction::MakeClosure {
                function: u32_at(at)?,
                ty: u32_at(at + 4)?,
            },
            OpCode::NewList => Instruction::NewList(u16_at(at)?),
            OpCode::ListGet => Instruction::ListGet,
            OpCode::ListSet => Instruction::ListSet,
            OpCode::ListLen => Instruction::ListLen,
            OpCode::ListPush => Instruction::ListPush,
            OpCode::LoadType => Instruction::LoadType(u32_at(at)?),
            OpCode::IsInstance => Instruction::IsInstance(u32_at(at)?),
            OpCode::TypeCmp => Instruction::TypeCmp,
            OpCode::Raise => Instruction::Raise,
            OpCode::TypeOf => Instruction::TypeOf,
            OpCode::Abort => Instruction::Abort,
        };
        Ok((instruction, at + op.operand_size()))
    }

    /// Jump target, if this is a branch.
    pub fn jump_target(&self) -> Option<u32> {
        match *self {
            Instruction::Jump(t) | Instruction::JumpIfFalse(t) | Instruction::JumpIfTrue(t) => {
                Some(t)
            }
            _ => None,
        }
    }

    /// True when control never falls through to the next instruction.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Jump(_) | Instruction::Return | Instruction::Raise | Instruction::Abort
        )
    }
}

/// Iterate over `(offset, instruction)` pairs of a code section.
pub fn instructions(code: &[u8]) -> Instructions<'_> {
    Instructions { code, offset: 0 }
}

pub struct Instructions<'a> {
    code: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<(usize, Instruction), (usize, InstructionError)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.code.len() {
            return None;
        }
        let at = self.offset;
        match Instruction::decode(self.code, at) {
            Ok((instruction, next)) => {
                self.offset = next;
                Some(Ok((at, instruction)))
            }
            Err(e) => {
                self.offset = self.code.len();
                Some(Err((at, e)))
            }
        }
    }
}
