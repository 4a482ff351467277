//! Call frames and the value arena they live in.
//!
//! A call stack is one growable `Vec<Value>` holding every frame's locals
//! followed by its operand stack, plus a `Vec` of frame records indexing
//! into it. Nothing is boxed per call.

use crate::error::Trap;
use crate::heap::{Handle, Value};
use crate::link::FunctionKey;

/// One activation.
#[derive(Debug, Clone, PartialEq)]
pub struct CallFrame {
    pub function: FunctionKey,
    /// The closure being executed, for capture loads.
    pub closure: Option<Handle>,
    /// First local slot in the value arena.
    pub base: usize,
    /// First operand slot: `base + locals`.
    pub operands: usize,
    /// Offset of the next instruction.
    pub ip: usize,
    /// Offset of the instruction being executed. In callers this is the
    /// pending call, which is where handler ranges are matched.
    pub site: usize,
}

impl CallFrame {
    pub fn locals(&self) -> usize {
        self.operands - self.base
    }
}

#[derive(Debug, Default)]
pub struct CallStack {
    values: Vec<Value>,
    frames: Vec<CallFrame>,
    max_values: usize,
    max_frames: usize,
}

fn underflow() -> Trap {
    Trap::corrupted("operand stack underflow")
}

impl CallStack {
    pub fn new(max_frames: usize, max_values: usize) -> Self {
        Self {
            values: Vec::with_capacity(256.min(max_values)),
            frames: Vec::with_capacity(16.min(max_frames)),
            max_values,
            max_frames,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }

    pub fn frame(&self) -> Result<&CallFrame, Trap> {
        self.frames
            .last()
            .ok_or_else(|| Trap::corrupted("no active frame"))
    }

    pub fn frame_mut(&mut self) -> Result<&mut CallFrame, Trap> {
        self.frames
            .last_mut()
            .ok_or_else(|| Trap::corrupted("no active frame"))
    }

    /// Push a frame whose `arity` arguments are already on top of the stack.
    /// The remaining locals start out nil.
    pub fn push_frame(
        &mut self,
        function: FunctionKey,
        closure: Option<Handle>,
        arity: usize,
        locals: usize,
        max_stack: usize,
    ) -> Result<(), Trap> {
        if self.frames.len() >= self.max_frames {
            return Err(Trap::StackOverflow);
        }
        let base = self
            .values
            .len()
            .checked_sub(arity)
            .filter(|base| *base >= self.floor())
            .ok_or_else(underflow)?;
        let operands = base + locals;
        if operands.saturating_add(max_stack) > self.max_values {
            return Err(Trap::StackOverflow);
        }
        self.values.resize(operands, Value::Nil);
        self.frames.push(CallFrame {
            function,
            closure,
            base,
            operands,
            ip: 0,
            site: 0,
        });
        Ok(())
    }

    /// Pop the active frame and discard its values.
    pub fn pop_frame(&mut self) -> Option<CallFrame> {
        let frame = self.frames.pop()?;
        self.values.truncate(frame.base);
        Some(frame)
    }

    /// Lowest value the active frame may pop.
    fn floor(&self) -> usize {
        self.frames.last().map_or(0, |f| f.operands)
    }

    pub fn push(&mut self, value: Value) -> Result<(), Trap> {
        if self.values.len() >= self.max_values {
            return Err(Trap::StackOverflow);
        }
        self.values.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Value, Trap> {
        if self.values.len() <= self.floor() {
            return Err(underflow());
        }
        self.values.pop().ok_or_else(underflow)
    }

    /// Pop `n` values, returned in push order.
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, Trap> {
        let start = self
            .values
            .len()
            .checked_sub(n)
            .filter(|start| *start >= self.floor())
            .ok_or_else(underflow)?;
        Ok(self.values.split_off(start))
    }

    pub fn peek(&self, distance: usize) -> Result<Value, Trap> {
        let index = self
            .values
            .len()
            .checked_sub(1 + distance)
            .filter(|index| *index >= self.floor())
            .ok_or_else(underflow)?;
        Ok(self.values[index])
    }

    /// Remove the value `distance` below the top, shifting the rest down.
    pub fn remove(&mut self, distance: usize) -> Result<Value, Trap> {
        let index = self
            .values
            .len()
            .checked_sub(1 + distance)
            .filter(|index| *index >= self.floor())
            .ok_or_else(underflow)?;
        Ok(self.values.remove(index))
    }

    fn slot_index(&self, slot: u16) -> Result<usize, Trap> {
        let frame = self.frame()?;
        let index = frame.base + slot as usize;
        if index >= frame.operands {
            return Err(Trap::corrupted(format!(
                "local slot {} out of range ({} locals)",
                slot,
                frame.locals()
            )));
        }
        Ok(index)
    }

    pub fn local(&self, slot: u16) -> Result<Value, Trap> {
        Ok(self.values[self.slot_index(slot)?])
    }

    pub fn set_local(&mut self, slot: u16, value: Value) -> Result<(), Trap> {
        let index = self.slot_index(slot)?;
        self.values[index] = value;
        Ok(())
    }

    /// Drop the active frame's operands, keeping its locals.
    pub fn clear_operands(&mut self) -> Result<(), Trap> {
        let operands = self.frame()?.operands;
        self.values.truncate(operands);
        Ok(())
    }

    /// Every value reachable from this stack: slots, operands and closures.
    pub fn roots(&self) -> Vec<Value> {
        let mut roots = self.values.clone();
        roots.extend(self.frames.iter().filter_map(|f| f.closure.map(Value::Ref)));
        roots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAIN: FunctionKey = FunctionKey {
        object: 0,
        function: 0,
    };

    #[test]
    fn test_frames_share_one_arena() {
        let mut stack = CallStack::new(8, 64);
        stack.push_frame(MAIN, None, 0, 2, 4).unwrap();
        stack.push(Value::Int(1)).unwrap();
        stack.push(Value::Int(2)).unwrap();
        // Callee takes both operands as its arguments.
        stack.push_frame(MAIN, None, 2, 3, 4).unwrap();
        assert_eq!(stack.frame().unwrap().base, 2);
        assert_eq!(stack.local(1).unwrap(), Value::Int(2));
        assert_eq!(stack.local(2).unwrap(), Value::Nil);
        assert!(stack.local(3).is_err());

        stack.pop_frame();
        assert_eq!(stack.depth(), 1);
        assert!(stack.pop().is_err());
    }

    #[test]
    fn test_pop_never_crosses_frame() {
        let mut stack = CallStack::new(8, 64);
        stack.push_frame(MAIN, None, 0, 1, 2).unwrap();
        assert_eq!(stack.pop(), Err(Trap::corrupted("operand stack underflow")));
        assert!(stack.pop_n(1).is_err());
        assert!(stack.peek(0).is_err());
    }

    #[test]
    fn test_limits() {
        let mut stack = CallStack::new(2, 64);
        stack.push_frame(MAIN, None, 0, 0, 1).unwrap();
        stack.push_frame(MAIN, None, 0, 0, 1).unwrap();
        assert_eq!(
            stack.push_frame(MAIN, None, 0, 0, 1),
            Err(Trap::StackOverflow)
        );

        let mut small = CallStack::new(8, 4);
        assert_eq!(
            small.push_frame(MAIN, None, 0, 2, 3),
            Err(Trap::StackOverflow)
        );
    }

    #[test]
    fn test_remove_and_pick() {
        let mut stack = CallStack::new(8, 64);
        stack.push_frame(MAIN, None, 0, 0, 4).unwrap();
        for n in 1..=3 {
            stack.push(Value::Int(n)).unwrap();
        }
        assert_eq!(stack.peek(2).unwrap(), Value::Int(1));
        assert_eq!(stack.remove(2).unwrap(), Value::Int(1));
        assert_eq!(stack.pop_n(2).unwrap(), vec![Value::Int(2), Value::Int(3)]);
    }
}
