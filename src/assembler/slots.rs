//! Local slot allocation.
//!
//! Locals are block scoped. A slot freed when its block ends is reused by
//! later declarations, so a function's slot count is the deepest nesting
//! of simultaneously live locals, not the number of declarations.

use crate::error::AssemblyErrorKind;

#[derive(Debug)]
struct Local {
    name: String,
    depth: u32,
    slot: u16,
}

#[derive(Debug, Default)]
pub struct Slots {
    locals: Vec<Local>,
    scope_depth: u32,
    /// Slots released by ended scopes.
    free: Vec<u16>,
    next: u16,
    high_water: u16,
}

impl Slots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_scope(&mut self) {
        self.scope_depth += 1;
    }

    pub fn end_scope(&mut self) {
        self.scope_depth = self.scope_depth.saturating_sub(1);
        while let Some(local) = self.locals.last() {
            if local.depth <= self.scope_depth {
                break;
            }
            self.free.push(local.slot);
            self.locals.pop();
        }
        // Lowest slot first.
        self.free.sort_unstable_by(|a, b| b.cmp(a));
    }

    /// Declare `name` in the current scope and return its slot.
    pub fn declare(&mut self, name: &str) -> Result<u16, AssemblyErrorKind> {
        let duplicate = self
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth == self.scope_depth)
            .any(|local| local.name == name);
        if duplicate {
            return Err(AssemblyErrorKind::DuplicateDefinition(name.to_string()));
        }

        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                let slot = self.next;
                self.next = self
                    .next
                    .checked_add(1)
                    .ok_or(AssemblyErrorKind::LimitExceeded("locals"))?;
                slot
            }
        };
        self.high_water = self.high_water.max(slot + 1);
        self.locals.push(Local {
            name: name.to_string(),
            depth: self.scope_depth,
            slot,
        });
        Ok(slot)
    }

    /// Innermost visible slot for `name`.
    pub fn resolve(&self, name: &str) -> Option<u16> {
        self.locals
            .iter()
            .rev()
            .find(|local| local.name == name)
            .map(|local| local.slot)
    }

    /// Slots the function needs.
    pub fn count(&self) -> u16 {
        self.high_water
    }
}
