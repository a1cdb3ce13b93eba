use crate::{Arg, BinaryCond, Branch, Instruction, UnaryCond};

/// A forward branch whose offset has not yet been resolved.
///
/// Created by the branching helpers of [`CodeBuilder`]; resolve it with
/// [`CodeBuilder::bind`].
#[derive(Debug)]
#[must_use = "an unbound label leaves its branch pointing at itself"]
pub struct Label {
    /// Position of the branching op.
    index: usize,
}

/// Builds an op stream.
///
/// Offsets are counted in ops, not bytes, so labels can be patched before
/// the stream is serialized with its variable-length operands.
#[derive(Debug, Default)]
pub struct CodeBuilder {
    code: Vec<Instruction>,
    unbound: usize,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index the next emitted op will have.
    pub fn position(&self) -> usize {
        self.code.len()
    }

    pub fn finish(self) -> Vec<Instruction> {
        debug_assert_eq!(self.unbound, 0, "unbound labels");
        self.code
    }

    pub fn emit(&mut self, instruction: Instruction) -> usize {
        self.code.push(instruction);
        self.code.len() - 1
    }

    fn label(&mut self, instruction: Instruction) -> Label {
        self.unbound += 1;
        Label {
            index: self.emit(instruction),
        }
    }

    /// Point `label` at the next emitted op.
    pub fn bind(&mut self, label: Label) {
        let offset = (self.position() - label.index) as i32;
        if let Some(branch) = self.code[label.index].branch_mut() {
            branch.set_offset(offset);
        }
        self.unbound -= 1;
    }

    fn back_offset(&self, target: usize) -> Branch {
        Branch::new(target as i32 - self.position() as i32)
    }

    // ── branches ───────────────────────────────────────────────────

    pub fn jump(&mut self) -> Label {
        self.label(Instruction::Jump {
            branch: Branch::new(0),
        })
    }

    /// Unconditional jump to an already emitted position.
    pub fn jump_to(&mut self, target: usize) {
        let branch = self.back_offset(target);
        self.emit(Instruction::Jump { branch });
    }

    pub fn jump_if(&mut self, cond: UnaryCond, arg: Arg) -> Label {
        self.label(Instruction::JumpUnary {
            cond,
            arg,
            branch: Branch::new(0),
        })
    }

    /// Two-operand jump compared under the type at constant `ty`.
    pub fn jump_cmp(&mut self, cond: BinaryCond, ty: u32, lhs: Arg, rhs: Arg) -> Label {
        self.label(Instruction::JumpBinary {
            cond,
            ty,
            lhs,
            rhs,
            branch: Branch::new(0),
        })
    }

    pub fn jump_cmp_to(&mut self, cond: BinaryCond, ty: u32, lhs: Arg, rhs: Arg, target: usize) {
        let branch = self.back_offset(target);
        self.emit(Instruction::JumpBinary {
            cond,
            ty,
            lhs,
            rhs,
            branch,
        });
    }

    /// Opens a handler scope; bind the label at the handler's first op.
    pub fn guard(&mut self, var: Arg) -> Label {
        self.label(Instruction::GuardStart {
            var,
            branch: Branch::new(0),
        })
    }

    pub fn guard_end(&mut self) {
        self.emit(Instruction::GuardEnd);
    }

    // ── values ─────────────────────────────────────────────────────

    pub fn mov(&mut self, dst: Arg, src: Arg) {
        self.emit(Instruction::Move { dst, src });
    }

    pub fn add(&mut self, dst: Arg, lhs: Arg, rhs: Arg) {
        self.emit(Instruction::Add { dst, lhs, rhs });
    }

    pub fn sub(&mut self, dst: Arg, lhs: Arg, rhs: Arg) {
        self.emit(Instruction::Sub { dst, lhs, rhs });
    }

    pub fn new_object(&mut self, dst: Arg, class: u32, args: &[Arg]) {
        self.emit(Instruction::New {
            dst,
            class,
            args: args.to_vec(),
        });
    }

    pub fn get_field(&mut self, dst: Arg, target: Arg, field: u32) {
        self.emit(Instruction::GetField { dst, target, field });
    }

    pub fn set_field(&mut self, target: Arg, field: u32, value: Arg) {
        self.emit(Instruction::SetField {
            target,
            field,
            value,
        });
    }

    pub fn freeze(&mut self, dst: Arg, src: Arg) {
        self.emit(Instruction::Freeze { dst, src });
    }

    pub fn new_ref(&mut self, dst: Arg, src: Arg) {
        self.emit(Instruction::NewRef { dst, src });
    }

    pub fn new_lazy(&mut self, dst: Arg, method: u32) {
        self.emit(Instruction::NewLazy { dst, method });
    }

    pub fn ref_get(&mut self, dst: Arg, target: Arg) {
        self.emit(Instruction::RefGet { dst, target });
    }

    pub fn ref_set(&mut self, target: Arg, value: Arg) {
        self.emit(Instruction::RefSet { target, value });
    }

    // ── calls ──────────────────────────────────────────────────────

    pub fn call(&mut self, dst: Arg, method: u32, args: &[Arg]) {
        self.emit(Instruction::Call {
            dst,
            method,
            args: args.to_vec(),
        });
    }

    pub fn invoke(&mut self, dst: Arg, target: Arg, name: u32, args: &[Arg]) {
        self.emit(Instruction::Invoke {
            dst,
            target,
            name,
            args: args.to_vec(),
        });
    }

    pub fn invoke_async(&mut self, dst: Arg, target: Arg, name: u32, args: &[Arg]) {
        self.emit(Instruction::InvokeAsync {
            dst,
            target,
            name,
            args: args.to_vec(),
        });
    }

    pub fn super_call(&mut self, dst: Arg, args: &[Arg]) {
        self.emit(Instruction::Super {
            dst,
            args: args.to_vec(),
        });
    }

    pub fn new_service(&mut self, dst: Arg, class: u32, args: &[Arg]) {
        self.emit(Instruction::NewService {
            dst,
            class,
            args: args.to_vec(),
        });
    }

    pub fn throw(&mut self, arg: Arg) {
        self.emit(Instruction::Throw { arg });
    }

    pub fn ret(&mut self, arg: Arg) {
        self.emit(Instruction::Return { arg });
    }

    pub fn ret_void(&mut self) {
        self.emit(Instruction::ReturnVoid);
    }
}
