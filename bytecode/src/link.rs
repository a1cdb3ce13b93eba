use crate::{Instruction, LinkError};

/// Outcome of a successful [`link`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkReport {
    pub branches: usize,
    pub redundant: usize,
}

/// Resolve every relative branch offset in `code` into an op index.
///
/// All branches are checked before any is rewritten, so a failed link
/// leaves `code` untouched. A branch that is already linked is an error:
/// linking happens once per op stream.
///
/// Jumps whose offset is `+1` land on the op that follows anyway and are
/// marked redundant, whatever their condition.
pub fn link(code: &mut [Instruction]) -> Result<LinkReport, LinkError> {
    let len = code.len();
    let mut targets = Vec::new();

    for (index, instruction) in code.iter().enumerate() {
        if let Some(branch) = instruction.branch() {
            targets.push(branch.check(index, len)?);
        }
    }

    let mut report = LinkReport::default();
    let mut targets = targets.into_iter();
    for instruction in code.iter_mut() {
        let eliminate = instruction.is_jump();
        let Some(branch) = instruction.branch_mut() else {
            continue;
        };
        let Some(target) = targets.next() else {
            break;
        };
        branch.resolve(target, eliminate);
        report.branches += 1;
        if branch.is_redundant() {
            report.redundant += 1;
        }
    }
    Ok(report)
}
