//! Pattern rewrites over the operator list.
//!
//! Two rules run to a fixed point: a pair of mutually inverse transposes
//! collapses to nothing, and a transpose that only swaps the two trailing
//! axes folds into the transpose flag of the MatMul consuming it. After
//! every applied rewrite the scan restarts from the beginning, so no
//! iteration state survives a mutation of the operator list.

use crate::ops::{OpId, OpKind};

use super::Graph;

/// `second` undoes `first`: `second[first[i]] == i` for every axis.
///
/// This is the exact inverse test; merely applying the same permutation
/// twice is weaker and misses pairs like `[2, 0, 1]` / `[1, 2, 0]`.
fn is_inverse_perm(first: &[usize], second: &[usize]) -> bool {
    first.len() == second.len()
        && first
            .iter()
            .enumerate()
            .all(|(axis, &mapped)| second[mapped] == axis)
}

/// The permutation swaps the last two axes and fixes every other axis.
///
/// Only this exact form can fold into a MatMul flag; any other permutation
/// disturbs the batch axes.
fn swaps_last_two_only(perm: &[usize]) -> bool {
    let rank = perm.len();
    if rank < 2 {
        return false;
    }
    perm[rank - 1] == rank - 2
        && perm[rank - 2] == rank - 1
        && perm[..rank - 2]
            .iter()
            .enumerate()
            .all(|(axis, &mapped)| mapped == axis)
}

impl Graph {
    /// Applies the rewrite rules until none fires.
    ///
    /// Rewrites never fail; a rule that does not match is simply not
    /// fired.
    pub fn optimize(&mut self) {
        while self.rewrite_once() {}
    }

    /// Scans the operator list and applies the first matching rule.
    fn rewrite_once(&mut self) -> bool {
        for index in 0..self.ops.len() {
            let id = self.ops[index].id();
            if self.try_eliminate_inverse_transpose(id) {
                return true;
            }
            if self.try_absorb_transpose_into_matmul(id) {
                return true;
            }
        }
        false
    }

    /// Removes a `Transpose -> Transpose` chain whose permutations are
    /// inverse, rewiring every consumer of the second transpose onto the
    /// chain's original input.
    ///
    /// Requires the intermediate tensor to have exactly one consumer; a
    /// shared intermediate must survive for its other consumers.
    fn try_eliminate_inverse_transpose(&mut self, second: OpId) -> bool {
        let second_perm = match self.op(second).kind() {
            OpKind::Transpose { perm } => perm.clone(),
            _ => return false,
        };
        let Some(&mid) = self.op(second).inputs().first() else {
            return false;
        };
        let Some(first) = self.tensor(mid).source() else {
            return false;
        };
        let first_perm = match self.op(first).kind() {
            OpKind::Transpose { perm } => perm.clone(),
            _ => return false,
        };
        if !is_inverse_perm(&first_perm, &second_perm) {
            return false;
        }
        if self.tensor(mid).targets().len() != 1 {
            return false;
        }

        let (Some(&base), Some(&out)) = (
            self.op(first).inputs().first(),
            self.op(second).outputs().first(),
        ) else {
            return false;
        };
        let base_source = self.tensor(base).source();

        if let Some(source) = base_source {
            self.op_mut(source).remove_successor(first);
        }
        let consumers = self.tensor(out).targets().to_vec();
        for consumer in consumers {
            self.op_mut(consumer).replace_input(out, base);
            self.tensor_mut(base).add_target(consumer);
            self.tensor_mut(out).remove_target(consumer);
            self.op_mut(consumer).remove_predecessor(second);
            if let Some(source) = base_source {
                self.op_mut(consumer).add_predecessor(source);
                self.op_mut(source).add_successor(consumer);
            }
        }
        self.tensor_mut(base).remove_target(first);

        self.remove_tensor(mid);
        self.remove_tensor(out);
        self.remove_op(first);
        self.remove_op(second);
        self.sorted = false;
        tracing::debug!(perm = ?first_perm, "eliminated inverse transpose pair");
        true
    }

    /// Folds a trailing-axis transpose feeding a MatMul operand into the
    /// corresponding transpose flag.
    ///
    /// At most one operand is rewritten per invocation; the fixed-point
    /// loop picks up the other side on a later pass.
    fn try_absorb_transpose_into_matmul(&mut self, matmul: OpId) -> bool {
        if !matches!(self.op(matmul).kind(), OpKind::MatMul { .. })
            || self.op(matmul).num_inputs() != 2
        {
            return false;
        }
        for slot in 0..2 {
            let operand = self.op(matmul).inputs()[slot];
            let Some(transpose) = self.tensor(operand).source() else {
                continue;
            };
            let perm = match self.op(transpose).kind() {
                OpKind::Transpose { perm } => perm.clone(),
                _ => continue,
            };
            if !swaps_last_two_only(&perm) {
                continue;
            }
            if self.tensor(operand).targets().len() != 1 {
                continue;
            }
            let Some(&base) = self.op(transpose).inputs().first() else {
                continue;
            };
            let base_source = self.tensor(base).source();

            match self.op_mut(matmul).kind_mut() {
                OpKind::MatMul { trans_a, trans_b } => {
                    if slot == 0 {
                        *trans_a = !*trans_a;
                    } else {
                        *trans_b = !*trans_b;
                    }
                }
                _ => unreachable!("kind checked above"),
            }

            self.op_mut(matmul).replace_input(operand, base);
            self.tensor_mut(base).add_target(matmul);
            self.tensor_mut(base).remove_target(transpose);
            self.tensor_mut(operand).remove_target(matmul);

            if let Some(source) = base_source {
                self.op_mut(source).remove_successor(transpose);
            }
            self.op_mut(matmul).remove_predecessor(transpose);
            if let Some(source) = base_source {
                self.op_mut(source).add_successor(matmul);
                self.op_mut(matmul).add_predecessor(source);
            }

            self.remove_tensor(operand);
            self.remove_op(transpose);
            self.sorted = false;
            tracing::debug!(slot, "absorbed trailing-axis transpose into matmul");
            return true;
        }
        false
    }
}
