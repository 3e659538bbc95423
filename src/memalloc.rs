//! Tile scratchpad allocation
//!
//! Each virtual tile owns a bump pointer starting at address 0. Every
//! tile-memory write gets a contiguous range of its tile's scratchpad;
//! nothing is ever freed (a program DAG is finite and compiled once).
//! Stores and loads additionally get a `SetImmediate` operand carrying
//! the address so the core can issue the access; sends and receives
//! read their address directly at code generation time.

use std::collections::HashMap;

use crate::error::CompileResult;
use crate::graph::{OpId, OpKind};
use crate::model::ModelImpl;
use crate::partitioner::Partitioner;

/// Scratchpad addresses of every tile-memory write
pub struct MemoryAllocator {
    op2mem: HashMap<OpId, usize>,
    vtile_next_address: Vec<usize>,
}

impl MemoryAllocator {
    pub fn run(model: &mut ModelImpl, partitioner: &mut Partitioner) -> CompileResult<Self> {
        let mut allocator = MemoryAllocator {
            op2mem: HashMap::new(),
            vtile_next_address: vec![0; partitioner.n_vtiles()],
        };
        for op in model.graph.ids_snapshot() {
            if !model.graph.op(op).kind.writes_tile_memory() {
                continue;
            }
            let address = allocator.memalloc(partitioner.vtile(op), model.graph.op(op).length);
            allocator.assign(op, address);
            if matches!(model.graph.op(op).kind, OpKind::Store) {
                let seti = model.new_set_immediate(address, 1);
                partitioner.clone_assignment(op, seti);
                model.add_store_address_operand(op, seti);
            }
            let readers: Vec<OpId> = model.graph.op(op).mem_users.iter().copied().collect();
            for read in readers {
                if matches!(model.graph.op(read).kind, OpKind::Load) {
                    let seti = model.new_set_immediate(address, 1);
                    partitioner.clone_assignment(read, seti);
                    model.add_load_address_operand(read, seti);
                }
            }
        }
        Ok(allocator)
    }

    /// Allocate `size` contiguous scratchpad addresses on `vtile`
    pub(crate) fn memalloc(&mut self, vtile: usize, size: usize) -> usize {
        let address = self.vtile_next_address[vtile];
        self.vtile_next_address[vtile] += size;
        address
    }

    pub(crate) fn assign(&mut self, op: OpId, address: usize) {
        assert!(
            self.op2mem.insert(op, address).is_none(),
            "cannot reassign tile memory address of {}",
            op
        );
    }

    pub fn is_assigned(&self, op: OpId) -> bool {
        self.op2mem.contains_key(&op)
    }

    pub fn address(&self, op: OpId) -> usize {
        *self
            .op2mem
            .get(&op)
            .unwrap_or_else(|| panic!("tile memory address not assigned for {}", op))
    }

    pub(crate) fn assignment_label(&self, op: OpId) -> String {
        if self.is_assigned(op) {
            format!("\\ntileMemoryAddress = {}", self.address(op))
        } else {
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GraphPartitioningScheme, Model};
    use crate::partitioner::KahipOracle;
    use crate::tensors::{ConstantMatrix, InputVector, OutputVector, Vector};

    #[test]
    fn test_bump_allocation_and_address_operands() {
        let model = Model::new("memalloc");
        let input = InputVector::new(&model, "in", 5);
        let matrix = ConstantMatrix::new(&model, "m", 5, 5);
        let out = OutputVector::new(&model, "out", 5);
        let y = &matrix * &Vector::from(&input);
        out.assign(&y);
        let inner = model.inner();
        let mut m = inner.borrow_mut();
        let mut partitioner =
            Partitioner::run(&mut m, GraphPartitioningScheme::RowMajor, &KahipOracle).unwrap();
        let allocator = MemoryAllocator::run(&mut m, &mut partitioner).unwrap();

        let mut per_tile: Vec<Vec<(OpId, usize)>> = vec![Vec::new(); partitioner.n_vtiles()];
        for op in m.graph.ids() {
            if m.graph.op(op).kind.writes_tile_memory() {
                per_tile[partitioner.vtile(op)].push((op, allocator.address(op)));
            }
        }
        // Addresses on each tile are a dense bump sequence
        for writes in &per_tile {
            let mut next = 0;
            for &(op, address) in writes {
                assert_eq!(address, next);
                next += m.graph.op(op).length;
            }
        }

        // Loads carry the address of their source as a SetImmediate at
        // operand index 0; stores at operand index 1
        for op in m.graph.ids() {
            match m.graph.op(op).kind {
                OpKind::Load => {
                    let seti = m.graph.op(op).operands[0];
                    let src = m.graph.op(op).mem_srcs[0];
                    match m.graph.op(seti).kind {
                        OpKind::SetImmediate { imm } => {
                            assert_eq!(imm, allocator.address(src))
                        }
                        _ => panic!("load address operand must be a SetImmediate"),
                    }
                }
                OpKind::Store => {
                    assert_eq!(m.graph.op(op).operands.len(), 2);
                    let seti = m.graph.op(op).operands[1];
                    match m.graph.op(seti).kind {
                        OpKind::SetImmediate { imm } => {
                            assert_eq!(imm, allocator.address(op))
                        }
                        _ => panic!("store address operand must be a SetImmediate"),
                    }
                }
                _ => {}
            }
        }
    }
}
