//! Linearization of the DAG into per-core and per-tile instruction lists
//!
//! A reverse-postorder walk from every sink (read-outputs, and
//! outer-product updates, which write matrices instead of registers)
//! places each operation after all of its predecessors, depth first to
//! keep live ranges short. Matrix operations get special packing:
//! their operand subgraphs are visited first without emitting the
//! operands, then each operand is emitted immediately before the
//! matrix operation and the matrix operation's consumers immediately
//! after it. This guarantees that live ranges of values in the same
//! reserved input or output register window never overlap. When an
//! operand or consumer cannot be placed at its packed position, a
//! fresh copy takes its place and the readers are rewired.

use std::collections::HashSet;

use crate::coalescer::Coalescer;
use crate::error::{CompileError, CompileResult};
use crate::graph::{OpId, OpKind, TrainingOpType};
use crate::hardware::N_CORES_PER_TILE;
use crate::model::ModelImpl;
use crate::partitioner::Partitioner;
use crate::placer::Placer;

/// Ordered instruction lists for every physical core and tile
pub struct Linearizer {
    core_lists: Vec<Vec<OpId>>,
    tile_lists: Vec<Vec<OpId>>,
}

impl Linearizer {
    pub fn run(
        model: &mut ModelImpl,
        partitioner: &mut Partitioner,
        placer: &Placer,
        coalescer: Option<&Coalescer>,
    ) -> CompileResult<Self> {
        let mut linearizer = Linearizer {
            core_lists: vec![Vec::new(); placer.n_pcores()],
            tile_lists: vec![Vec::new(); placer.n_ptiles()],
        };
        let mut visited: HashSet<OpId> = HashSet::new();
        let mut added_early: HashSet<OpId> = HashSet::new();
        for op in model.graph.ids_snapshot() {
            let is_sink = match model.graph.op(op).kind {
                OpKind::ReadOutput { .. } => true,
                OpKind::Training { op_type, .. } => op_type == TrainingOpType::OuterProduct,
                _ => false,
            };
            if is_sink {
                linearizer.linearize_with_predecessors(
                    model,
                    partitioner,
                    placer,
                    coalescer,
                    op,
                    &mut visited,
                    &mut added_early,
                    true,
                )?;
            }
        }
        Ok(linearizer)
    }

    pub fn core_list(&self, ptile: usize, pcore: usize) -> &[OpId] {
        &self.core_lists[ptile * N_CORES_PER_TILE + pcore]
    }

    pub fn tile_list(&self, ptile: usize) -> &[OpId] {
        &self.tile_lists[ptile]
    }

    pub(crate) fn core_list_mut(&mut self, ptile: usize, pcore: usize) -> &mut Vec<OpId> {
        &mut self.core_lists[ptile * N_CORES_PER_TILE + pcore]
    }

    #[allow(clippy::too_many_arguments)]
    fn linearize_with_predecessors(
        &mut self,
        model: &mut ModelImpl,
        partitioner: &mut Partitioner,
        placer: &Placer,
        coalescer: Option<&Coalescer>,
        op: OpId,
        visited: &mut HashSet<OpId>,
        added_early: &mut HashSet<OpId>,
        add_self: bool,
    ) -> CompileResult<()> {
        if visited.contains(&op) {
            return Ok(());
        }
        if model.graph.op(op).kind.is_matrix_op() {
            if !add_self {
                // Only operands of matrix operations are visited with
                // add_self unset, and matrix operations never feed
                // other matrix operations directly
                return Err(CompileError::linearization(format!(
                    "matrix operation {} feeds another matrix operation",
                    op
                )));
            }
            let members: Vec<OpId> = match coalescer.and_then(|c| c.set_of(op)) {
                Some(set) => set.members().collect(),
                None => vec![op],
            };
            // Visit every member's operand subgraph without emitting
            // the operands themselves
            for &member in &members {
                for o in 0..model.graph.op(member).operands.len() {
                    let operand = model.graph.op(member).operands[o];
                    self.linearize_with_predecessors(
                        model,
                        partitioner,
                        placer,
                        coalescer,
                        operand,
                        visited,
                        added_early,
                        false,
                    )?;
                }
            }
            // Emit the operands immediately before their consumers
            for &member in &members {
                for o in 0..model.graph.op(member).operands.len() {
                    let mut operand = model.graph.op(member).operands[o];
                    if added_early.contains(&operand) {
                        // The operand was already emitted next to a
                        // prior matrix operation; a fresh copy restores
                        // the packed position
                        let copy = model.new_copy(operand);
                        partitioner.clone_assignment(operand, copy);
                        model.graph.replace_operand(member, operand, copy);
                        operand = copy;
                    }
                    self.add_to_list(model, partitioner, placer, operand, visited)?;
                }
            }
            for &member in &members {
                self.add_to_list(model, partitioner, placer, member, visited)?;
            }
            // Consume the outputs immediately after they are produced
            for &member in &members {
                self.add_consumers_to_list(
                    model,
                    partitioner,
                    placer,
                    member,
                    visited,
                    added_early,
                )?;
            }
            return Ok(());
        }

        if model.graph.op(op).kind.is_consumer() {
            for o in 0..model.graph.op(op).operands.len() {
                let operand = model.graph.op(op).operands[o];
                self.linearize_with_predecessors(
                    model,
                    partitioner,
                    placer,
                    coalescer,
                    operand,
                    visited,
                    added_early,
                    true,
                )?;
            }
        }
        if model.graph.op(op).kind.reads_tile_memory() {
            for i in 0..model.graph.op(op).mem_srcs.len() {
                let src = model.graph.op(op).mem_srcs[i];
                self.linearize_with_predecessors(
                    model,
                    partitioner,
                    placer,
                    coalescer,
                    src,
                    visited,
                    added_early,
                    true,
                )?;
            }
        }
        if matches!(model.graph.op(op).kind, OpKind::Receive { .. }) {
            let src = model.graph.recv_src(op);
            self.linearize_with_predecessors(
                model,
                partitioner,
                placer,
                coalescer,
                src,
                visited,
                added_early,
                true,
            )?;
        }
        if add_self && !added_early.contains(&op) {
            self.add_to_list(model, partitioner, placer, op, visited)?;
        }
        Ok(())
    }

    fn add_to_list(
        &mut self,
        model: &ModelImpl,
        partitioner: &Partitioner,
        placer: &Placer,
        op: OpId,
        visited: &mut HashSet<OpId>,
    ) -> CompileResult<()> {
        if visited.contains(&op) {
            return Err(CompileError::linearization(format!(
                "{} placed twice",
                op
            )));
        }
        let kind = &model.graph.op(op).kind;
        if kind.is_core_op() {
            let ptile = placer.ptile(partitioner, op);
            let pcore = placer.pcore(partitioner, op);
            self.core_lists[ptile * N_CORES_PER_TILE + pcore].push(op);
        } else if kind.is_tile_op() {
            let ptile = placer.ptile(partitioner, op);
            self.tile_lists[ptile].push(op);
        }
        visited.insert(op);
        Ok(())
    }

    /// Place the consumers of a freshly emitted producer right after
    /// it. If any consumer still misses another operand, a copy keeps
    /// the producer's value alive in a general register instead and
    /// the consumers are deferred.
    fn add_consumers_to_list(
        &mut self,
        model: &mut ModelImpl,
        partitioner: &mut Partitioner,
        placer: &Placer,
        producer: OpId,
        visited: &mut HashSet<OpId>,
        added_early: &mut HashSet<OpId>,
    ) -> CompileResult<()> {
        let users: Vec<OpId> = model.graph.op(producer).users.iter().copied().collect();
        let all_consumers_ready = users.iter().all(|&consumer| {
            model
                .graph
                .op(consumer)
                .operands
                .iter()
                .all(|operand| visited.contains(operand))
        });
        if all_consumers_ready {
            for consumer in users {
                if !added_early.contains(&consumer) {
                    self.add_to_list(model, partitioner, placer, consumer, visited)?;
                    added_early.insert(consumer);
                }
            }
        } else {
            let copy = model.new_copy(producer);
            partitioner.clone_assignment(producer, copy);
            self.add_to_list(model, partitioner, placer, copy, visited)?;
            for consumer in users {
                model.graph.replace_operand(consumer, producer, copy);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coalescer::Coalescer;
    use crate::model::{GraphPartitioningScheme, Model};
    use crate::partitioner::KahipOracle;
    use crate::tensors::{ConstantMatrix, InputVector, OutputVector, Vector};
    use std::collections::HashMap;

    fn linearize(model: &Model, coalesce: bool) -> (Linearizer, Partitioner, Placer) {
        let inner = model.inner();
        let mut m = inner.borrow_mut();
        let mut partitioner =
            Partitioner::run(&mut m, GraphPartitioningScheme::RowMajor, &KahipOracle).unwrap();
        let placer = Placer::run(&m, &partitioner).unwrap();
        let coalescer = if coalesce {
            Some(Coalescer::run(&m, &partitioner, &placer).unwrap())
        } else {
            None
        };
        let linearizer =
            Linearizer::run(&mut m, &mut partitioner, &placer, coalescer.as_ref()).unwrap();
        (linearizer, partitioner, placer)
    }

    fn simple_model() -> Model {
        let model = Model::new("linear");
        let input = InputVector::new(&model, "in", 5);
        let matrix = ConstantMatrix::new(&model, "m", 5, 5);
        let out = OutputVector::new(&model, "out", 5);
        let y = &matrix * &Vector::from(&input);
        out.assign(&y);
        model
    }

    /// Positions of every placed op, per list
    fn positions(linearizer: &Linearizer, placer: &Placer) -> HashMap<OpId, (usize, usize)> {
        let mut positions = HashMap::new();
        for ptile in 0..placer.n_ptiles() {
            for (i, &op) in linearizer.tile_list(ptile).iter().enumerate() {
                positions.insert(op, (ptile, i));
            }
            for pcore in 0..crate::hardware::N_CORES_PER_TILE {
                for (i, &op) in linearizer.core_list(ptile, pcore).iter().enumerate() {
                    positions.insert(op, (100 + ptile * 8 + pcore, i));
                }
            }
        }
        positions
    }

    #[test]
    fn test_every_core_op_is_placed_once() {
        let model = simple_model();
        let (linearizer, _, placer) = linearize(&model, false);
        let inner = model.inner().borrow();
        let placed = positions(&linearizer, &placer);
        for op in inner.graph.ids() {
            let kind = &inner.graph.op(op).kind;
            if kind.is_core_op() || kind.is_tile_op() {
                assert!(placed.contains_key(&op), "{} missing from lists", op);
            }
        }
    }

    #[test]
    fn test_same_list_dependences_are_ordered() {
        let model = simple_model();
        let (linearizer, _, placer) = linearize(&model, false);
        let inner = model.inner().borrow();
        let placed = positions(&linearizer, &placer);
        for op in inner.graph.ids() {
            for &user in inner
                .graph
                .op(op)
                .users
                .iter()
                .chain(inner.graph.op(op).mem_users.iter())
            {
                if let (Some(&(la, ia)), Some(&(lb, ib))) = (placed.get(&op), placed.get(&user))
                {
                    if la == lb {
                        assert!(ia < ib, "{} not before {}", op, user);
                    }
                }
            }
        }
    }

    #[test]
    fn test_matrix_input_packing_places_operand_immediately_before() {
        let model = simple_model();
        let (linearizer, partitioner, placer) = linearize(&model, false);
        let inner = model.inner().borrow();
        for op in inner.graph.ids() {
            if !inner.graph.op(op).kind.is_matrix_op() {
                continue;
            }
            let list = linearizer.core_list(
                placer.ptile(&partitioner, op),
                placer.pcore(&partitioner, op),
            );
            let mvm_pos = list.iter().position(|&o| o == op).unwrap();
            let operand = inner.graph.op(op).operands[0];
            assert_eq!(list[mvm_pos - 1], operand);
        }
    }

    #[test]
    fn test_matrix_consumer_conflict_gets_a_copy() {
        // The store consuming the MVM also needs its address operand,
        // which is not yet placed when the MVM is emitted; the
        // linearizer must interpose a copy out of the reserved output
        // register
        let model = simple_model();
        let inner = model.inner();
        let mut m = inner.borrow_mut();
        let mut partitioner =
            Partitioner::run(&mut m, GraphPartitioningScheme::RowMajor, &KahipOracle).unwrap();
        let placer = Placer::run(&m, &partitioner).unwrap();
        let _memalloc =
            crate::memalloc::MemoryAllocator::run(&mut m, &mut partitioner).unwrap();
        let linearizer =
            Linearizer::run(&mut m, &mut partitioner, &placer, None).unwrap();
        let mvm = m
            .graph
            .ids()
            .find(|&op| m.graph.op(op).kind.is_matrix_op())
            .unwrap();
        let list = linearizer.core_list(
            placer.ptile(&partitioner, mvm),
            placer.pcore(&partitioner, mvm),
        );
        let mvm_pos = list.iter().position(|&o| o == mvm).unwrap();
        let after = list[mvm_pos + 1];
        assert!(matches!(m.graph.op(after).kind, OpKind::Copy));
        assert_eq!(m.graph.op(after).operands[0], mvm);
        // The store now reads the copy, not the MVM
        for &user in &m.graph.op(after).users {
            assert!(matches!(m.graph.op(user).kind, OpKind::Store));
        }
    }

    #[test]
    fn test_coalesced_members_emitted_contiguously() {
        let model = Model::new("coalesced");
        let input = InputVector::new(&model, "in", 256);
        let matrix = ConstantMatrix::new(&model, "m", 256, 256);
        let out = OutputVector::new(&model, "out", 256);
        let y = &matrix * &Vector::from(&input);
        out.assign(&y);
        let (linearizer, partitioner, placer) = linearize(&model, true);
        let inner = model.inner().borrow();
        let mvms: Vec<OpId> = inner
            .graph
            .ids()
            .filter(|&op| inner.graph.op(op).kind.is_matrix_op())
            .collect();
        let list = linearizer.core_list(
            placer.ptile(&partitioner, mvms[0]),
            placer.pcore(&partitioner, mvms[0]),
        );
        let positions: Vec<usize> = mvms
            .iter()
            .map(|&mvm| list.iter().position(|&o| o == mvm).unwrap())
            .collect();
        let min = *positions.iter().min().unwrap();
        let max = *positions.iter().max().unwrap();
        assert_eq!(max - min + 1, mvms.len(), "coalesced MVMs not contiguous");
    }
}
