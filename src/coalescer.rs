//! Coalescing of independent matrix operations into wide instructions
//!
//! Matrix operations on the same core that have no data dependence on
//! each other can fire in a single instruction by occupying distinct
//! MVMU slots. Phase A consumes the hint sets recorded at DAG
//! construction time (the MVMs of one matrix-vector multiply): a hint
//! group that completely fills a core's slots is kept as-is, anything
//! partial is demolished so the greedy phase can recombine its members.
//! Phase B walks the DAG from the output sinks in the same order the
//! linearizer will use and packs each remaining matrix operation into
//! the first compatible set, updating the predecessor relation so that
//! every set stays an antichain.
//!
//! Training operations coalesce the same way with two refinements: the
//! slot index is (pMVMU, operation type), and predecessors propagate
//! through the nearest training-op ancestors.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::error::{CompileError, CompileResult};
use crate::graph::{OpId, OpKind, TrainingOpType};
use crate::hardware::{
    N_CONSTANT_MVMUS_PER_CORE, N_CORES_PER_TILE, N_TRAINING_MVMUS_PER_CORE,
    N_TRAINING_OPERATIONS,
};
use crate::model::{ModelImpl, ModelType};
use crate::partitioner::Partitioner;
use crate::placer::Placer;

/// A bundle of matrix operations emitted as one wide instruction
///
/// Slots are indexed by physical MVMU for MVMs, and by
/// `pMVMU * N_TRAINING_OPERATIONS + op_type` for training operations.
#[derive(Debug)]
pub struct CoalescedSet {
    slots: Vec<Option<OpId>>,
}

impl CoalescedSet {
    fn new(n_slots: usize) -> Self {
        Self {
            slots: vec![None; n_slots],
        }
    }

    pub fn uses_slot(&self, slot: usize) -> bool {
        self.slots[slot].is_some()
    }

    fn add(&mut self, op: OpId, slot: usize) -> CompileResult<()> {
        if self.slots[slot].is_some() {
            return Err(CompileError::coalescing(format!(
                "slot {} already occupied when adding {}",
                slot, op
            )));
        }
        self.slots[slot] = Some(op);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(|slot| slot.is_some())
    }

    /// The lexicographically first occupied slot emits the instruction
    /// on behalf of the whole set
    pub fn leader(&self) -> OpId {
        self.slots
            .iter()
            .flatten()
            .copied()
            .next()
            .expect("coalesced set has no members")
    }

    pub fn members(&self) -> impl Iterator<Item = OpId> + '_ {
        self.slots.iter().flatten().copied()
    }
}

/// All coalesced sets of a model, grouped per physical core
pub struct Coalescer {
    sets: Vec<CoalescedSet>,
    /// Set indices per `ptile * N_CORES_PER_TILE + pcore`, in creation
    /// order
    core_sets: Vec<Vec<usize>>,
    op2set: HashMap<OpId, usize>,
}

impl Coalescer {
    pub fn run(
        model: &ModelImpl,
        partitioner: &Partitioner,
        placer: &Placer,
    ) -> CompileResult<Self> {
        let mut coalescer = Coalescer {
            sets: Vec::new(),
            core_sets: vec![Vec::new(); placer.n_pcores()],
            op2set: HashMap::new(),
        };
        match model.model_type() {
            ModelType::Training => coalescer.coalesce_training_ops(model, partitioner, placer)?,
            _ => coalescer.coalesce_mvms(model, partitioner, placer)?,
        }
        Ok(coalescer)
    }

    pub fn set_of(&self, op: OpId) -> Option<&CoalescedSet> {
        self.op2set.get(&op).map(|&idx| &self.sets[idx])
    }

    pub fn is_coalesced(&self, op: OpId) -> bool {
        self.op2set.contains_key(&op)
    }

    pub fn is_set_leader(&self, op: OpId) -> bool {
        self.set_of(op).map(|set| set.leader() == op).unwrap_or(false)
    }

    // ---- MVM coalescing ---------------------------------------------

    fn coalesce_mvms(
        &mut self,
        model: &ModelImpl,
        partitioner: &Partitioner,
        placer: &Placer,
    ) -> CompileResult<()> {
        // Phase A: hint-based coalescing. Group each hint set by the
        // core its members landed on; keep only completely filled sets.
        for hint_set in &model.coalesceable_mvm_sets {
            let mut local: BTreeMap<(usize, usize), CoalescedSet> = BTreeMap::new();
            for &mvm in hint_set {
                let key = (
                    placer.ptile(partitioner, mvm),
                    placer.pcore(partitioner, mvm),
                );
                let set = local
                    .entry(key)
                    .or_insert_with(|| CoalescedSet::new(N_CONSTANT_MVMUS_PER_CORE));
                set.add(mvm, placer.pmvmu(partitioner, mvm))?;
            }
            for ((ptile, pcore), set) in local {
                if set.is_complete() {
                    self.register_set(ptile, pcore, set)?;
                }
                // Partial sets are dropped so their members stay
                // available for greedy coalescing
            }
        }

        // Analyze dependences between the remaining MVM operations
        let mut mvm_predecessors: HashMap<OpId, BTreeSet<OpId>> = HashMap::new();
        for op in model.graph.ids() {
            if matches!(model.graph.op(op).kind, OpKind::ReadOutput { .. }) {
                self.find_mvm_predecessors(model, op, &mut mvm_predecessors);
            }
        }
        let mut preds: HashMap<OpId, BTreeSet<OpId>> = HashMap::new();
        let mut succs: HashMap<OpId, BTreeSet<OpId>> = HashMap::new();
        for (&op, op_preds) in &mvm_predecessors {
            if !matches!(model.graph.op(op).kind, OpKind::Mvm { .. }) {
                continue;
            }
            for &pred in op_preds {
                preds.entry(op).or_default().insert(pred);
                succs.entry(pred).or_default().insert(op);
            }
        }

        // Phase B: greedy coalescing in linearization order
        let mut visited: HashSet<OpId> = HashSet::new();
        for op in model.graph.ids_snapshot() {
            if matches!(model.graph.op(op).kind, OpKind::ReadOutput { .. }) {
                self.coalesce_mvm_predecessors(
                    model,
                    partitioner,
                    placer,
                    op,
                    &mut visited,
                    &mut preds,
                    &mut succs,
                )?;
            }
        }
        Ok(())
    }

    /// Reverse-postorder computation of the uncoalesced-MVM predecessor
    /// sets of every operation reachable from `op`
    fn find_mvm_predecessors(
        &self,
        model: &ModelImpl,
        op: OpId,
        memo: &mut HashMap<OpId, BTreeSet<OpId>>,
    ) {
        if memo.contains_key(&op) {
            return;
        }
        memo.insert(op, BTreeSet::new());
        let node = model.graph.op(op);
        if matches!(node.kind, OpKind::Mvm { .. }) {
            if let Some(set) = self.set_of(op) {
                // A coalesced MVM acts as an atomic node: it inherits
                // the predecessors of every member's input
                debug_assert!(set.is_complete());
                let members: Vec<OpId> = set.members().collect();
                for member in members {
                    let predecessor = model.graph.op(member).operands[0];
                    self.find_mvm_predecessors(model, predecessor, memo);
                    let found = memo[&predecessor].clone();
                    memo.get_mut(&op).unwrap().extend(found);
                }
            } else {
                let predecessor = node.operands[0];
                self.find_mvm_predecessors(model, predecessor, memo);
                let found = memo[&predecessor].clone();
                memo.get_mut(&op).unwrap().extend(found);
            }
        } else if node.kind.is_consumer() {
            for o in 0..model.graph.op(op).operands.len() {
                let predecessor = model.graph.op(op).operands[o];
                self.find_mvm_predecessors(model, predecessor, memo);
                let found = memo[&predecessor].clone();
                memo.get_mut(&op).unwrap().extend(found);
                if matches!(model.graph.op(predecessor).kind, OpKind::Mvm { .. })
                    && !self.is_coalesced(predecessor)
                {
                    memo.get_mut(&op).unwrap().insert(predecessor);
                }
            }
        }
        if model.graph.op(op).kind.reads_tile_memory() {
            for i in 0..model.graph.op(op).mem_srcs.len() {
                let predecessor = model.graph.op(op).mem_srcs[i];
                self.find_mvm_predecessors(model, predecessor, memo);
                let found = memo[&predecessor].clone();
                memo.get_mut(&op).unwrap().extend(found);
            }
        }
        if matches!(model.graph.op(op).kind, OpKind::Receive { .. }) {
            let predecessor = model.graph.recv_src(op);
            self.find_mvm_predecessors(model, predecessor, memo);
            let found = memo[&predecessor].clone();
            memo.get_mut(&op).unwrap().extend(found);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn coalesce_mvm_predecessors(
        &mut self,
        model: &ModelImpl,
        partitioner: &Partitioner,
        placer: &Placer,
        op: OpId,
        visited: &mut HashSet<OpId>,
        preds: &mut HashMap<OpId, BTreeSet<OpId>>,
        succs: &mut HashMap<OpId, BTreeSet<OpId>>,
    ) -> CompileResult<()> {
        if visited.contains(&op) {
            return Ok(());
        }
        if model.graph.op(op).kind.is_consumer() {
            for o in 0..model.graph.op(op).operands.len() {
                let predecessor = model.graph.op(op).operands[o];
                self.coalesce_mvm_predecessors(
                    model,
                    partitioner,
                    placer,
                    predecessor,
                    visited,
                    preds,
                    succs,
                )?;
            }
            if matches!(model.graph.op(op).kind, OpKind::Mvm { .. }) && !self.is_coalesced(op)
            {
                let core_idx = placer.ptile(partitioner, op) * N_CORES_PER_TILE
                    + placer.pcore(partitioner, op);
                let pmvmu = placer.pmvmu(partitioner, op);
                let set_idx = self.find_compatible_set(core_idx, pmvmu, op, preds, succs);
                let set_idx = match set_idx {
                    Some(idx) => idx,
                    None => {
                        let idx = self.sets.len();
                        self.sets
                            .push(CoalescedSet::new(N_CONSTANT_MVMUS_PER_CORE));
                        self.core_sets[core_idx].push(idx);
                        idx
                    }
                };
                self.merge_dependences(set_idx, op, preds, succs);
                self.sets[set_idx].add(op, pmvmu)?;
                self.op2set.insert(op, set_idx);
            }
        }
        if model.graph.op(op).kind.reads_tile_memory() {
            for i in 0..model.graph.op(op).mem_srcs.len() {
                let predecessor = model.graph.op(op).mem_srcs[i];
                self.coalesce_mvm_predecessors(
                    model,
                    partitioner,
                    placer,
                    predecessor,
                    visited,
                    preds,
                    succs,
                )?;
            }
        }
        if matches!(model.graph.op(op).kind, OpKind::Receive { .. }) {
            let predecessor = model.graph.recv_src(op);
            self.coalesce_mvm_predecessors(
                model,
                partitioner,
                placer,
                predecessor,
                visited,
                preds,
                succs,
            )?;
        }
        visited.insert(op);
        Ok(())
    }

    /// First set on the core, in creation order, whose slot is free and
    /// whose members have no ordering relation with `op`
    fn find_compatible_set(
        &self,
        core_idx: usize,
        slot: usize,
        op: OpId,
        preds: &HashMap<OpId, BTreeSet<OpId>>,
        succs: &HashMap<OpId, BTreeSet<OpId>>,
    ) -> Option<usize> {
        let empty = BTreeSet::new();
        let op_preds = preds.get(&op).unwrap_or(&empty);
        let op_succs = succs.get(&op).unwrap_or(&empty);
        'sets: for &set_idx in &self.core_sets[core_idx] {
            let set = &self.sets[set_idx];
            if set.uses_slot(slot) {
                continue;
            }
            for member in set.members() {
                if op_preds.contains(&member) || op_succs.contains(&member) {
                    continue 'sets;
                }
            }
            return Some(set_idx);
        }
        None
    }

    /// Adding `op` to a set makes every predecessor of `op` a
    /// predecessor of every member (and vice versa), keeping the set an
    /// antichain in the transitive closure
    fn merge_dependences(
        &self,
        set_idx: usize,
        op: OpId,
        preds: &mut HashMap<OpId, BTreeSet<OpId>>,
        succs: &mut HashMap<OpId, BTreeSet<OpId>>,
    ) {
        let members: Vec<OpId> = self.sets[set_idx].members().collect();
        for member in members {
            let op_preds: Vec<OpId> = preds.get(&op).into_iter().flatten().copied().collect();
            for pred in op_preds {
                preds.entry(member).or_default().insert(pred);
                succs.entry(pred).or_default().insert(member);
                let member_succs: Vec<OpId> =
                    succs.get(&member).into_iter().flatten().copied().collect();
                for succ in member_succs {
                    preds.entry(succ).or_default().insert(pred);
                    succs.entry(pred).or_default().insert(succ);
                }
            }
            let member_preds: Vec<OpId> =
                preds.get(&member).into_iter().flatten().copied().collect();
            for pred in member_preds {
                preds.entry(op).or_default().insert(pred);
                succs.entry(pred).or_default().insert(op);
                let op_succs: Vec<OpId> =
                    succs.get(&op).into_iter().flatten().copied().collect();
                for succ in op_succs {
                    preds.entry(succ).or_default().insert(pred);
                    succs.entry(pred).or_default().insert(succ);
                }
            }
        }
    }

    fn register_set(
        &mut self,
        ptile: usize,
        pcore: usize,
        set: CoalescedSet,
    ) -> CompileResult<()> {
        let idx = self.sets.len();
        for member in set.members() {
            if self.op2set.insert(member, idx).is_some() {
                return Err(CompileError::coalescing(format!(
                    "{} belongs to two coalesced sets",
                    member
                )));
            }
        }
        self.core_sets[ptile * N_CORES_PER_TILE + pcore].push(idx);
        self.sets.push(set);
        Ok(())
    }

    // ---- Training operation coalescing ------------------------------

    fn coalesce_training_ops(
        &mut self,
        model: &ModelImpl,
        partitioner: &Partitioner,
        placer: &Placer,
    ) -> CompileResult<()> {
        // Immediate training predecessors: walk back through
        // non-training operations to the nearest training ancestors
        let mut immediate: HashMap<OpId, BTreeSet<OpId>> = HashMap::new();
        for op in model.graph.ids() {
            if matches!(model.graph.op(op).kind, OpKind::Training { .. }) {
                let mut found = BTreeSet::new();
                self.find_immediate_training_predecessors(model, op, &mut found);
                immediate.insert(op, found);
            }
        }

        // Transitive closure
        let mut preds: HashMap<OpId, BTreeSet<OpId>> = HashMap::new();
        for op in model.graph.ids() {
            if matches!(model.graph.op(op).kind, OpKind::Training { .. }) {
                let mut found = BTreeSet::new();
                Self::find_all_training_predecessors(op, &mut found, &immediate);
                preds.insert(op, found);
            }
        }
        let mut succs: HashMap<OpId, BTreeSet<OpId>> = HashMap::new();
        for (&op, op_preds) in &preds {
            for &pred in op_preds {
                succs.entry(pred).or_default().insert(op);
            }
        }

        // Greedy coalescing in linearization order: outer products are
        // side-effect sinks alongside the read-output operations
        let mut visited: HashSet<OpId> = HashSet::new();
        for op in model.graph.ids_snapshot() {
            match model.graph.op(op).kind {
                OpKind::Training {
                    op_type: TrainingOpType::OuterProduct,
                    ..
                }
                | OpKind::ReadOutput { .. } => {
                    self.coalesce_training_predecessors(
                        model,
                        partitioner,
                        placer,
                        op,
                        &mut visited,
                        &mut preds,
                        &mut succs,
                    )?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn find_immediate_training_predecessors(
        &self,
        model: &ModelImpl,
        op: OpId,
        found: &mut BTreeSet<OpId>,
    ) {
        if model.graph.op(op).kind.is_consumer() {
            for o in 0..model.graph.op(op).operands.len() {
                let predecessor = model.graph.op(op).operands[o];
                if matches!(model.graph.op(predecessor).kind, OpKind::Training { .. }) {
                    found.insert(predecessor);
                } else {
                    self.find_immediate_training_predecessors(model, predecessor, found);
                }
            }
        }
        if model.graph.op(op).kind.reads_tile_memory() {
            for i in 0..model.graph.op(op).mem_srcs.len() {
                let predecessor = model.graph.op(op).mem_srcs[i];
                self.find_immediate_training_predecessors(model, predecessor, found);
            }
        }
        if matches!(model.graph.op(op).kind, OpKind::Receive { .. }) {
            let predecessor = model.graph.recv_src(op);
            self.find_immediate_training_predecessors(model, predecessor, found);
        }
    }

    fn find_all_training_predecessors(
        op: OpId,
        found: &mut BTreeSet<OpId>,
        immediate: &HashMap<OpId, BTreeSet<OpId>>,
    ) {
        for &pred in immediate.get(&op).into_iter().flatten() {
            if found.insert(pred) {
                Self::find_all_training_predecessors(pred, found, immediate);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn coalesce_training_predecessors(
        &mut self,
        model: &ModelImpl,
        partitioner: &Partitioner,
        placer: &Placer,
        op: OpId,
        visited: &mut HashSet<OpId>,
        preds: &mut HashMap<OpId, BTreeSet<OpId>>,
        succs: &mut HashMap<OpId, BTreeSet<OpId>>,
    ) -> CompileResult<()> {
        if visited.contains(&op) {
            return Ok(());
        }
        if model.graph.op(op).kind.is_consumer() {
            for o in 0..model.graph.op(op).operands.len() {
                let predecessor = model.graph.op(op).operands[o];
                self.coalesce_training_predecessors(
                    model,
                    partitioner,
                    placer,
                    predecessor,
                    visited,
                    preds,
                    succs,
                )?;
            }
            if let OpKind::Training { op_type, .. } = model.graph.op(op).kind {
                if !self.is_coalesced(op) {
                    let core_idx = placer.ptile(partitioner, op) * N_CORES_PER_TILE
                        + placer.pcore(partitioner, op);
                    let slot = placer.pmvmu(partitioner, op) * N_TRAINING_OPERATIONS
                        + op_type.index();
                    let set_idx = self.find_compatible_set(core_idx, slot, op, preds, succs);
                    let set_idx = match set_idx {
                        Some(idx) => idx,
                        None => {
                            let idx = self.sets.len();
                            self.sets.push(CoalescedSet::new(
                                N_TRAINING_MVMUS_PER_CORE * N_TRAINING_OPERATIONS,
                            ));
                            self.core_sets[core_idx].push(idx);
                            idx
                        }
                    };
                    self.merge_dependences(set_idx, op, preds, succs);
                    self.sets[set_idx].add(op, slot)?;
                    self.op2set.insert(op, set_idx);
                }
            }
        }
        if model.graph.op(op).kind.reads_tile_memory() {
            for i in 0..model.graph.op(op).mem_srcs.len() {
                let predecessor = model.graph.op(op).mem_srcs[i];
                self.coalesce_training_predecessors(
                    model,
                    partitioner,
                    placer,
                    predecessor,
                    visited,
                    preds,
                    succs,
                )?;
            }
        }
        if matches!(model.graph.op(op).kind, OpKind::Receive { .. }) {
            let predecessor = model.graph.recv_src(op);
            self.coalesce_training_predecessors(
                model,
                partitioner,
                placer,
                predecessor,
                visited,
                preds,
                succs,
            )?;
        }
        visited.insert(op);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::sig;
    use crate::model::{GraphPartitioningScheme, Model};
    use crate::partitioner::KahipOracle;
    use crate::tensors::{
        ConstantMatrix, InputVector, OuterProduct, OutputVector, TrainingMatrix, Vector,
    };

    fn coalesce(model: &Model) -> (Coalescer, Partitioner, Placer) {
        let inner = model.inner();
        let mut m = inner.borrow_mut();
        let partitioner =
            Partitioner::run(&mut m, GraphPartitioningScheme::RowMajor, &KahipOracle).unwrap();
        let placer = Placer::run(&m, &partitioner).unwrap();
        let coalescer = Coalescer::run(&m, &partitioner, &placer).unwrap();
        (coalescer, partitioner, placer)
    }

    fn mvm_ops(model: &Model) -> Vec<OpId> {
        let inner = model.inner().borrow();
        inner
            .graph
            .ids()
            .filter(|&op| matches!(inner.graph.op(op).kind, OpKind::Mvm { .. }))
            .collect()
    }

    #[test]
    fn test_phase_a_retains_complete_hint_set() {
        // Six width tiles fill all six MVMU slots of one core
        let model = Model::new("complete");
        let input = InputVector::new(&model, "in", 6 * 128);
        let matrix = ConstantMatrix::new(&model, "m", 6 * 128, 128);
        let out = OutputVector::new(&model, "out", 128);
        let y = &matrix * &Vector::from(&input);
        out.assign(&y);
        let (coalescer, _, _) = coalesce(&model);
        let mvms = mvm_ops(&model);
        assert_eq!(mvms.len(), 6);
        let set = coalescer.set_of(mvms[0]).unwrap();
        assert!(set.is_complete());
        for &mvm in &mvms {
            assert!(std::ptr::eq(coalescer.set_of(mvm).unwrap(), set));
        }
        assert_eq!(coalescer.sets.len(), 1);
    }

    #[test]
    fn test_incomplete_hint_set_recombined_by_phase_b() {
        // Four mutually independent MVMs cannot complete a six-slot
        // hint set; the greedy phase packs them into one partial set
        let model = Model::new("partial");
        let input = InputVector::new(&model, "in", 256);
        let matrix = ConstantMatrix::new(&model, "m", 256, 256);
        let out = OutputVector::new(&model, "out", 256);
        let y = &matrix * &Vector::from(&input);
        out.assign(&y);
        let (coalescer, _, _) = coalesce(&model);
        let mvms = mvm_ops(&model);
        assert_eq!(mvms.len(), 4);
        assert_eq!(coalescer.sets.len(), 1);
        let set = &coalescer.sets[0];
        assert!(!set.is_complete());
        assert_eq!(set.members().count(), 4);
        for slot in 0..4 {
            assert!(set.uses_slot(slot));
        }
    }

    #[test]
    fn test_dependent_mvms_are_never_coalesced() {
        // m2 consumes (a function of) m1's output, so the two MVMs are
        // ordered and must land in different sets
        let model = Model::new("chain");
        let input = InputVector::new(&model, "in", 128);
        let m1 = ConstantMatrix::new(&model, "m1", 128, 128);
        let m2 = ConstantMatrix::new(&model, "m2", 128, 128);
        let out = OutputVector::new(&model, "out", 128);
        let y = &m2 * &sig(&(&m1 * &Vector::from(&input)));
        out.assign(&y);
        let (coalescer, _, _) = coalesce(&model);
        let mvms = mvm_ops(&model);
        assert_eq!(mvms.len(), 2);
        assert_eq!(coalescer.sets.len(), 2);
        assert!(!std::ptr::eq(
            coalescer.set_of(mvms[0]).unwrap(),
            coalescer.set_of(mvms[1]).unwrap()
        ));
    }

    #[test]
    fn test_coalesced_sets_are_antichains_with_unique_slots() {
        let model = Model::new("antichain");
        let input = InputVector::new(&model, "in", 512);
        let matrix = ConstantMatrix::new(&model, "m", 512, 256);
        let out = OutputVector::new(&model, "out", 256);
        let y = &matrix * &Vector::from(&input);
        out.assign(&y);
        let (coalescer, partitioner, placer) = coalesce(&model);
        let inner = model.inner().borrow();
        for set in &coalescer.sets {
            // Slot uniqueness: every member sits in its own pMVMU slot
            let mut seen = std::collections::HashSet::new();
            for (slot, member) in set.slots.iter().enumerate() {
                if let Some(member) = member {
                    assert_eq!(placer.pmvmu(&partitioner, *member), slot);
                    assert!(seen.insert(slot));
                }
            }
            // Antichain: no member reaches another through the DAG
            let members: Vec<OpId> = set.members().collect();
            for &a in &members {
                let mut reachable = std::collections::HashSet::new();
                let mut stack = vec![a];
                while let Some(op) = stack.pop() {
                    for &user in inner
                        .graph
                        .op(op)
                        .users
                        .iter()
                        .chain(inner.graph.op(op).mem_users.iter())
                    {
                        if reachable.insert(user) {
                            stack.push(user);
                        }
                    }
                }
                for &b in &members {
                    if a != b {
                        assert!(!reachable.contains(&b), "{} reaches {}", a, b);
                    }
                }
            }
        }
    }

    #[test]
    fn test_independent_training_ops_share_a_set() {
        let model = Model::new("train");
        let x = InputVector::new(&model, "x", 128);
        let d = InputVector::new(&model, "d", 128);
        let y_out = OutputVector::new(&model, "y", 128);
        let e_out = OutputVector::new(&model, "e", 128);
        let mut matrix = TrainingMatrix::new(&model, "w", 128, 128);
        let xv = Vector::from(&x);
        let dv = Vector::from(&d);
        let y = &matrix * &xv;
        let e = &matrix.t() * &dv;
        y_out.assign(&y);
        e_out.assign(&e);
        matrix -= OuterProduct::new(&dv, &xv);
        let (coalescer, _, _) = coalesce(&model);
        // Forward, transpose, and outer product on the same tile are
        // mutually independent: one set with three typed slots
        assert_eq!(coalescer.sets.len(), 1);
        let set = &coalescer.sets[0];
        assert_eq!(set.members().count(), 3);
        assert!(set.uses_slot(TrainingOpType::Mvm.index()));
        assert!(set.uses_slot(TrainingOpType::MvmTranspose.index()));
        assert!(set.uses_slot(TrainingOpType::OuterProduct.index()));
    }

    #[test]
    fn test_dependent_training_ops_split_sets() {
        let model = Model::new("train-chain");
        let x = InputVector::new(&model, "x", 128);
        let out = OutputVector::new(&model, "out", 128);
        let matrix = TrainingMatrix::new(&model, "w", 128, 128);
        let y = &matrix * &Vector::from(&x);
        let z = &matrix.t() * &y;
        out.assign(&z);
        let (coalescer, _, _) = coalesce(&model);
        // The transpose op consumes the forward op's output
        assert_eq!(coalescer.sets.len(), 2);
    }
}
