//! Register allocation
//!
//! Three passes per core over the linearized instruction list. The
//! first assigns reserved input registers to the producers feeding
//! matrix operations, the second reserved output registers to matrix
//! producers; both verify that the linearizer left no overlapping live
//! ranges in the same register window. The third allocates general
//! data registers with a backward live-range analysis and a forward
//! scan that spills to tile memory when the file is exhausted:
//! reloads of spilled values are reused while live, reloads a consumer
//! does not need are killed first, and only then are live values
//! evicted through a store.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::error::{CompileError, CompileResult};
use crate::graph::{OpId, OpKind, TrainingOpType};
use crate::hardware::{
    INPUT_REGISTERS_START_ADDRESS, MVMU_DIM, N_CORES_PER_TILE, N_TRAINING_OPERATIONS,
    OUTPUT_REGISTERS_START_ADDRESS, REGISTER_FILE_SIZE, REGISTER_FILE_START_ADDRESS,
};
use crate::linearizer::Linearizer;
use crate::memalloc::MemoryAllocator;
use crate::model::ModelImpl;
use crate::partitioner::Partitioner;
use crate::placer::Placer;

/// Bitmap allocator over one core's general register file
struct CoreAllocator {
    pool: Vec<bool>,
}

impl CoreAllocator {
    fn new() -> Self {
        Self {
            pool: vec![false; REGISTER_FILE_SIZE],
        }
    }

    /// First-fit allocation of `size` contiguous registers
    fn allocate(&mut self, size: usize) -> Option<usize> {
        if size == 0 || size > REGISTER_FILE_SIZE {
            return None;
        }
        let mut i = 0;
        while i + size <= REGISTER_FILE_SIZE {
            match (i..i + size).find(|&j| self.pool[j]) {
                Some(j) => i = j + 1,
                None => {
                    for j in i..i + size {
                        self.pool[j] = true;
                    }
                    return Some(REGISTER_FILE_START_ADDRESS + i);
                }
            }
        }
        None
    }

    fn free(&mut self, reg: usize, size: usize) {
        let pos = reg - REGISTER_FILE_START_ADDRESS;
        for i in pos..pos + size {
            assert!(self.pool[i], "attempt to free unallocated registers");
            self.pool[i] = false;
        }
    }
}

/// Tracks which producers live in tile memory and which reloads of
/// them currently sit in registers
#[derive(Default)]
struct SpillTracker {
    producer2spill: HashMap<OpId, OpId>,
    producer2reload: BTreeMap<OpId, OpId>,
    reload2producer: HashMap<OpId, OpId>,
}

impl SpillTracker {
    fn is_spilled(&self, producer: OpId) -> bool {
        self.producer2spill.contains_key(&producer)
    }

    fn has_live_reload(&self, producer: OpId) -> bool {
        self.producer2reload.contains_key(&producer)
    }

    fn is_live_reload(&self, load: OpId) -> bool {
        self.reload2producer.contains_key(&load)
    }

    fn spill_op(&self, producer: OpId) -> OpId {
        self.producer2spill[&producer]
    }

    fn live_reload(&self, producer: OpId) -> OpId {
        self.producer2reload[&producer]
    }

    fn original_producer(&self, load: OpId) -> OpId {
        self.reload2producer[&load]
    }

    fn set_spill(&mut self, producer: OpId, store: OpId) -> CompileResult<()> {
        if self.producer2spill.insert(producer, store).is_some() {
            return Err(CompileError::regalloc(format!(
                "spilling {} twice",
                producer
            )));
        }
        Ok(())
    }

    fn set_live_reload(&mut self, producer: OpId, load: OpId) -> CompileResult<()> {
        if self.producer2reload.insert(producer, load).is_some() {
            return Err(CompileError::regalloc(format!(
                "reloading {} twice",
                producer
            )));
        }
        self.reload2producer.insert(load, producer);
        Ok(())
    }

    fn kill_live_reload(&mut self, load: OpId) {
        let producer = self.reload2producer.remove(&load).expect("not a reload");
        self.producer2reload.remove(&producer);
    }

    fn reloads_snapshot(&self) -> Vec<(OpId, OpId)> {
        self.producer2reload
            .iter()
            .map(|(&producer, &load)| (producer, load))
            .collect()
    }
}

/// A live reload may be recycled to make room only when the current
/// consumer uses neither the spilled producer nor its reload
fn reload_may_be_killed(
    model: &ModelImpl,
    current_consumer: Option<OpId>,
    producer: OpId,
    reload: OpId,
) -> bool {
    match current_consumer {
        None => true,
        Some(consumer) => {
            !model.graph.uses(consumer, producer) && !model.graph.uses(consumer, reload)
        }
    }
}

/// Register assignments for every producer on every core
pub struct RegisterAllocator {
    op2reg: HashMap<OpId, usize>,
    num_loads_from_spilling: usize,
    num_stores_from_spilling: usize,
    num_unspilled_accesses: usize,
    num_spilled_accesses: usize,
}

impl RegisterAllocator {
    pub fn run(
        model: &mut ModelImpl,
        partitioner: &mut Partitioner,
        placer: &Placer,
        memory_allocator: &mut MemoryAllocator,
        linearizer: &mut Linearizer,
    ) -> CompileResult<Self> {
        let mut allocator = RegisterAllocator {
            op2reg: HashMap::new(),
            num_loads_from_spilling: 0,
            num_stores_from_spilling: 0,
            num_unspilled_accesses: 0,
            num_spilled_accesses: 0,
        };
        for ptile in 0..placer.n_ptiles() {
            for pcore in 0..N_CORES_PER_TILE {
                allocator.allocate_reserved_input_registers(
                    model,
                    partitioner,
                    placer,
                    linearizer,
                    ptile,
                    pcore,
                )?;
                allocator.allocate_reserved_output_registers(
                    model,
                    partitioner,
                    placer,
                    linearizer,
                    ptile,
                    pcore,
                )?;
                allocator.allocate_data_registers(
                    model,
                    partitioner,
                    placer,
                    memory_allocator,
                    linearizer,
                    ptile,
                    pcore,
                )?;
            }
        }
        Ok(allocator)
    }

    pub fn is_register_assigned(&self, op: OpId) -> bool {
        self.op2reg.contains_key(&op)
    }

    pub fn register(&self, op: OpId) -> usize {
        *self
            .op2reg
            .get(&op)
            .unwrap_or_else(|| panic!("register not assigned for {}", op))
    }

    pub fn num_spill_load_bytes(&self) -> usize {
        self.num_loads_from_spilling
    }

    pub fn num_spill_store_bytes(&self) -> usize {
        self.num_stores_from_spilling
    }

    pub fn num_unspilled_accesses(&self) -> usize {
        self.num_unspilled_accesses
    }

    pub fn num_spilled_accesses(&self) -> usize {
        self.num_spilled_accesses
    }

    pub(crate) fn assignment_label(&self, op: OpId) -> String {
        if self.is_register_assigned(op) {
            format!("\\nregister = {}", self.register(op))
        } else {
            String::new()
        }
    }

    fn assign_register(&mut self, op: OpId, reg: usize) -> CompileResult<()> {
        if self.op2reg.insert(op, reg).is_some() {
            return Err(CompileError::regalloc(format!(
                "cannot reassign register of {}",
                op
            )));
        }
        Ok(())
    }

    /// Matrix operations read their operands from reserved input
    /// registers
    fn reads_from_reserved_input_register(model: &ModelImpl, op: OpId) -> bool {
        model.graph.op(op).kind.is_matrix_op()
    }

    /// Matrix operations write reserved output registers, except outer
    /// products, which update the matrix in place
    fn writes_to_reserved_output_register(model: &ModelImpl, op: OpId) -> bool {
        match model.graph.op(op).kind {
            OpKind::Mvm { .. } => true,
            OpKind::Training { op_type, .. } => op_type != TrainingOpType::OuterProduct,
            _ => false,
        }
    }

    fn producer_does_not_write_to_register(model: &ModelImpl, op: OpId) -> bool {
        matches!(
            model.graph.op(op).kind,
            OpKind::Training {
                op_type: TrainingOpType::OuterProduct,
                ..
            }
        )
    }

    /// Reserved input register address of the producer feeding a
    /// matrix consumer, derived from (pMVMU, operation type, operand
    /// index). The second outer-product operand aliases the output
    /// register window.
    fn assign_reserved_input_register(
        &mut self,
        model: &ModelImpl,
        partitioner: &Partitioner,
        placer: &Placer,
        producer: OpId,
    ) -> CompileResult<()> {
        if Self::writes_to_reserved_output_register(model, producer) {
            return Err(CompileError::regalloc(format!(
                "{} writes a reserved output register and cannot also hold a reserved input",
                producer
            )));
        }
        if model.graph.op(producer).users.len() != 1 {
            return Err(CompileError::regalloc(format!(
                "{} feeds a matrix operation but has multiple users",
                producer
            )));
        }
        let consumer = *model.graph.op(producer).users.iter().next().unwrap();
        let pmvmu = placer.pmvmu(partitioner, consumer);
        let reg = match model.graph.op(consumer).kind {
            OpKind::Mvm { .. } => INPUT_REGISTERS_START_ADDRESS + pmvmu * MVMU_DIM,
            OpKind::Training { op_type, .. } => match op_type {
                TrainingOpType::Mvm => {
                    INPUT_REGISTERS_START_ADDRESS + pmvmu * N_TRAINING_OPERATIONS * MVMU_DIM
                }
                TrainingOpType::MvmTranspose => {
                    INPUT_REGISTERS_START_ADDRESS
                        + (pmvmu * N_TRAINING_OPERATIONS + 1) * MVMU_DIM
                }
                TrainingOpType::OuterProduct => {
                    if producer == model.graph.op(consumer).operands[0] {
                        INPUT_REGISTERS_START_ADDRESS
                            + (pmvmu * N_TRAINING_OPERATIONS + 2) * MVMU_DIM
                    } else if producer == model.graph.op(consumer).operands[1] {
                        OUTPUT_REGISTERS_START_ADDRESS
                            + (pmvmu * N_TRAINING_OPERATIONS + 2) * MVMU_DIM
                    } else {
                        return Err(CompileError::regalloc(format!(
                            "{} is not an operand of {}",
                            producer, consumer
                        )));
                    }
                }
            },
            _ => {
                return Err(CompileError::regalloc(format!(
                    "{} does not feed a matrix operation",
                    producer
                )))
            }
        };
        self.assign_register(producer, reg)
    }

    fn assign_reserved_output_register(
        &mut self,
        model: &ModelImpl,
        partitioner: &Partitioner,
        placer: &Placer,
        producer: OpId,
    ) -> CompileResult<()> {
        let pmvmu = placer.pmvmu(partitioner, producer);
        let reg = match model.graph.op(producer).kind {
            OpKind::Mvm { .. } => OUTPUT_REGISTERS_START_ADDRESS + pmvmu * MVMU_DIM,
            OpKind::Training { op_type, .. } => match op_type {
                TrainingOpType::Mvm => {
                    OUTPUT_REGISTERS_START_ADDRESS + pmvmu * N_TRAINING_OPERATIONS * MVMU_DIM
                }
                TrainingOpType::MvmTranspose => {
                    OUTPUT_REGISTERS_START_ADDRESS
                        + (pmvmu * N_TRAINING_OPERATIONS + 1) * MVMU_DIM
                }
                TrainingOpType::OuterProduct => {
                    return Err(CompileError::regalloc(
                        "outer products do not write reserved output registers",
                    ))
                }
            },
            _ => {
                return Err(CompileError::regalloc(format!(
                    "{} is not a matrix operation",
                    producer
                )))
            }
        };
        self.assign_register(producer, reg)
    }

    /// Pass 1: reserved input registers, with a reverse walk asserting
    /// disjoint live ranges per register
    fn allocate_reserved_input_registers(
        &mut self,
        model: &ModelImpl,
        partitioner: &Partitioner,
        placer: &Placer,
        linearizer: &Linearizer,
        ptile: usize,
        pcore: usize,
    ) -> CompileResult<()> {
        let list: Vec<OpId> = linearizer.core_list(ptile, pcore).to_vec();
        let mut live_now: BTreeSet<OpId> = BTreeSet::new();
        for &op in list.iter().rev() {
            if model.graph.op(op).kind.is_producer() {
                live_now.remove(&op);
            }
            if Self::reads_from_reserved_input_register(model, op) {
                for o in 0..model.graph.op(op).operands.len() {
                    let producer = model.graph.op(op).operands[o];
                    if live_now.insert(producer) {
                        self.assign_reserved_input_register(model, partitioner, placer, producer)?;
                        for &p in &live_now {
                            if p != producer && self.register(p) == self.register(producer) {
                                return Err(CompileError::regalloc(format!(
                                    "live range conflict between {} and {} on reserved input register {}",
                                    p,
                                    producer,
                                    self.register(producer)
                                )));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Pass 2: reserved output registers, symmetric to pass 1
    fn allocate_reserved_output_registers(
        &mut self,
        model: &ModelImpl,
        partitioner: &Partitioner,
        placer: &Placer,
        linearizer: &Linearizer,
        ptile: usize,
        pcore: usize,
    ) -> CompileResult<()> {
        let list: Vec<OpId> = linearizer.core_list(ptile, pcore).to_vec();
        let mut live_now: BTreeSet<OpId> = BTreeSet::new();
        for &op in list.iter().rev() {
            if model.graph.op(op).kind.is_producer() {
                live_now.remove(&op);
            }
            if model.graph.op(op).kind.is_consumer() {
                for o in 0..model.graph.op(op).operands.len() {
                    let producer = model.graph.op(op).operands[o];
                    if !Self::writes_to_reserved_output_register(model, producer) {
                        continue;
                    }
                    if live_now.insert(producer) {
                        self.assign_reserved_output_register(
                            model,
                            partitioner,
                            placer,
                            producer,
                        )?;
                        for &p in &live_now {
                            if p != producer && self.register(p) == self.register(producer) {
                                return Err(CompileError::regalloc(format!(
                                    "live range conflict between {} and {} on reserved output register {}",
                                    p,
                                    producer,
                                    self.register(producer)
                                )));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Pass 3: general data registers with spilling
    #[allow(clippy::too_many_arguments)]
    fn allocate_data_registers(
        &mut self,
        model: &mut ModelImpl,
        partitioner: &mut Partitioner,
        placer: &Placer,
        memory_allocator: &mut MemoryAllocator,
        linearizer: &mut Linearizer,
        ptile: usize,
        pcore: usize,
    ) -> CompileResult<()> {
        let list: Vec<OpId> = linearizer.core_list(ptile, pcore).to_vec();

        // Backward live-range analysis over general-register values:
        // reserved-window traffic is excluded
        let mut live_in: HashMap<OpId, HashSet<OpId>> = HashMap::new();
        let mut next: Option<OpId> = None;
        for &op in list.iter().rev() {
            let mut set = next
                .map(|n| live_in[&n].clone())
                .unwrap_or_default();
            set.remove(&op);
            if model.graph.op(op).kind.is_consumer()
                && !Self::reads_from_reserved_input_register(model, op)
            {
                for &producer in &model.graph.op(op).operands {
                    if !Self::writes_to_reserved_output_register(model, producer) {
                        set.insert(producer);
                    }
                }
            }
            live_in.insert(op, set);
            next = Some(op);
        }

        let mut allocator = CoreAllocator::new();
        let mut tracker = SpillTracker::default();
        let mut live_now: BTreeSet<OpId> = BTreeSet::new();
        let spill_address_reg = allocator
            .allocate(1)
            .expect("empty register file cannot hold the spill address register");
        let mut new_list: Vec<OpId> = Vec::with_capacity(list.len());

        for idx in 0..list.len() {
            let op = list[idx];
            let live_out: HashSet<OpId> = match list.get(idx + 1) {
                Some(next_op) => live_in[next_op].clone(),
                None => HashSet::new(),
            };
            // Spill/reload code to place immediately before this op
            let mut pending: Vec<OpId> = Vec::new();

            if model.graph.op(op).kind.is_consumer()
                && !Self::reads_from_reserved_input_register(model, op)
            {
                // Make sure every operand is available in a register
                for o in 0..model.graph.op(op).operands.len() {
                    let producer = model.graph.op(op).operands[o];
                    if Self::writes_to_reserved_output_register(model, producer) {
                        continue;
                    }
                    let length = model.graph.op(producer).length;
                    if live_now.contains(&producer) || tracker.is_live_reload(producer) {
                        self.num_unspilled_accesses += length;
                    } else if !tracker.is_spilled(producer) {
                        return Err(CompileError::regalloc(format!(
                            "operand {} of {} is neither live nor spilled",
                            producer, op
                        )));
                    } else if tracker.has_live_reload(producer) {
                        // Reuse the reload that is still in registers
                        self.num_unspilled_accesses += length;
                        let load = tracker.live_reload(producer);
                        model.graph.replace_operand(op, producer, load);
                    } else {
                        // Reload from the spill slot
                        self.num_spilled_accesses += length;
                        let spill_store = tracker.spill_op(producer);
                        let address = memory_allocator.address(spill_store);
                        let seti = model.new_set_immediate(address, 1);
                        partitioner.clone_assignment(producer, seti);
                        self.assign_register(seti, spill_address_reg)?;
                        let load = model.new_load(spill_store);
                        self.num_loads_from_spilling += model.graph.op(load).length;
                        model.add_load_address_operand(load, seti);
                        partitioner.clone_assignment(producer, load);
                        let reg = self.allocate_registers_with_spilling(
                            model,
                            partitioner,
                            memory_allocator,
                            &mut allocator,
                            &mut tracker,
                            &mut live_now,
                            spill_address_reg,
                            &mut pending,
                            Some(op),
                            length,
                        )?;
                        self.assign_register(load, reg)?;
                        model.graph.replace_operand(op, producer, load);
                        pending.push(seti);
                        pending.push(load);
                        tracker.set_live_reload(producer, load)?;
                    }
                }

                // Free registers whose values die here
                for o in 0..model.graph.op(op).operands.len() {
                    let producer = model.graph.op(op).operands[o];
                    if Self::writes_to_reserved_output_register(model, producer) {
                        continue;
                    }
                    let length = model.graph.op(producer).length;
                    if live_now.contains(&producer) {
                        if !live_out.contains(&producer) {
                            live_now.remove(&producer);
                            allocator.free(self.register(producer), length);
                        }
                    } else if tracker.is_live_reload(producer) {
                        let original = tracker.original_producer(producer);
                        if !live_out.contains(&original) {
                            tracker.kill_live_reload(producer);
                            allocator.free(self.register(producer), length);
                        }
                    } else {
                        return Err(CompileError::regalloc(format!(
                            "operand {} of {} is neither a live value nor a spill reload",
                            producer, op
                        )));
                    }
                }
            }

            // Allocate a register for the value this op produces
            if model.graph.op(op).kind.is_producer() {
                if live_in[&op].contains(&op) {
                    return Err(CompileError::regalloc(format!(
                        "{} is live before it is produced",
                        op
                    )));
                }
                if live_out.contains(&op) {
                    let length = model.graph.op(op).length;
                    let current_consumer = if model.graph.op(op).kind.is_consumer() {
                        Some(op)
                    } else {
                        None
                    };
                    let reg = self.allocate_registers_with_spilling(
                        model,
                        partitioner,
                        memory_allocator,
                        &mut allocator,
                        &mut tracker,
                        &mut live_now,
                        spill_address_reg,
                        &mut pending,
                        current_consumer,
                        length,
                    )?;
                    self.assign_register(op, reg)?;
                    live_now.insert(op);
                } else if !self.is_register_assigned(op)
                    && !Self::producer_does_not_write_to_register(model, op)
                {
                    return Err(CompileError::regalloc(format!(
                        "{} produces a dead value with no reserved register",
                        op
                    )));
                }
            }

            new_list.extend(pending);
            new_list.push(op);
        }

        *linearizer.core_list_mut(ptile, pcore) = new_list;
        Ok(())
    }

    /// Allocate a contiguous register run, making room by killing
    /// unneeded reloads first and spilling live values second
    #[allow(clippy::too_many_arguments)]
    fn allocate_registers_with_spilling(
        &mut self,
        model: &mut ModelImpl,
        partitioner: &mut Partitioner,
        memory_allocator: &mut MemoryAllocator,
        allocator: &mut CoreAllocator,
        tracker: &mut SpillTracker,
        live_now: &mut BTreeSet<OpId>,
        spill_address_reg: usize,
        pending: &mut Vec<OpId>,
        current_consumer: Option<OpId>,
        length: usize,
    ) -> CompileResult<usize> {
        if let Some(reg) = allocator.allocate(length) {
            return Ok(reg);
        }
        // Kill live reloads the current operation does not need
        for (producer_to_kill, reload_to_kill) in tracker.reloads_snapshot() {
            if reload_may_be_killed(model, current_consumer, producer_to_kill, reload_to_kill) {
                tracker.kill_live_reload(reload_to_kill);
                allocator.free(
                    self.register(reload_to_kill),
                    model.graph.op(reload_to_kill).length,
                );
                if let Some(reg) = allocator.allocate(length) {
                    return Ok(reg);
                }
            }
        }
        // Spill live values the current operation does not need
        let candidates: Vec<OpId> = live_now.iter().copied().collect();
        for spill_candidate in candidates {
            let used = current_consumer
                .map(|consumer| model.graph.uses(consumer, spill_candidate))
                .unwrap_or(false);
            if used {
                continue;
            }
            let candidate_length = model.graph.op(spill_candidate).length;
            let address =
                memory_allocator.memalloc(partitioner.vtile(spill_candidate), candidate_length);
            let seti = model.new_set_immediate(address, 1);
            partitioner.clone_assignment(spill_candidate, seti);
            self.assign_register(seti, spill_address_reg)?;
            let store = model.new_store(spill_candidate);
            self.num_stores_from_spilling += candidate_length;
            partitioner.clone_assignment(spill_candidate, store);
            memory_allocator.assign(store, address);
            model.add_store_address_operand(store, seti);
            pending.push(seti);
            pending.push(store);
            live_now.remove(&spill_candidate);
            tracker.set_spill(spill_candidate, store)?;
            allocator.free(self.register(spill_candidate), candidate_length);
            if let Some(reg) = allocator.allocate(length) {
                return Ok(reg);
            }
        }
        Err(CompileError::regalloc(
            "cannot find enough registers to spill; the program does not fit",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coalescer::Coalescer;
    use crate::model::{GraphPartitioningScheme, Model};
    use crate::partitioner::KahipOracle;
    use crate::tensors::{
        ConstantMatrix, InputVector, OuterProduct, OutputVector, TrainingMatrix, Vector,
    };

    struct Compiled {
        placer: Placer,
        memory_allocator: MemoryAllocator,
        linearizer: Linearizer,
        register_allocator: RegisterAllocator,
    }

    fn run_backend(model: &Model, coalesce: bool) -> Compiled {
        let inner = model.inner();
        let mut m = inner.borrow_mut();
        let mut partitioner =
            Partitioner::run(&mut m, GraphPartitioningScheme::RowMajor, &KahipOracle).unwrap();
        let placer = Placer::run(&m, &partitioner).unwrap();
        let mut memory_allocator =
            MemoryAllocator::run(&mut m, &mut partitioner).unwrap();
        let coalescer = if coalesce {
            Some(Coalescer::run(&m, &partitioner, &placer).unwrap())
        } else {
            None
        };
        let mut linearizer =
            Linearizer::run(&mut m, &mut partitioner, &placer, coalescer.as_ref()).unwrap();
        let register_allocator = RegisterAllocator::run(
            &mut m,
            &mut partitioner,
            &placer,
            &mut memory_allocator,
            &mut linearizer,
        )
        .unwrap();
        Compiled {
            placer,
            memory_allocator,
            linearizer,
            register_allocator,
        }
    }

    #[test]
    fn test_core_allocator_first_fit_and_free() {
        let mut allocator = CoreAllocator::new();
        let a = allocator.allocate(4).unwrap();
        assert_eq!(a, REGISTER_FILE_START_ADDRESS);
        let b = allocator.allocate(4).unwrap();
        assert_eq!(b, REGISTER_FILE_START_ADDRESS + 4);
        allocator.free(a, 4);
        let c = allocator.allocate(2).unwrap();
        assert_eq!(c, REGISTER_FILE_START_ADDRESS);
        let d = allocator.allocate(4).unwrap();
        assert_eq!(d, REGISTER_FILE_START_ADDRESS + 8);
        assert!(allocator.allocate(REGISTER_FILE_SIZE).is_none());
    }

    #[test]
    fn test_reserved_register_addresses_for_simple_mvm() {
        let model = Model::new("reserved");
        let input = InputVector::new(&model, "in", 5);
        let matrix = ConstantMatrix::new(&model, "m", 5, 5);
        let out = OutputVector::new(&model, "out", 5);
        let y = &matrix * &Vector::from(&input);
        out.assign(&y);
        let compiled = run_backend(&model, false);
        let inner = model.inner().borrow();
        let mvm = inner
            .graph
            .ids()
            .find(|&op| inner.graph.op(op).kind.is_matrix_op())
            .unwrap();
        // Operand copy sits in the reserved input window of pMVMU 0
        let operand = inner.graph.op(mvm).operands[0];
        assert_eq!(
            compiled.register_allocator.register(operand),
            INPUT_REGISTERS_START_ADDRESS
        );
        // The MVM writes the reserved output window of pMVMU 0
        assert_eq!(
            compiled.register_allocator.register(mvm),
            OUTPUT_REGISTERS_START_ADDRESS
        );
    }

    #[test]
    fn test_outer_product_second_operand_aliases_output_window() {
        let model = Model::new("outer");
        let x1 = InputVector::new(&model, "x1", 128);
        let x2 = InputVector::new(&model, "x2", 128);
        let mut matrix = TrainingMatrix::new(&model, "w", 128, 128);
        matrix -= OuterProduct::new(&Vector::from(&x1), &Vector::from(&x2));
        let compiled = run_backend(&model, false);
        let inner = model.inner().borrow();
        let outer = inner
            .graph
            .ids()
            .find(|&op| {
                matches!(
                    inner.graph.op(op).kind,
                    OpKind::Training {
                        op_type: TrainingOpType::OuterProduct,
                        ..
                    }
                )
            })
            .unwrap();
        let first = inner.graph.op(outer).operands[0];
        let second = inner.graph.op(outer).operands[1];
        assert_eq!(
            compiled.register_allocator.register(first),
            INPUT_REGISTERS_START_ADDRESS + 2 * MVMU_DIM
        );
        assert_eq!(
            compiled.register_allocator.register(second),
            OUTPUT_REGISTERS_START_ADDRESS + 2 * MVMU_DIM
        );
        // The outer product itself writes no register
        assert!(!compiled.register_allocator.is_register_assigned(outer));
    }

    #[test]
    fn test_spilling_round_trip() {
        // Thirteen 128-long values all live at once exceed the 1536
        // general registers (minus the spill address register)
        let model = Model::new("spill");
        let input = InputVector::new(&model, "in", 128);
        let matrix = ConstantMatrix::new(&model, "m", 128, 128);
        let out = OutputVector::new(&model, "out", 128);
        let y = &matrix * &Vector::from(&input);
        let vs: Vec<Vector> = (0..13).map(|i| (i as f32 + 2.0) * &y).collect();
        let mut acc = vs[12].clone();
        for i in (0..12).rev() {
            acc = &vs[i] + &acc;
        }
        out.assign(&acc);
        let compiled = run_backend(&model, false);
        assert!(compiled.register_allocator.num_spill_store_bytes() > 0);
        assert!(compiled.register_allocator.num_spill_load_bytes() > 0);
        assert!(compiled.register_allocator.num_spilled_accesses() > 0);

        // Every reload reads the store it was spilled to, through a
        // SetImmediate carrying that store's address
        let inner = model.inner().borrow();
        let mut checked = 0;
        for ptile in 0..compiled.placer.n_ptiles() {
            for pcore in 0..N_CORES_PER_TILE {
                for &op in compiled.linearizer.core_list(ptile, pcore) {
                    if !matches!(inner.graph.op(op).kind, OpKind::Load) {
                        continue;
                    }
                    let src = inner.graph.op(op).mem_srcs[0];
                    if !matches!(inner.graph.op(src).kind, OpKind::Store) {
                        continue;
                    }
                    let seti = inner.graph.op(op).operands[0];
                    match inner.graph.op(seti).kind {
                        OpKind::SetImmediate { imm } => {
                            assert_eq!(imm, compiled.memory_allocator.address(src));
                            checked += 1;
                        }
                        _ => panic!("reload address operand must be a SetImmediate"),
                    }
                }
            }
        }
        assert!(checked > 0);
    }

    #[test]
    fn test_reload_kill_guard_spares_current_operands() {
        let model = Model::new("guard");
        let input = InputVector::new(&model, "in", 8);
        let matrix = ConstantMatrix::new(&model, "m", 8, 8);
        let out = OutputVector::new(&model, "out", 8);
        let y = &matrix * &Vector::from(&input);
        out.assign(&y);
        let inner = model.inner();
        let mut m = inner.borrow_mut();
        // Hand-built fragment: consumer `add` reads `a` directly and
        // `b` through its reload
        let a = m.new_set_immediate(1, 8);
        let b = m.new_set_immediate(2, 8);
        let reload_b = {
            let store = m.new_store(b);
            m.new_load(store)
        };
        let add = m.new_alu(crate::graph::AluOp::Add, a, Some(reload_b));
        assert!(!reload_may_be_killed(&m, Some(add), a, reload_b));
        assert!(!reload_may_be_killed(&m, Some(add), b, reload_b));
        let unrelated = m.new_set_immediate(3, 8);
        let unrelated_reload = {
            let store = m.new_store(unrelated);
            m.new_load(store)
        };
        assert!(reload_may_be_killed(
            &m,
            Some(add),
            unrelated,
            unrelated_reload
        ));
        assert!(reload_may_be_killed(&m, None, a, reload_b));
    }
}
