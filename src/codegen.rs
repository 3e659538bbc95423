//! Code generation: textual per-tile and per-core instruction streams
//!
//! For every physical tile, one `<model>-tile<P>.puma` file holds the
//! tile operations (sends and receives; write-input and read-output
//! emit nothing) terminated by `halt()`, and one
//! `<model>-tile<P>-core<C>.puma` file per core holds the linearized
//! core operations terminated by `hlt()`. The emitted text is the
//! handoff format to the assembler and simulator, so field order and
//! spelling matter.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::coalescer::{CoalescedSet, Coalescer};
use crate::error::{CompileError, CompileResult};
use crate::graph::{OpId, OpKind, TrainingOpType};
use crate::hardware::{
    transfer_width, MAX_LOAD_STORE_WIDTH, MAX_SEND_RECV_WIDTH, N_CONSTANT_MVMUS_PER_CORE,
    N_CORES_PER_TILE, N_TRAINING_MVMUS_PER_CORE, N_TRAINING_OPERATIONS,
};
use crate::linearizer::Linearizer;
use crate::memalloc::MemoryAllocator;
use crate::model::ModelImpl;
use crate::partitioner::Partitioner;
use crate::placer::Placer;
use crate::regalloc::RegisterAllocator;

#[allow(clippy::too_many_arguments)]
pub(crate) fn generate(
    model: &ModelImpl,
    partitioner: &Partitioner,
    placer: &Placer,
    memory_allocator: &MemoryAllocator,
    coalescer: Option<&Coalescer>,
    linearizer: &Linearizer,
    register_allocator: &RegisterAllocator,
    output_dir: &Path,
) -> CompileResult<()> {
    for ptile in 0..placer.n_ptiles() {
        let mut tile_code =
            fs::File::create(output_dir.join(format!("{}-tile{}.puma", model.name(), ptile)))?;
        for &op in linearizer.tile_list(ptile) {
            let text = match model.graph.op(op).kind {
                OpKind::Send { .. } => emit_send(model, partitioner, placer, memory_allocator, op),
                OpKind::Receive { .. } => {
                    emit_receive(model, partitioner, placer, memory_allocator, op)
                }
                // Handled by the external data tooling
                OpKind::WriteInput { .. } | OpKind::ReadOutput { .. } => String::new(),
                _ => {
                    return Err(CompileError::codegen(format!(
                        "{} is not a tile operation",
                        op
                    )))
                }
            };
            tile_code.write_all(text.as_bytes())?;
        }
        tile_code.write_all(b"halt()\n")?;

        for pcore in 0..N_CORES_PER_TILE {
            let mut core_code = fs::File::create(
                output_dir.join(format!("{}-tile{}-core{}.puma", model.name(), ptile, pcore)),
            )?;
            for &op in linearizer.core_list(ptile, pcore) {
                let text = match model.graph.op(op).kind {
                    OpKind::Mvm { .. } => emit_mvm(partitioner, placer, coalescer, op),
                    OpKind::Training { op_type, .. } => {
                        emit_training(partitioner, placer, coalescer, op, op_type)
                    }
                    OpKind::Alu { op: alu, imm } => {
                        emit_alu(model, register_allocator, op, alu, imm)
                    }
                    OpKind::SetImmediate { imm } => {
                        emit_set_immediate(model, register_allocator, op, imm)
                    }
                    OpKind::Copy => emit_copy(model, register_allocator, op),
                    OpKind::Load => emit_load(model, register_allocator, op),
                    OpKind::Store => emit_store(model, register_allocator, op),
                    _ => {
                        return Err(CompileError::codegen(format!(
                            "{} is not a core operation",
                            op
                        )))
                    }
                };
                core_code.write_all(text.as_bytes())?;
            }
            core_code.write_all(b"hlt()\n")?;
        }
    }
    Ok(())
}

fn emit_coalesced_mvm(set: &CoalescedSet) -> String {
    let mut bitmap = String::with_capacity(N_CONSTANT_MVMUS_PER_CORE);
    for slot in 0..N_CONSTANT_MVMUS_PER_CORE {
        bitmap.push(if set.uses_slot(slot) { '1' } else { '0' });
    }
    format!("mvm(['{}'])\n", bitmap)
}

fn emit_mvm(
    partitioner: &Partitioner,
    placer: &Placer,
    coalescer: Option<&Coalescer>,
    op: OpId,
) -> String {
    if let Some(set) = coalescer.and_then(|c| c.set_of(op)) {
        // One member emits the wide instruction for the whole set
        if set.leader() == op {
            return emit_coalesced_mvm(set);
        }
        return String::new();
    }
    let pmvmu = placer.pmvmu(partitioner, op);
    let mut bitmap = String::with_capacity(N_CONSTANT_MVMUS_PER_CORE);
    for slot in 0..N_CONSTANT_MVMUS_PER_CORE {
        bitmap.push(if slot == pmvmu { '1' } else { '0' });
    }
    format!("mvm(['{}'])\n", bitmap)
}

fn emit_coalesced_training(set: &CoalescedSet) -> String {
    let mut out = String::from("train([");
    for pmvmu in 0..N_TRAINING_MVMUS_PER_CORE {
        out.push('\'');
        for t in 0..N_TRAINING_OPERATIONS {
            out.push(if set.uses_slot(pmvmu * N_TRAINING_OPERATIONS + t) {
                '1'
            } else {
                '0'
            });
        }
        out.push('\'');
    }
    out.push_str("])\n");
    out
}

fn emit_training(
    partitioner: &Partitioner,
    placer: &Placer,
    coalescer: Option<&Coalescer>,
    op: OpId,
    op_type: TrainingOpType,
) -> String {
    if let Some(set) = coalescer.and_then(|c| c.set_of(op)) {
        if set.leader() == op {
            return emit_coalesced_training(set);
        }
        return String::new();
    }
    let pmvmu = placer.pmvmu(partitioner, op);
    let mut out = String::from("train([");
    for p in 0..N_TRAINING_MVMUS_PER_CORE {
        out.push('\'');
        for t in 0..N_TRAINING_OPERATIONS {
            out.push(if p == pmvmu && t == op_type.index() {
                '1'
            } else {
                '0'
            });
        }
        out.push('\'');
    }
    out.push_str("])\n");
    out
}

fn emit_alu(
    model: &ModelImpl,
    register_allocator: &RegisterAllocator,
    op: OpId,
    alu: crate::graph::AluOp,
    imm: f32,
) -> String {
    let node = model.graph.op(op);
    let mut out = String::from("alu");
    if alu.is_immediate() {
        out.push('i');
    }
    out.push_str(&format!(
        "('{}', d1={}, r1={}, ",
        alu.mnemonic(),
        register_allocator.register(op),
        register_allocator.register(node.operands[0])
    ));
    if node.operands.len() > 1 {
        out.push_str(&format!(
            "r2={}, ",
            register_allocator.register(node.operands[1])
        ));
    }
    if alu.is_immediate() {
        out.push_str(&format!("imm={}, ", imm));
    }
    out.push_str(&format!("vec={})\n", node.length));
    out
}

fn emit_set_immediate(
    model: &ModelImpl,
    register_allocator: &RegisterAllocator,
    op: OpId,
    imm: usize,
) -> String {
    format!(
        "set(d1={}, imm={}, vec={})\n",
        register_allocator.register(op),
        imm,
        model.graph.op(op).length
    )
}

fn emit_copy(model: &ModelImpl, register_allocator: &RegisterAllocator, op: OpId) -> String {
    let node = model.graph.op(op);
    format!(
        "copy(d1={}, r1={}, vec={}, src_type=1)\n",
        register_allocator.register(op),
        register_allocator.register(node.operands[0]),
        node.length
    )
}

fn emit_load(model: &ModelImpl, register_allocator: &RegisterAllocator, op: OpId) -> String {
    let node = model.graph.op(op);
    let width = transfer_width(node.length, MAX_LOAD_STORE_WIDTH);
    format!(
        "load(d1={}, r1={}, load_width={}, vec={})\n",
        register_allocator.register(op),
        register_allocator.register(node.operands[0]),
        width,
        node.length / width
    )
}

fn emit_store(model: &ModelImpl, register_allocator: &RegisterAllocator, op: OpId) -> String {
    let node = model.graph.op(op);
    let width = transfer_width(node.length, MAX_LOAD_STORE_WIDTH);
    format!(
        "store(d1={}, r1={}, counter={}, store_width={}, vec={})\n",
        register_allocator.register(node.operands[1]),
        register_allocator.register(node.operands[0]),
        node.mem_users.len(),
        width,
        node.length / width
    )
}

fn emit_send(
    model: &ModelImpl,
    partitioner: &Partitioner,
    placer: &Placer,
    memory_allocator: &MemoryAllocator,
    op: OpId,
) -> String {
    let node = model.graph.op(op);
    let width = transfer_width(node.length, MAX_SEND_RECV_WIDTH);
    let dst = model.graph.send_dst(op).expect("send without a receive");
    format!(
        "send(mem_addr={}, vtile_id={}, send_width={}, target_addr={}, vec={})\n",
        memory_allocator.address(node.mem_srcs[0]),
        placer.ptile(partitioner, op),
        width,
        placer.ptile(partitioner, dst),
        node.length / width
    )
}

fn emit_receive(
    model: &ModelImpl,
    partitioner: &Partitioner,
    placer: &Placer,
    memory_allocator: &MemoryAllocator,
    op: OpId,
) -> String {
    let node = model.graph.op(op);
    let width = transfer_width(node.length, MAX_SEND_RECV_WIDTH);
    let src = model.graph.recv_src(op);
    format!(
        "receive(mem_addr={}, vtile_id={}, receive_width={}, counter={}, vec={})\n",
        memory_allocator.address(op),
        placer.ptile(partitioner, src),
        width,
        node.mem_users.len(),
        node.length / width
    )
}
