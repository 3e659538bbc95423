//! Operation DAG for the compiler back end
//!
//! Operations live in an arena owned by the model and are referenced by
//! `OpId` handles. Capabilities that the hardware distinguishes
//! (producing a register value, consuming register operands, touching
//! tile memory, executing on a core vs. on the tile controller) are
//! predicates over the operation kind; the cross-cutting relations
//! (consumer sets of a producer, reader sets of a tile-memory write)
//! live in per-node edge tables rather than owning pointers, so the
//! graph has no reference cycles.

use std::collections::BTreeSet;
use std::fmt;

use crate::tensors::{CmatTileId, InputTileId, OutputTileId, TmatTileId};

/// Handle to an operation in the model's graph arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub(crate) usize);

impl OpId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// The three operations a training MVMU can perform on its weight tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrainingOpType {
    /// Forward pass MVM
    Mvm,
    /// Backward pass MVM on the transposed weights
    MvmTranspose,
    /// Outer-product weight update; produces no register value
    OuterProduct,
}

impl TrainingOpType {
    pub const ALL: [TrainingOpType; 3] = [
        TrainingOpType::Mvm,
        TrainingOpType::MvmTranspose,
        TrainingOpType::OuterProduct,
    ];

    /// Slot index within a training MVMU
    pub fn index(self) -> usize {
        match self {
            TrainingOpType::Mvm => 0,
            TrainingOpType::MvmTranspose => 1,
            TrainingOpType::OuterProduct => 2,
        }
    }
}

/// Opcodes of the per-core vector ALU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    Mul,
    Div,
    Muli,
    And,
    Or,
    Not,
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
    Min,
    Max,
    Mse,
    Sig,
    Tanh,
    Exp,
    Log,
    Relu,
    Relud,
    LogSoftmax,
    LogSoftmaxd,
    Rndcmp,
}

impl AluOp {
    /// Takes an immediate scalar instead of a second register operand
    pub fn is_immediate(self) -> bool {
        matches!(self, AluOp::Muli)
    }

    /// Requires two register operands of equal length
    pub fn is_binary(self) -> bool {
        matches!(
            self,
            AluOp::Add
                | AluOp::Sub
                | AluOp::Mul
                | AluOp::Div
                | AluOp::And
                | AluOp::Or
                | AluOp::Eq
                | AluOp::Neq
                | AluOp::Lt
                | AluOp::Leq
                | AluOp::Gt
                | AluOp::Geq
                | AluOp::Min
                | AluOp::Max
                | AluOp::Mse
        )
    }

    /// Mnemonic used in emitted code
    pub fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Sub => "sub",
            AluOp::Mul | AluOp::Muli => "mul",
            AluOp::Div => "div",
            AluOp::And => "and",
            AluOp::Or => "or",
            AluOp::Not => "not",
            AluOp::Eq => "eq",
            AluOp::Neq => "neq",
            AluOp::Lt => "lt",
            AluOp::Leq => "leq",
            AluOp::Gt => "gt",
            AluOp::Geq => "geq",
            AluOp::Min => "min",
            AluOp::Max => "max",
            AluOp::Mse => "mse",
            AluOp::Sig => "sig",
            AluOp::Tanh => "tanh",
            AluOp::Exp => "exp",
            AluOp::Log => "log",
            AluOp::Relu => "relu",
            AluOp::Relud => "relud",
            AluOp::LogSoftmax => "log_softmax",
            AluOp::LogSoftmaxd => "log_softmaxd",
            AluOp::Rndcmp => "rndcmp",
        }
    }
}

/// Concrete operation variants
#[derive(Debug, Clone)]
pub enum OpKind {
    /// Matrix-vector product against one constant matrix tile
    Mvm { matrix: CmatTileId },
    /// Matrix operation against one training matrix tile
    Training {
        matrix: TmatTileId,
        op_type: TrainingOpType,
    },
    /// Element-wise vector ALU operation; `imm` only meaningful for MULI
    Alu { op: AluOp, imm: f32 },
    /// Writes a constant into a register
    SetImmediate { imm: usize },
    /// Register-to-register move
    Copy,
    /// Tile memory -> register
    Load,
    /// Register -> tile memory
    Store,
    /// Tile memory -> remote tile; `dst` is the paired receive
    Send { dst: Option<OpId> },
    /// Remote tile -> tile memory; `src` is the paired send
    Receive { src: OpId },
    /// Materializes an external input tile into tile memory
    WriteInput { src: InputTileId },
    /// Externally visible sink reading tile memory
    ReadOutput { dst: OutputTileId },
    /// Transient stand-in for an external input, removed by partitioning
    PseudoInput { src: InputTileId },
    /// Transient stand-in for an external output, removed by partitioning
    PseudoOutput { dst: OutputTileId },
}

impl OpKind {
    /// Writes a register value readable by consumers
    pub fn is_producer(&self) -> bool {
        matches!(
            self,
            OpKind::Mvm { .. }
                | OpKind::Training { .. }
                | OpKind::Alu { .. }
                | OpKind::SetImmediate { .. }
                | OpKind::Copy
                | OpKind::Load
                | OpKind::PseudoInput { .. }
        )
    }

    /// Reads an ordered list of register operands
    pub fn is_consumer(&self) -> bool {
        matches!(
            self,
            OpKind::Mvm { .. }
                | OpKind::Training { .. }
                | OpKind::Alu { .. }
                | OpKind::Copy
                | OpKind::Load
                | OpKind::Store
                | OpKind::PseudoOutput { .. }
        )
    }

    pub fn writes_tile_memory(&self) -> bool {
        matches!(
            self,
            OpKind::Store | OpKind::Receive { .. } | OpKind::WriteInput { .. }
        )
    }

    pub fn reads_tile_memory(&self) -> bool {
        matches!(
            self,
            OpKind::Load | OpKind::Send { .. } | OpKind::ReadOutput { .. }
        )
    }

    /// Executes in a core's instruction stream
    pub fn is_core_op(&self) -> bool {
        matches!(
            self,
            OpKind::Mvm { .. }
                | OpKind::Training { .. }
                | OpKind::Alu { .. }
                | OpKind::SetImmediate { .. }
                | OpKind::Copy
                | OpKind::Load
                | OpKind::Store
        )
    }

    /// Executes in a tile's instruction stream
    pub fn is_tile_op(&self) -> bool {
        matches!(
            self,
            OpKind::Send { .. }
                | OpKind::Receive { .. }
                | OpKind::WriteInput { .. }
                | OpKind::ReadOutput { .. }
        )
    }

    /// Reads reserved input registers and writes reserved output registers
    pub fn is_matrix_op(&self) -> bool {
        matches!(self, OpKind::Mvm { .. } | OpKind::Training { .. })
    }

    pub fn is_pseudo(&self) -> bool {
        matches!(self, OpKind::PseudoInput { .. } | OpKind::PseudoOutput { .. })
    }

    /// Short label for diagnostics and graph dumps
    pub fn label(&self) -> String {
        match self {
            OpKind::Mvm { .. } => "MVM".to_string(),
            OpKind::Training { op_type, .. } => match op_type {
                TrainingOpType::Mvm => "TrainMVM".to_string(),
                TrainingOpType::MvmTranspose => "TrainMVMTranspose".to_string(),
                TrainingOpType::OuterProduct => "OuterProduct".to_string(),
            },
            OpKind::Alu { op, .. } => op.mnemonic().to_uppercase(),
            OpKind::SetImmediate { imm } => format!("Set {}", imm),
            OpKind::Copy => "Copy".to_string(),
            OpKind::Load => "Load".to_string(),
            OpKind::Store => "Store".to_string(),
            OpKind::Send { .. } => "Send".to_string(),
            OpKind::Receive { .. } => "Receive".to_string(),
            OpKind::WriteInput { .. } => "WriteInput".to_string(),
            OpKind::ReadOutput { .. } => "ReadOutput".to_string(),
            OpKind::PseudoInput { .. } => "PseudoInput".to_string(),
            OpKind::PseudoOutput { .. } => "PseudoOutput".to_string(),
        }
    }
}

/// One operation node plus its edge tables
#[derive(Debug)]
pub struct OpNode {
    pub kind: OpKind,
    /// Scalars produced/consumed per firing
    pub length: usize,
    /// Register operands, in consumption order
    pub operands: Vec<OpId>,
    /// Consumers of this node's register value
    pub users: BTreeSet<OpId>,
    /// Tile-memory writes this node reads, in order
    pub mem_srcs: Vec<OpId>,
    /// Tile-memory reads of this node's write
    pub mem_users: BTreeSet<OpId>,
    /// Cleared when the node is unlinked from the graph
    pub alive: bool,
}

/// Arena of operations
#[derive(Debug, Default)]
pub struct Graph {
    ops: Vec<OpNode>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: OpKind, length: usize) -> OpId {
        let id = OpId(self.ops.len());
        self.ops.push(OpNode {
            kind,
            length,
            operands: Vec::new(),
            users: BTreeSet::new(),
            mem_srcs: Vec::new(),
            mem_users: BTreeSet::new(),
            alive: true,
        });
        id
    }

    pub fn op(&self, id: OpId) -> &OpNode {
        &self.ops[id.0]
    }

    pub fn op_mut(&mut self, id: OpId) -> &mut OpNode {
        &mut self.ops[id.0]
    }

    /// Live operations, in creation order
    pub fn ids(&self) -> impl Iterator<Item = OpId> + '_ {
        self.ops
            .iter()
            .enumerate()
            .filter(|(_, node)| node.alive)
            .map(|(i, _)| OpId(i))
    }

    /// Snapshot of the live id range; safe to iterate while adding ops
    pub fn ids_snapshot(&self) -> Vec<OpId> {
        self.ids().collect()
    }

    pub fn num_ops(&self) -> usize {
        self.ops.iter().filter(|node| node.alive).count()
    }

    /// Register a register-operand edge
    pub fn add_operand(&mut self, consumer: OpId, producer: OpId) {
        debug_assert!(self.op(consumer).kind.is_consumer());
        debug_assert!(self.op(producer).kind.is_producer());
        self.op_mut(consumer).operands.push(producer);
        self.op_mut(producer).users.insert(consumer);
    }

    /// Register a tile-memory edge
    pub fn add_mem_src(&mut self, read: OpId, write: OpId) {
        debug_assert!(self.op(read).kind.reads_tile_memory());
        debug_assert!(self.op(write).kind.writes_tile_memory());
        self.op_mut(read).mem_srcs.push(write);
        self.op_mut(write).mem_users.insert(read);
    }

    /// Whether `consumer` reads `producer` through any operand slot
    pub fn uses(&self, consumer: OpId, producer: OpId) -> bool {
        self.op(consumer).operands.contains(&producer)
    }

    /// Redirect every operand slot holding `old` to `new`
    pub fn replace_operand(&mut self, consumer: OpId, old: OpId, new: OpId) {
        let mut replaced = false;
        for slot in self.ops[consumer.0].operands.iter_mut() {
            if *slot == old {
                *slot = new;
                replaced = true;
            }
        }
        if replaced {
            self.op_mut(old).users.remove(&consumer);
            self.op_mut(new).users.insert(consumer);
        }
    }

    /// Redirect the tile-memory source slot holding `old` to `new`
    pub fn replace_mem_src(&mut self, read: OpId, old: OpId, new: OpId) {
        let mut replaced = false;
        for slot in self.ops[read.0].mem_srcs.iter_mut() {
            if *slot == old {
                *slot = new;
                replaced = true;
            }
        }
        assert!(replaced, "tile memory source to be replaced not found");
        self.op_mut(old).mem_users.remove(&read);
        self.op_mut(new).mem_users.insert(read);
    }

    pub fn remove_user(&mut self, producer: OpId, consumer: OpId) {
        self.op_mut(producer).users.remove(&consumer);
    }

    /// Tombstone an operation; the caller must already have rewired its
    /// neighbors away from it
    pub fn unlink(&mut self, id: OpId) {
        self.op_mut(id).alive = false;
    }

    /// Paired receive of a send
    pub fn send_dst(&self, send: OpId) -> Option<OpId> {
        match self.op(send).kind {
            OpKind::Send { dst } => dst,
            _ => panic!("{} is not a send", send),
        }
    }

    pub fn set_send_dst(&mut self, send: OpId, recv: OpId) {
        match &mut self.op_mut(send).kind {
            OpKind::Send { dst } => {
                assert!(dst.is_none(), "cannot reset destination of a send");
                *dst = Some(recv);
            }
            _ => panic!("{} is not a send", send),
        }
    }

    /// Paired send of a receive
    pub fn recv_src(&self, recv: OpId) -> OpId {
        match self.op(recv).kind {
            OpKind::Receive { src } => src,
            _ => panic!("{} is not a receive", recv),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operand_wiring() {
        let mut graph = Graph::new();
        let a = graph.add(OpKind::SetImmediate { imm: 3 }, 1);
        let b = graph.add(OpKind::Copy, 1);
        graph.add_operand(b, a);
        assert!(graph.uses(b, a));
        assert_eq!(graph.op(a).users.iter().copied().collect::<Vec<_>>(), vec![b]);
    }

    #[test]
    fn test_replace_operand_rewires_all_slots() {
        let mut graph = Graph::new();
        let a = graph.add(OpKind::SetImmediate { imm: 0 }, 4);
        let b = graph.add(OpKind::SetImmediate { imm: 1 }, 4);
        let add = graph.add(
            OpKind::Alu {
                op: AluOp::Add,
                imm: 0.0,
            },
            4,
        );
        graph.add_operand(add, a);
        graph.add_operand(add, a);
        graph.replace_operand(add, a, b);
        assert_eq!(graph.op(add).operands, vec![b, b]);
        assert!(graph.op(a).users.is_empty());
        assert!(graph.op(b).users.contains(&add));
    }

    #[test]
    fn test_unlink_hides_from_iteration() {
        let mut graph = Graph::new();
        let a = graph.add(OpKind::Copy, 1);
        let b = graph.add(OpKind::Copy, 1);
        graph.unlink(a);
        assert_eq!(graph.ids_snapshot(), vec![b]);
        assert_eq!(graph.num_ops(), 1);
    }

    #[test]
    fn test_send_receive_pairing() {
        let mut graph = Graph::new();
        let store = graph.add(OpKind::Store, 8);
        let send = graph.add(OpKind::Send { dst: None }, 8);
        graph.add_mem_src(send, store);
        let recv = graph.add(OpKind::Receive { src: send }, 8);
        graph.set_send_dst(send, recv);
        assert_eq!(graph.send_dst(send), Some(recv));
        assert_eq!(graph.recv_src(recv), send);
        assert!(graph.op(store).mem_users.contains(&send));
    }

    #[test]
    fn test_capability_predicates() {
        assert!(OpKind::Load.is_producer());
        assert!(OpKind::Load.is_consumer());
        assert!(OpKind::Load.reads_tile_memory());
        assert!(OpKind::Load.is_core_op());
        assert!(!OpKind::Store.is_producer());
        assert!(OpKind::Store.writes_tile_memory());
        assert!(OpKind::Send { dst: None }.is_tile_op());
        assert!(!OpKind::Send { dst: None }.is_core_op());
        assert!(OpKind::PseudoInput {
            src: InputTileId(0)
        }
        .is_pseudo());
    }
}
