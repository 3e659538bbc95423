//! Model ownership and the compilation driver
//!
//! A `Model` owns every tensor and operation created through the DSL
//! and runs the back-end pass pipeline: partitioning, placement, tile
//! memory allocation, coalescing, linearization, register allocation,
//! and code generation. Each pass annotates the graph monotonically;
//! no pass rewrites an earlier pass's annotations.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::info;
use serde::{Deserialize, Serialize};

use crate::coalescer::Coalescer;
use crate::codegen;
use crate::error::{CompileError, CompileResult};
use crate::graph::{AluOp, Graph, OpId, OpKind, TrainingOpType};
use crate::hardware::{MVMU_DIM, N_CONSTANT_MVMUS_PER_CORE, N_TRAINING_MVMUS_PER_CORE};
use crate::linearizer::Linearizer;
use crate::memalloc::MemoryAllocator;
use crate::partitioner::{GraphPartitionOracle, KahipOracle, Partitioner};
use crate::placer::Placer;
use crate::regalloc::RegisterAllocator;
use crate::tensors::{
    CmatTileId, ConstMatrixData, ConvMatrixData, InStreamTileData, InputStreamData,
    InputTileId, InputVectorData, IoTile, MatTile, OutStreamTileData, OutputStreamData,
    OutputTileId, OutputVectorData, StreamData, StreamTileData, TmatTileId, TrainMatrixData,
    VectorData,
};

/// How matrix tiles are distributed over virtual MVMUs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphPartitioningScheme {
    RowMajor,
    ColMajor,
    Kahip,
    Random,
}

impl GraphPartitioningScheme {
    /// Name used in the compilation report
    pub fn report_name(self) -> &'static str {
        match self {
            GraphPartitioningScheme::RowMajor => "row major",
            GraphPartitioningScheme::ColMajor => "column major",
            GraphPartitioningScheme::Kahip => "KaHIP",
            GraphPartitioningScheme::Random => "random",
        }
    }
}

/// Options controlling a `compile` run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerOptions {
    pub gp: GraphPartitioningScheme,
    /// Skip the coalescer entirely when false
    pub coalesce_mvm_operations: bool,
    /// Emit graphviz snapshots after each pass
    pub print_debug_info: bool,
    /// Directory all artifacts are written to
    pub output_dir: PathBuf,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            gp: GraphPartitioningScheme::RowMajor,
            coalesce_mvm_operations: true,
            print_debug_info: false,
            output_dir: PathBuf::from("."),
        }
    }
}

/// Whether the model holds inference or training matrices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    Unspecialized,
    Inference,
    Training,
}

/// Byte counts and register access statistics of a compilation
#[derive(Debug, Clone, Serialize)]
pub struct CompileReport {
    pub graph_partitioning_scheme: String,
    pub load_bytes: usize,
    pub store_bytes: usize,
    pub send_bytes: usize,
    pub receive_bytes: usize,
    pub spill_load_bytes: usize,
    pub spill_store_bytes: usize,
    pub unspilled_register_accesses: usize,
    pub spilled_register_accesses: usize,
}

impl CompileReport {
    pub fn spilled_access_percent(&self) -> f64 {
        let total = self.spilled_register_accesses + self.unspilled_register_accesses;
        if total == 0 {
            0.0
        } else {
            100.0 * self.spilled_register_accesses as f64 / total as f64
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl std::fmt::Display for CompileReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "graph partitioning scheme = {}",
            self.graph_partitioning_scheme
        )?;
        writeln!(f, "# load bytes = {}", self.load_bytes)?;
        writeln!(f, "# store bytes = {}", self.store_bytes)?;
        writeln!(
            f,
            "# load + store bytes = {}",
            self.load_bytes + self.store_bytes
        )?;
        writeln!(f, "# send bytes = {}", self.send_bytes)?;
        writeln!(f, "# receive bytes = {}", self.receive_bytes)?;
        writeln!(
            f,
            "# send + receive bytes = {}",
            self.send_bytes + self.receive_bytes
        )?;
        writeln!(f, "# load bytes from spilling = {}", self.spill_load_bytes)?;
        writeln!(f, "# store bytes from spilling = {}", self.spill_store_bytes)?;
        writeln!(
            f,
            "# load + store bytes from spilling = {}",
            self.spill_load_bytes + self.spill_store_bytes
        )?;
        writeln!(
            f,
            "# unspilled register accesses = {}",
            self.unspilled_register_accesses
        )?;
        writeln!(
            f,
            "# spilled register accesses = {}",
            self.spilled_register_accesses
        )?;
        writeln!(
            f,
            "% spilled register accesses = {}%",
            self.spilled_access_percent()
        )
    }
}

/// Results of a completed compilation kept alive for instances: the
/// placement tables address weight files, the report feeds queries
pub(crate) struct CompiledModel {
    pub options: CompilerOptions,
    pub partitioner: Partitioner,
    pub placer: Placer,
    pub report: CompileReport,
}

/// Implementation half of a model: the arenas and the pass pipeline
pub struct ModelImpl {
    pub(crate) name: String,
    pub(crate) model_type: ModelType,
    pub(crate) graph: Graph,
    pub(crate) input_tiles: Vec<IoTile>,
    pub(crate) output_tiles: Vec<IoTile>,
    pub(crate) input_vectors: Vec<InputVectorData>,
    pub(crate) output_vectors: Vec<OutputVectorData>,
    pub(crate) vectors: Vec<VectorData>,
    pub(crate) cmat_tiles: Vec<MatTile>,
    pub(crate) tmat_tiles: Vec<MatTile>,
    pub(crate) const_matrices: Vec<ConstMatrixData>,
    pub(crate) conv_matrices: Vec<ConvMatrixData>,
    pub(crate) training_matrices: Vec<TrainMatrixData>,
    pub(crate) input_streams: Vec<InputStreamData>,
    pub(crate) in_stream_tiles: Vec<InStreamTileData>,
    pub(crate) streams: Vec<StreamData>,
    pub(crate) stream_tiles: Vec<StreamTileData>,
    pub(crate) output_streams: Vec<OutputStreamData>,
    pub(crate) out_stream_tiles: Vec<OutStreamTileData>,
    /// Hint sets of simultaneously fireable MVMs, in creation order
    pub(crate) coalesceable_mvm_sets: Vec<Vec<OpId>>,
    pub(crate) compiled: Option<CompiledModel>,
}

impl ModelImpl {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            model_type: ModelType::Unspecialized,
            graph: Graph::new(),
            input_tiles: Vec::new(),
            output_tiles: Vec::new(),
            input_vectors: Vec::new(),
            output_vectors: Vec::new(),
            vectors: Vec::new(),
            cmat_tiles: Vec::new(),
            tmat_tiles: Vec::new(),
            const_matrices: Vec::new(),
            conv_matrices: Vec::new(),
            training_matrices: Vec::new(),
            input_streams: Vec::new(),
            in_stream_tiles: Vec::new(),
            streams: Vec::new(),
            stream_tiles: Vec::new(),
            output_streams: Vec::new(),
            out_stream_tiles: Vec::new(),
            coalesceable_mvm_sets: Vec::new(),
            compiled: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model_type(&self) -> ModelType {
        self.model_type
    }

    pub(crate) fn specialize(&mut self, wanted: ModelType) {
        if self.model_type == ModelType::Unspecialized {
            self.model_type = wanted;
        } else {
            assert!(
                self.model_type == wanted,
                "Cannot mix inference and training matrices in the same model"
            );
        }
    }

    /// MVMUs available per core for this model's matrix kind
    pub(crate) fn mvmus_per_core(&self) -> usize {
        match self.model_type {
            ModelType::Training => N_TRAINING_MVMUS_PER_CORE,
            _ => N_CONSTANT_MVMUS_PER_CORE,
        }
    }

    pub(crate) fn add_coalesceable_mvm_set(&mut self, set: Vec<OpId>) {
        self.coalesceable_mvm_sets.push(set);
    }

    // ---- Operation constructors -------------------------------------

    pub(crate) fn new_mvm(&mut self, tile: CmatTileId, src: OpId) -> OpId {
        let (width, height) = {
            let t = &self.cmat_tiles[tile.0];
            (t.width, t.height)
        };
        assert!(
            width <= MVMU_DIM && height <= MVMU_DIM,
            "MVM operations larger than one MVMU are not supported"
        );
        assert!(
            width == self.graph.op(src).length,
            "MVM operand length must equal the matrix tile width"
        );
        let op = self.graph.add(OpKind::Mvm { matrix: tile }, height);
        self.graph.add_operand(op, src);
        self.cmat_tiles[tile.0].users.push(op);
        op
    }

    pub(crate) fn new_training_op(
        &mut self,
        tile: TmatTileId,
        op_type: TrainingOpType,
        src1: OpId,
        src2: Option<OpId>,
    ) -> OpId {
        let (width, height) = {
            let t = &self.tmat_tiles[tile.0];
            (t.width, t.height)
        };
        assert!(
            width <= MVMU_DIM && height <= MVMU_DIM,
            "MVM operations larger than one MVMU are not supported"
        );
        let length = match op_type {
            TrainingOpType::MvmTranspose => width,
            _ => height,
        };
        match op_type {
            TrainingOpType::Mvm => {
                assert!(width == self.graph.op(src1).length);
                assert!(src2.is_none());
            }
            TrainingOpType::MvmTranspose => {
                assert!(height == self.graph.op(src1).length);
                assert!(src2.is_none());
            }
            TrainingOpType::OuterProduct => {
                assert!(height == self.graph.op(src1).length);
                let src2 = src2.expect("outer product requires two operands");
                assert!(width == self.graph.op(src2).length);
            }
        }
        let op = self
            .graph
            .add(OpKind::Training { matrix: tile, op_type }, length);
        self.graph.add_operand(op, src1);
        if let Some(src2) = src2 {
            self.graph.add_operand(op, src2);
        }
        self.tmat_tiles[tile.0].users.push(op);
        op
    }

    pub(crate) fn new_alu(&mut self, alu: AluOp, src1: OpId, src2: Option<OpId>) -> OpId {
        assert!(!alu.is_immediate());
        let length = self.graph.op(src1).length;
        if alu.is_binary() {
            let src2 = src2.expect("binary ALU operation requires two operands");
            assert!(
                self.graph.op(src2).length == length,
                "ALU operand lengths must match"
            );
        }
        let op = self.graph.add(OpKind::Alu { op: alu, imm: 0.0 }, length);
        self.graph.add_operand(op, src1);
        if alu.is_binary() {
            self.graph.add_operand(op, src2.unwrap());
        }
        op
    }

    pub(crate) fn new_alu_imm(&mut self, alu: AluOp, src1: OpId, imm: f32) -> OpId {
        assert!(alu.is_immediate());
        let length = self.graph.op(src1).length;
        let op = self.graph.add(OpKind::Alu { op: alu, imm }, length);
        self.graph.add_operand(op, src1);
        op
    }

    pub(crate) fn new_set_immediate(&mut self, imm: usize, length: usize) -> OpId {
        self.graph.add(OpKind::SetImmediate { imm }, length)
    }

    pub(crate) fn new_copy(&mut self, src: OpId) -> OpId {
        let length = self.graph.op(src).length;
        let op = self.graph.add(OpKind::Copy, length);
        self.graph.add_operand(op, src);
        op
    }

    pub(crate) fn new_load(&mut self, src: OpId) -> OpId {
        let length = self.graph.op(src).length;
        let op = self.graph.add(OpKind::Load, length);
        self.graph.add_mem_src(op, src);
        op
    }

    pub(crate) fn new_store(&mut self, src: OpId) -> OpId {
        let length = self.graph.op(src).length;
        let op = self.graph.add(OpKind::Store, length);
        self.graph.add_operand(op, src);
        op
    }

    pub(crate) fn new_send(&mut self, src: OpId) -> OpId {
        let length = self.graph.op(src).length;
        let op = self.graph.add(OpKind::Send { dst: None }, length);
        self.graph.add_mem_src(op, src);
        op
    }

    pub(crate) fn new_receive(&mut self, send: OpId) -> OpId {
        let length = self.graph.op(send).length;
        let op = self.graph.add(OpKind::Receive { src: send }, length);
        self.graph.set_send_dst(send, op);
        op
    }

    pub(crate) fn new_write_input(&mut self, src: InputTileId) -> OpId {
        let length = self.input_tiles[src.0].length;
        self.graph.add(OpKind::WriteInput { src }, length)
    }

    pub(crate) fn new_read_output(&mut self, src: OpId, dst: OutputTileId) -> OpId {
        let length = self.graph.op(src).length;
        assert!(
            length == self.output_tiles[dst.0].length,
            "output tile length mismatch"
        );
        let op = self.graph.add(OpKind::ReadOutput { dst }, length);
        self.graph.add_mem_src(op, src);
        op
    }

    pub(crate) fn new_pseudo_input(&mut self, src: InputTileId) -> OpId {
        let length = self.input_tiles[src.0].length;
        self.graph.add(OpKind::PseudoInput { src }, length)
    }

    pub(crate) fn new_pseudo_output(&mut self, src: OpId, dst: OutputTileId) -> OpId {
        let length = self.graph.op(src).length;
        assert!(
            length == self.output_tiles[dst.0].length,
            "output tile length mismatch"
        );
        let op = self.graph.add(OpKind::PseudoOutput { dst }, length);
        self.graph.add_operand(op, src);
        op
    }

    /// Attach the tile-memory address operand of a load
    pub(crate) fn add_load_address_operand(&mut self, load: OpId, address: OpId) {
        assert!(
            self.graph.op(load).operands.is_empty(),
            "cannot set tile memory address operand"
        );
        assert!(
            self.graph.op(address).length == 1,
            "address must be of length 1"
        );
        self.graph.add_operand(load, address);
    }

    /// Attach the tile-memory address operand of a store
    pub(crate) fn add_store_address_operand(&mut self, store: OpId, address: OpId) {
        assert!(
            self.graph.op(store).operands.len() == 1,
            "cannot set tile memory address operand"
        );
        assert!(
            self.graph.op(address).length == 1,
            "address must be of length 1"
        );
        self.graph.add_operand(store, address);
    }

    // ---- Compilation ------------------------------------------------

    pub fn compile(&mut self, options: CompilerOptions) -> CompileResult<()> {
        self.compile_with_oracle(options, &KahipOracle)
    }

    pub fn compile_with_oracle(
        &mut self,
        options: CompilerOptions,
        oracle: &dyn GraphPartitionOracle,
    ) -> CompileResult<()> {
        if self.model_type == ModelType::Unspecialized {
            return Err(CompileError::model(
                "model has no matrices and cannot be compiled",
            ));
        }
        fs::create_dir_all(&options.output_dir)?;

        if options.print_debug_info {
            self.print_graph(&self.dot_path(&options, "graph0"), &Annotations::default())?;
        }

        info!("partitioning graph");
        let mut partitioner = Partitioner::run(self, options.gp, oracle)?;
        if options.print_debug_info {
            self.print_graph(
                &self.dot_path(&options, "graph1-partitioned"),
                &Annotations {
                    partitioner: Some(&partitioner),
                    ..Default::default()
                },
            )?;
        }

        info!("physical layout");
        let placer = Placer::run(self, &partitioner)?;
        if options.print_debug_info {
            self.print_graph(
                &self.dot_path(&options, "graph2-virtual-to-physical"),
                &Annotations {
                    partitioner: Some(&partitioner),
                    placer: Some(&placer),
                    ..Default::default()
                },
            )?;
        }

        info!("memory allocation");
        let mut memory_allocator = MemoryAllocator::run(self, &mut partitioner)?;
        if options.print_debug_info {
            self.print_graph(
                &self.dot_path(&options, "graph3-memory-allocation"),
                &Annotations {
                    partitioner: Some(&partitioner),
                    placer: Some(&placer),
                    memory_allocator: Some(&memory_allocator),
                    ..Default::default()
                },
            )?;
        }

        let coalescer = if options.coalesce_mvm_operations {
            info!("matrix operation coalescing");
            Some(Coalescer::run(self, &partitioner, &placer)?)
        } else {
            None
        };

        info!("linearizing graph");
        let mut linearizer =
            Linearizer::run(self, &mut partitioner, &placer, coalescer.as_ref())?;
        if options.print_debug_info {
            self.print_graph(
                &self.dot_path(&options, "graph4-linearization"),
                &Annotations {
                    partitioner: Some(&partitioner),
                    placer: Some(&placer),
                    memory_allocator: Some(&memory_allocator),
                    ..Default::default()
                },
            )?;
        }

        info!("register allocation");
        let register_allocator = RegisterAllocator::run(
            self,
            &mut partitioner,
            &placer,
            &mut memory_allocator,
            &mut linearizer,
        )?;
        if options.print_debug_info {
            self.print_graph(
                &self.dot_path(&options, "graph5-register-allocation"),
                &Annotations {
                    partitioner: Some(&partitioner),
                    placer: Some(&placer),
                    memory_allocator: Some(&memory_allocator),
                    register_allocator: Some(&register_allocator),
                },
            )?;
        }

        info!("code generation");
        codegen::generate(
            self,
            &partitioner,
            &placer,
            &memory_allocator,
            coalescer.as_ref(),
            &linearizer,
            &register_allocator,
            &options.output_dir,
        )?;

        let report = CompileReport {
            graph_partitioning_scheme: options.gp.report_name().to_string(),
            load_bytes: partitioner.num_load_bytes(),
            store_bytes: partitioner.num_store_bytes(),
            send_bytes: partitioner.num_send_bytes(),
            receive_bytes: partitioner.num_receive_bytes(),
            spill_load_bytes: register_allocator.num_spill_load_bytes(),
            spill_store_bytes: register_allocator.num_spill_store_bytes(),
            unspilled_register_accesses: register_allocator.num_unspilled_accesses(),
            spilled_register_accesses: register_allocator.num_spilled_accesses(),
        };
        let mut report_file =
            fs::File::create(options.output_dir.join(format!("{}-report.out", self.name)))?;
        write!(report_file, "{}", report)?;

        self.compiled = Some(CompiledModel {
            options,
            partitioner,
            placer,
            report,
        });
        Ok(())
    }

    pub fn report(&self) -> Option<&CompileReport> {
        self.compiled.as_ref().map(|c| &c.report)
    }

    fn dot_path(&self, options: &CompilerOptions, stage: &str) -> PathBuf {
        options
            .output_dir
            .join(format!("{}-{}.dot", self.name, stage))
    }

    // ---- Debug output -----------------------------------------------

    fn print_graph(&self, path: &Path, ann: &Annotations) -> CompileResult<()> {
        let mut out = fs::File::create(path)?;
        writeln!(out, "digraph model {{")?;
        for vec in &self.input_vectors {
            let node = format!("\"InputVector\\n{}\"", vec.name);
            writeln!(out, "{} [shape=box,style=filled,fillcolor=\"#3399FF\"];", node)?;
            for tile in &vec.tiles {
                let tile_node = format!("\"InputVectorTile\\n{}\"", self.input_tiles[tile.0].name);
                writeln!(
                    out,
                    "{} [shape=box,style=filled,fillcolor=\"#66CCFF\"];",
                    tile_node
                )?;
                writeln!(out, "{} -> {} [style=dotted];", node, tile_node)?;
            }
        }
        for vec in &self.output_vectors {
            let node = format!("\"OutputVector\\n{}\"", vec.name);
            writeln!(out, "{} [shape=box,style=filled,fillcolor=\"#3399FF\"];", node)?;
            for tile in &vec.tiles {
                let tile_node =
                    format!("\"OutputVectorTile\\n{}\"", self.output_tiles[tile.0].name);
                writeln!(
                    out,
                    "{} [shape=box,style=filled,fillcolor=\"#66CCFF\"];",
                    tile_node
                )?;
                writeln!(out, "{} -> {} [style=dotted];", tile_node, node)?;
            }
        }
        let mut node_names: HashMap<OpId, String> = HashMap::new();
        for op in self.graph.ids() {
            let node = self.graph.op(op);
            let mut label = format!("{}\\n{}", node.kind.label(), op);
            if let Some(partitioner) = ann.partitioner {
                label.push_str(&partitioner.assignment_label(op));
            }
            if let Some(placer) = ann.placer {
                if let Some(partitioner) = ann.partitioner {
                    label.push_str(&placer.assignment_label(partitioner, op));
                }
            }
            if let Some(memory_allocator) = ann.memory_allocator {
                label.push_str(&memory_allocator.assignment_label(op));
            }
            if let Some(register_allocator) = ann.register_allocator {
                label.push_str(&register_allocator.assignment_label(op));
            }
            node_names.insert(op, format!("\"{}\"", label));
        }
        for op in self.graph.ids() {
            let node = self.graph.op(op);
            let style = match &node.kind {
                OpKind::Mvm { .. } | OpKind::Training { .. } => {
                    " [style=filled,fillcolor=\"#009933\"]"
                }
                OpKind::Alu { .. } => " [style=filled,fillcolor=\"#66FF66\"]",
                OpKind::Load | OpKind::Store => " [style=filled,fillcolor=\"#FFB366\"]",
                OpKind::Send { .. } | OpKind::Receive { .. } => {
                    " [style=filled,fillcolor=\"#FFFF66\"]"
                }
                _ => "",
            };
            writeln!(out, "{}{};", node_names[&op], style)?;
            for user in &node.users {
                writeln!(out, "{} -> {};", node_names[&op], node_names[user])?;
            }
            for user in &node.mem_users {
                writeln!(out, "{} -> {};", node_names[&op], node_names[user])?;
            }
            match &node.kind {
                OpKind::Send { dst: Some(dst) } => {
                    writeln!(out, "{} -> {};", node_names[&op], node_names[dst])?;
                }
                OpKind::WriteInput { src } | OpKind::PseudoInput { src } => {
                    writeln!(
                        out,
                        "\"InputVectorTile\\n{}\" -> {};",
                        self.input_tiles[src.0].name, node_names[&op]
                    )?;
                }
                OpKind::ReadOutput { dst } | OpKind::PseudoOutput { dst } => {
                    writeln!(
                        out,
                        "{} -> \"OutputVectorTile\\n{}\";",
                        node_names[&op], self.output_tiles[dst.0].name
                    )?;
                }
                _ => {}
            }
        }
        writeln!(out, "}}")?;
        Ok(())
    }
}

/// Optional pass annotations shown in graph dumps
#[derive(Default)]
struct Annotations<'a> {
    partitioner: Option<&'a Partitioner>,
    placer: Option<&'a Placer>,
    memory_allocator: Option<&'a MemoryAllocator>,
    register_allocator: Option<&'a RegisterAllocator>,
}

/// Handle to a model; clones share the same underlying model
#[derive(Clone)]
pub struct Model {
    inner: Rc<RefCell<ModelImpl>>,
}

impl Model {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ModelImpl::new(name))),
        }
    }

    pub(crate) fn inner(&self) -> &Rc<RefCell<ModelImpl>> {
        &self.inner
    }

    /// Whether two handles name the same model
    pub fn same(a: &Model, b: &Model) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn name(&self) -> String {
        self.inner.borrow().name.clone()
    }

    /// Run the full back-end pipeline and emit all artifacts
    pub fn compile(&self, options: CompilerOptions) -> CompileResult<()> {
        self.inner.borrow_mut().compile(options)
    }

    /// Like `compile`, with an injected graph partitioning oracle
    pub fn compile_with_oracle(
        &self,
        options: CompilerOptions,
        oracle: &dyn GraphPartitionOracle,
    ) -> CompileResult<()> {
        self.inner.borrow_mut().compile_with_oracle(options, oracle)
    }

    /// Report of the last successful compilation
    pub fn report(&self) -> Option<CompileReport> {
        self.inner.borrow().report().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::{sig, tanh};
    use crate::tensors::{ConstantMatrix, InputVector, OutputVector, Vector};
    use std::path::PathBuf;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("puma-model-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn options(dir: &PathBuf) -> CompilerOptions {
        CompilerOptions {
            output_dir: dir.clone(),
            ..Default::default()
        }
    }

    /// One LSTM cell over two hidden layers, sized so every weight
    /// matrix is a single MVMU tile
    fn lstm_model(size: usize) -> Model {
        let model = Model::new("lstm");
        let input = Vector::from(&InputVector::new(&model, "in", size));
        let m1: Vec<ConstantMatrix> = (0..4)
            .map(|i| ConstantMatrix::new(&model, &format!("M1_{}", i), size, size))
            .collect();
        let m2: Vec<ConstantMatrix> = (0..4)
            .map(|i| ConstantMatrix::new(&model, &format!("M2_{}", i), size, size))
            .collect();
        let m3: Vec<ConstantMatrix> = (0..4)
            .map(|i| ConstantMatrix::new(&model, &format!("M3_{}", i), size, size))
            .collect();
        let m4: Vec<ConstantMatrix> = (0..4)
            .map(|i| ConstantMatrix::new(&model, &format!("M4_{}", i), size, size))
            .collect();
        let m5 = ConstantMatrix::new(&model, "M5", size, size);
        let h1in = Vector::from(&InputVector::new(&model, "h1in", size));
        let c1in = Vector::from(&InputVector::new(&model, "c1in", size));
        let h2in = Vector::from(&InputVector::new(&model, "h2in", size));
        let c2in = Vector::from(&InputVector::new(&model, "c2in", size));
        let h1out = OutputVector::new(&model, "h1out", size);
        let c1out = OutputVector::new(&model, "c1out", size);
        let h2out = OutputVector::new(&model, "h2out", size);
        let c2out = OutputVector::new(&model, "c2out", size);
        let out = OutputVector::new(&model, "out", size);

        let i_gate1 = sig(&(&(&m1[0] * &input) + &(&m2[0] * &h1in)));
        let f_gate1 = sig(&(&(&m1[1] * &input) + &(&m2[1] * &h1in)));
        let o_gate1 = sig(&(&(&m1[2] * &input) + &(&m2[2] * &h1in)));
        let c_int1 = tanh(&(&(&m1[3] * &input) + &(&m2[3] * &h1in)));
        let c1 = &(&f_gate1 * &c1in) + &(&i_gate1 * &c_int1);
        let h1 = &o_gate1 * &tanh(&c1);
        h1out.assign(&h1);
        c1out.assign(&c1);

        let i_gate2 = sig(&(&(&m3[0] * &h1) + &(&m4[0] * &h2in)));
        let f_gate2 = sig(&(&(&m3[1] * &h1) + &(&m4[1] * &h2in)));
        let o_gate2 = sig(&(&(&m3[2] * &h1) + &(&m4[2] * &h2in)));
        let c_int2 = tanh(&(&(&m3[3] * &h1) + &(&m4[3] * &h2in)));
        let c2 = &(&f_gate2 * &c2in) + &(&i_gate2 * &c_int2);
        let h2 = &o_gate2 * &tanh(&c2);
        h2out.assign(&h2);
        c2out.assign(&c2);

        out.assign(&(&m5 * &h2));
        model
    }

    #[test]
    fn test_lstm_cell_compiles_end_to_end() {
        let dir = temp_dir("lstm");
        let model = lstm_model(128);
        model.compile(options(&dir)).unwrap();
        let report = model.report().unwrap();
        assert_eq!(report.graph_partitioning_scheme, "row major");
        assert!(report.send_bytes > 0);
        assert!(report.receive_bytes > 0);

        // 17 single-tile matrices spread over three cores of one
        // compute tile; each coalesced leader emits one instruction
        let mut mvm_instructions = 0;
        for pcore in 0..crate::hardware::N_CORES_PER_TILE {
            let path = dir.join(format!("lstm-tile2-core{}.puma", pcore));
            let text = fs::read_to_string(path).unwrap();
            mvm_instructions += text.matches("mvm(").count();
        }
        assert!(mvm_instructions >= 3, "got {}", mvm_instructions);
        assert!(mvm_instructions <= 17, "got {}", mvm_instructions);

        let report_text = fs::read_to_string(dir.join("lstm-report.out")).unwrap();
        assert!(report_text.contains("graph partitioning scheme = row major"));
        assert!(report_text.contains("# send bytes = "));
    }

    #[test]
    fn test_debug_snapshots_are_written() {
        let dir = temp_dir("dot");
        let model = Model::new("dotted");
        let input = InputVector::new(&model, "in", 5);
        let matrix = ConstantMatrix::new(&model, "m", 5, 5);
        let out = OutputVector::new(&model, "out", 5);
        let y = &matrix * &Vector::from(&input);
        out.assign(&y);
        let mut opts = options(&dir);
        opts.print_debug_info = true;
        model.compile(opts).unwrap();
        for stage in [
            "graph0",
            "graph1-partitioned",
            "graph2-virtual-to-physical",
            "graph3-memory-allocation",
            "graph4-linearization",
            "graph5-register-allocation",
        ] {
            let path = dir.join(format!("dotted-{}.dot", stage));
            let text = fs::read_to_string(&path)
                .unwrap_or_else(|e| panic!("missing {}: {}", path.display(), e));
            assert!(text.starts_with("digraph model {"));
            assert!(text.trim_end().ends_with('}'));
        }
    }

    #[test]
    fn test_compiling_a_model_without_matrices_fails() {
        let dir = temp_dir("empty");
        let model = Model::new("empty");
        let result = model.compile(options(&dir));
        assert!(matches!(result, Err(CompileError::ModelError { .. })));
    }

    #[test]
    fn test_report_serializes_to_json() {
        let report = CompileReport {
            graph_partitioning_scheme: "row major".to_string(),
            load_bytes: 5,
            store_bytes: 5,
            send_bytes: 10,
            receive_bytes: 10,
            spill_load_bytes: 0,
            spill_store_bytes: 0,
            unspilled_register_accesses: 20,
            spilled_register_accesses: 0,
        };
        let json = report.to_json().unwrap();
        assert!(json.contains("\"send_bytes\": 10"));
        assert_eq!(report.spilled_access_percent(), 0.0);
        let text = report.to_string();
        assert!(text.contains("# load + store bytes = 10"));
        assert!(text.contains("% spilled register accesses = 0%"));
    }
}
