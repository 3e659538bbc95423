//! PUMA compiler
//!
//! Compiles linear-algebra models (matrix-vector products, element-wise
//! vector math, convolutions, and training updates) onto a tiled analog
//! in-memory-computing accelerator. Programs are written against an
//! embedded DSL that builds an operation DAG; the back end partitions
//! the DAG over virtual MVMUs/cores/tiles, places them on physical
//! units, allocates tile scratchpad memory, coalesces independent
//! matrix operations into wide instructions, linearizes per-core and
//! per-tile instruction streams, allocates registers with spilling,
//! and emits one textual `.puma` stream per tile and per core.
//!
//! # Example
//!
//! ```rust
//! use puma_compiler::{CompilerOptions, ConstantMatrix, InputVector, Model, OutputVector, Vector};
//!
//! let model = Model::new("example");
//! let input = InputVector::new(&model, "x", 4);
//! let weights = ConstantMatrix::new(&model, "w", 4, 4);
//! let output = OutputVector::new(&model, "y", 4);
//! let y = &weights * &Vector::from(&input);
//! output.assign(&y);
//!
//! let options = CompilerOptions {
//!     output_dir: std::env::temp_dir().join("puma-doc-example"),
//!     ..Default::default()
//! };
//! model.compile(options).unwrap();
//! ```

pub mod coalescer;
pub mod codegen;
pub mod dsl;
pub mod error;
pub mod graph;
pub mod hardware;
pub mod instance;
pub mod linearizer;
pub mod memalloc;
pub mod model;
pub mod partitioner;
pub mod placer;
pub mod regalloc;
pub mod tensors;

pub use dsl::{
    eq, exp, geq, gt, leq, log, log_softmax, log_softmaxd, lt, max, maxpool, min, mse, neq,
    relu, relud, rndcmp, sig, sig_stream, tanh,
};
pub use error::{CompileError, CompileResult};
pub use instance::ModelInstance;
pub use model::{CompileReport, CompilerOptions, GraphPartitioningScheme, Model};
pub use partitioner::{GraphPartitionOracle, KahipOracle};
pub use tensors::{
    ConstantMatrix, ConvolutionalConstantMatrix, ImagePixelStream, InputImagePixelStream,
    InputVector, OuterProduct, OutputImagePixelStream, OutputVector, TrainingMatrix, Transpose,
    Vector,
};
