//! Hardware parameters of the PUMA accelerator
//!
//! The accelerator is a three-level hierarchy: tiles contain cores,
//! cores contain matrix-vector multiply units (MVMUs). Each MVMU
//! multiplies a preloaded 128x128 weight tile by a 128-vector in one
//! firing. The constants here describe that hierarchy and the per-core
//! register file layout the register allocator targets.

/// Width and height of one MVMU weight tile
pub const MVMU_DIM: usize = 128;

/// MVMUs per core when compiling an inference model
pub const N_CONSTANT_MVMUS_PER_CORE: usize = 6;

/// MVMUs per core when compiling a training model
pub const N_TRAINING_MVMUS_PER_CORE: usize = 2;

/// Cores per physical tile
pub const N_CORES_PER_TILE: usize = 8;

/// Widest single load/store the core memory unit supports
pub const MAX_LOAD_STORE_WIDTH: usize = 16;

/// Widest single send/receive the tile network interface supports
pub const MAX_SEND_RECV_WIDTH: usize = 16;

/// Operation slots per training MVMU (forward, transpose, outer product)
pub const N_TRAINING_OPERATIONS: usize = 3;

const fn max_usize(a: usize, b: usize) -> usize {
    if a >= b { a } else { b }
}

/// Reserved registers matrix operations implicitly read their inputs from
pub const N_INPUT_REGISTERS: usize = MVMU_DIM
    * max_usize(
        N_CONSTANT_MVMUS_PER_CORE,
        N_TRAINING_OPERATIONS * N_TRAINING_MVMUS_PER_CORE,
    );

/// Reserved registers matrix operations implicitly write their outputs to
pub const N_OUTPUT_REGISTERS: usize = N_INPUT_REGISTERS;

pub const INPUT_REGISTERS_START_ADDRESS: usize = 0;
pub const OUTPUT_REGISTERS_START_ADDRESS: usize =
    INPUT_REGISTERS_START_ADDRESS + N_INPUT_REGISTERS;
pub const REGISTER_FILE_START_ADDRESS: usize =
    OUTPUT_REGISTERS_START_ADDRESS + N_OUTPUT_REGISTERS;

/// Size of the general-purpose register file
pub const REGISTER_FILE_SIZE: usize = N_INPUT_REGISTERS + N_OUTPUT_REGISTERS;

/// Total registers addressable on one core
pub const REGISTERS_PER_CORE: usize =
    N_INPUT_REGISTERS + N_OUTPUT_REGISTERS + REGISTER_FILE_SIZE;

/// Number of 128-element tiles a vector of `length` scalars occupies
pub fn n_vector_tiles(length: usize) -> usize {
    (length - 1) / MVMU_DIM + 1
}

/// Size of tile `t` of a vector of `length` scalars (the last tile may
/// be shorter)
pub fn vector_tile_size(length: usize, t: usize) -> usize {
    if t == n_vector_tiles(length) - 1 && length % MVMU_DIM > 0 {
        length % MVMU_DIM
    } else {
        MVMU_DIM
    }
}

/// Largest transfer width <= `max_width` that evenly divides `length`
pub fn transfer_width(length: usize, max_width: usize) -> usize {
    let mut width = max_width.min(length);
    while length % width != 0 {
        width -= 1;
    }
    width
}
