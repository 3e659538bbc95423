//! The embedded DSL that builds the operation DAG
//!
//! Programs are written against the tensor handles with ordinary Rust
//! operators: `&m * &x` for a matrix-vector product, `&a + &b` for
//! element-wise vector math, `m -= OuterProduct::new(&x1, &x2)` for a
//! training update. Each expression appends operations to the owning
//! model's graph.
//!
//! A matrix-vector product emits one MVM per (height tile x width
//! tile) and an ADD accumulation chain across width tiles; the MVMs of
//! one product are recorded as a coalesceable hint set because they
//! all fire on the same input vector's tiles.

use std::collections::BTreeMap;
use std::ops::{Add, BitAnd, BitOr, Div, Mul, Not, Sub, SubAssign};

use crate::graph::{AluOp, OpId, TrainingOpType};
use crate::model::Model;
use crate::tensors::{
    ConstantMatrix, ConvolutionalConstantMatrix, ImagePixelStream, InputImagePixelStream,
    InputVector, OuterProduct, OutputImagePixelStream, OutputVector, Transpose, TrainingMatrix,
    Vector,
};

impl From<&InputVector> for Vector {
    /// Materialize an external input as a hidden vector of pseudo-input
    /// tiles; the partitioner later replaces them with real input and
    /// communication operations
    fn from(x: &InputVector) -> Vector {
        let model = x.model.clone();
        let mut m = model.inner().borrow_mut();
        let length = m.input_vectors[x.id].length;
        let y = m.add_vector(length);
        let tiles = m.input_vectors[x.id].tiles.clone();
        for (t, tile) in tiles.into_iter().enumerate() {
            let producer = m.new_pseudo_input(tile);
            m.set_vector_tile(y, t, producer);
        }
        drop(m);
        Vector { model, id: y }
    }
}

impl OutputVector {
    /// Bind a computed vector to this external output
    pub fn assign(&self, x: &Vector) {
        assert!(
            Model::same(&self.model, &x.model),
            "output and value must belong to the same model"
        );
        let mut m = self.model.inner().borrow_mut();
        assert!(
            m.output_vectors[self.id].length == m.vectors[x.id].length,
            "output vector length must match the assigned vector"
        );
        let tiles = m.output_vectors[self.id].tiles.clone();
        for (t, out_tile) in tiles.into_iter().enumerate() {
            let producer = m.vector_tile(x.id, t);
            m.new_pseudo_output(producer, out_tile);
        }
    }
}

fn unary_op(x: &Vector, alu: AluOp) -> Vector {
    let model = x.model.clone();
    let mut m = model.inner().borrow_mut();
    let length = m.vectors[x.id].length;
    let y = m.add_vector(length);
    for t in 0..m.vectors[x.id].tiles.len() {
        let src = m.vector_tile(x.id, t);
        let producer = m.new_alu(alu, src, None);
        m.set_vector_tile(y, t, producer);
    }
    drop(m);
    Vector { model, id: y }
}

fn binary_op(x1: &Vector, x2: &Vector, alu: AluOp) -> Vector {
    assert!(
        Model::same(&x1.model, &x2.model),
        "operands must belong to the same model"
    );
    let model = x1.model.clone();
    let mut m = model.inner().borrow_mut();
    assert!(
        m.vectors[x1.id].length == m.vectors[x2.id].length,
        "operand lengths must match"
    );
    let length = m.vectors[x1.id].length;
    let y = m.add_vector(length);
    for t in 0..m.vectors[x1.id].tiles.len() {
        let src1 = m.vector_tile(x1.id, t);
        let src2 = m.vector_tile(x2.id, t);
        let producer = m.new_alu(alu, src1, Some(src2));
        m.set_vector_tile(y, t, producer);
    }
    drop(m);
    Vector { model, id: y }
}

fn immediate_op(x: &Vector, imm: f32, alu: AluOp) -> Vector {
    let model = x.model.clone();
    let mut m = model.inner().borrow_mut();
    let length = m.vectors[x.id].length;
    let y = m.add_vector(length);
    for t in 0..m.vectors[x.id].tiles.len() {
        let src = m.vector_tile(x.id, t);
        let producer = m.new_alu_imm(alu, src, imm);
        m.set_vector_tile(y, t, producer);
    }
    drop(m);
    Vector { model, id: y }
}

// Element-wise unary operations

pub fn sig(x: &Vector) -> Vector {
    unary_op(x, AluOp::Sig)
}

pub fn tanh(x: &Vector) -> Vector {
    unary_op(x, AluOp::Tanh)
}

pub fn exp(x: &Vector) -> Vector {
    unary_op(x, AluOp::Exp)
}

pub fn log(x: &Vector) -> Vector {
    unary_op(x, AluOp::Log)
}

pub fn relu(x: &Vector) -> Vector {
    unary_op(x, AluOp::Relu)
}

pub fn relud(x: &Vector) -> Vector {
    unary_op(x, AluOp::Relud)
}

pub fn log_softmax(x: &Vector) -> Vector {
    unary_op(x, AluOp::LogSoftmax)
}

pub fn log_softmaxd(x: &Vector) -> Vector {
    unary_op(x, AluOp::LogSoftmaxd)
}

pub fn rndcmp(x: &Vector) -> Vector {
    unary_op(x, AluOp::Rndcmp)
}

impl Not for &Vector {
    type Output = Vector;
    fn not(self) -> Vector {
        unary_op(self, AluOp::Not)
    }
}

// Element-wise binary operations

impl Add for &Vector {
    type Output = Vector;
    fn add(self, rhs: &Vector) -> Vector {
        binary_op(self, rhs, AluOp::Add)
    }
}

impl Sub for &Vector {
    type Output = Vector;
    fn sub(self, rhs: &Vector) -> Vector {
        binary_op(self, rhs, AluOp::Sub)
    }
}

impl Mul for &Vector {
    type Output = Vector;
    fn mul(self, rhs: &Vector) -> Vector {
        binary_op(self, rhs, AluOp::Mul)
    }
}

impl Div for &Vector {
    type Output = Vector;
    fn div(self, rhs: &Vector) -> Vector {
        binary_op(self, rhs, AluOp::Div)
    }
}

impl BitAnd for &Vector {
    type Output = Vector;
    fn bitand(self, rhs: &Vector) -> Vector {
        binary_op(self, rhs, AluOp::And)
    }
}

impl BitOr for &Vector {
    type Output = Vector;
    fn bitor(self, rhs: &Vector) -> Vector {
        binary_op(self, rhs, AluOp::Or)
    }
}

pub fn eq(x1: &Vector, x2: &Vector) -> Vector {
    binary_op(x1, x2, AluOp::Eq)
}

pub fn neq(x1: &Vector, x2: &Vector) -> Vector {
    binary_op(x1, x2, AluOp::Neq)
}

pub fn lt(x1: &Vector, x2: &Vector) -> Vector {
    binary_op(x1, x2, AluOp::Lt)
}

pub fn leq(x1: &Vector, x2: &Vector) -> Vector {
    binary_op(x1, x2, AluOp::Leq)
}

pub fn gt(x1: &Vector, x2: &Vector) -> Vector {
    binary_op(x1, x2, AluOp::Gt)
}

pub fn geq(x1: &Vector, x2: &Vector) -> Vector {
    binary_op(x1, x2, AluOp::Geq)
}

pub fn min(x1: &Vector, x2: &Vector) -> Vector {
    binary_op(x1, x2, AluOp::Min)
}

pub fn max(x1: &Vector, x2: &Vector) -> Vector {
    binary_op(x1, x2, AluOp::Max)
}

pub fn mse(x1: &Vector, x2: &Vector) -> Vector {
    binary_op(x1, x2, AluOp::Mse)
}

impl Mul<&Vector> for f32 {
    type Output = Vector;
    /// Scalar multiplication lowered to an immediate ALU operation
    fn mul(self, rhs: &Vector) -> Vector {
        immediate_op(rhs, self, AluOp::Muli)
    }
}

impl Mul<&Vector> for &ConstantMatrix {
    type Output = Vector;
    fn mul(self, x: &Vector) -> Vector {
        assert!(
            Model::same(&self.model, &x.model),
            "matrix and vector must belong to the same model"
        );
        let model = self.model.clone();
        let mut m = model.inner().borrow_mut();
        assert!(
            m.const_matrices[self.id].width == m.vectors[x.id].length,
            "matrix width must equal the input vector length"
        );
        let height = m.const_matrices[self.id].height;
        let n_h = m.const_matrices[self.id].n_height_tiles();
        let n_w = m.const_matrices[self.id].n_width_tiles();
        let y = m.add_vector(height);
        let mut hint_set = Vec::with_capacity(n_h * n_w);
        for h in 0..n_h {
            // Sequential reduction over the width tiles
            let mut accum: Option<OpId> = None;
            for w in 0..n_w {
                let tile = m.const_matrices[self.id].tiles[h][w];
                let src = m.vector_tile(x.id, w);
                let mvm = m.new_mvm(tile, src);
                hint_set.push(mvm);
                accum = Some(match accum {
                    None => mvm,
                    Some(prev) => m.new_alu(AluOp::Add, mvm, Some(prev)),
                });
            }
            m.set_vector_tile(y, h, accum.unwrap());
        }
        m.add_coalesceable_mvm_set(hint_set);
        drop(m);
        Vector { model, id: y }
    }
}

impl Mul<&Vector> for &TrainingMatrix {
    type Output = Vector;
    fn mul(self, x: &Vector) -> Vector {
        assert!(
            Model::same(&self.model, &x.model),
            "matrix and vector must belong to the same model"
        );
        let model = self.model.clone();
        let mut m = model.inner().borrow_mut();
        assert!(
            m.training_matrices[self.id].width == m.vectors[x.id].length,
            "matrix width must equal the input vector length"
        );
        let height = m.training_matrices[self.id].height;
        let n_h = m.training_matrices[self.id].n_height_tiles();
        let n_w = m.training_matrices[self.id].n_width_tiles();
        let y = m.add_vector(height);
        for h in 0..n_h {
            let mut accum: Option<OpId> = None;
            for w in 0..n_w {
                let tile = m.training_matrices[self.id].tiles[h][w];
                let src = m.vector_tile(x.id, w);
                let op = m.new_training_op(tile, TrainingOpType::Mvm, src, None);
                accum = Some(match accum {
                    None => op,
                    Some(prev) => m.new_alu(AluOp::Add, op, Some(prev)),
                });
            }
            m.set_vector_tile(y, h, accum.unwrap());
        }
        drop(m);
        Vector { model, id: y }
    }
}

impl Mul<&Vector> for &Transpose {
    type Output = Vector;
    fn mul(self, x: &Vector) -> Vector {
        let mat = &self.matrix;
        assert!(
            Model::same(&mat.model, &x.model),
            "matrix and vector must belong to the same model"
        );
        let model = mat.model.clone();
        let mut m = model.inner().borrow_mut();
        assert!(
            m.training_matrices[mat.id].height == m.vectors[x.id].length,
            "matrix height must equal the input vector length for a transposed product"
        );
        let width = m.training_matrices[mat.id].width;
        let n_h = m.training_matrices[mat.id].n_width_tiles();
        let n_w = m.training_matrices[mat.id].n_height_tiles();
        let y = m.add_vector(width);
        for h in 0..n_h {
            let mut accum: Option<OpId> = None;
            for w in 0..n_w {
                let tile = m.training_matrices[mat.id].tiles[w][h];
                let src = m.vector_tile(x.id, w);
                let op = m.new_training_op(tile, TrainingOpType::MvmTranspose, src, None);
                accum = Some(match accum {
                    None => op,
                    Some(prev) => m.new_alu(AluOp::Add, op, Some(prev)),
                });
            }
            m.set_vector_tile(y, h, accum.unwrap());
        }
        drop(m);
        Vector { model, id: y }
    }
}

impl SubAssign<OuterProduct> for TrainingMatrix {
    /// `M -= x1 (x) x2`: one outer-product update per weight tile.
    /// The updates write the matrix in place and produce no register
    /// value, so they are graph sinks.
    fn sub_assign(&mut self, op: OuterProduct) {
        assert!(
            Model::same(&self.model, &op.x1.model),
            "update operands must belong to the same model"
        );
        let mut m = self.model.inner().borrow_mut();
        assert!(
            m.training_matrices[self.id].height == m.vectors[op.x1.id].length,
            "matrix height must equal the first outer product operand length"
        );
        assert!(
            m.training_matrices[self.id].width == m.vectors[op.x2.id].length,
            "matrix width must equal the second outer product operand length"
        );
        let n_h = m.training_matrices[self.id].n_height_tiles();
        let n_w = m.training_matrices[self.id].n_width_tiles();
        for h in 0..n_h {
            for w in 0..n_w {
                let tile = m.training_matrices[self.id].tiles[h][w];
                let src1 = m.vector_tile(op.x1.id, h);
                let src2 = m.vector_tile(op.x2.id, w);
                m.new_training_op(tile, TrainingOpType::OuterProduct, src1, Some(src2));
            }
        }
    }
}

impl From<&InputImagePixelStream> for ImagePixelStream {
    fn from(xs: &InputImagePixelStream) -> ImagePixelStream {
        let model = xs.model.clone();
        let mut m = model.inner().borrow_mut();
        let (image_width, image_height, n_channels) = {
            let data = &m.input_streams[xs.id];
            (data.image_width, data.image_height, data.n_channels)
        };
        let ys = m.add_stream(image_width, image_height, n_channels);
        for t in 0..m.input_streams[xs.id].tiles.len() {
            let in_tile = m.input_streams[xs.id].tiles[t];
            let out_tile = m.streams[ys].tiles[t];
            for h in 0..image_height {
                for w in 0..image_width {
                    let src = m.in_stream_tiles[in_tile].elems[h * image_width + w];
                    let producer = m.new_pseudo_input(src);
                    m.set_stream_elem(out_tile, h, w, producer);
                }
            }
        }
        drop(m);
        ImagePixelStream { model, id: ys }
    }
}

impl OutputImagePixelStream {
    /// Bind a computed pixel stream to this external output
    pub fn assign(&self, xs: &ImagePixelStream) {
        assert!(
            Model::same(&self.model, &xs.model),
            "output and value must belong to the same model"
        );
        let mut m = self.model.inner().borrow_mut();
        let (image_width, image_height) = {
            let data = &m.output_streams[self.id];
            assert!(
                data.image_width == m.streams[xs.id].image_width
                    && data.image_height == m.streams[xs.id].image_height
                    && data.n_channels == m.streams[xs.id].n_channels,
                "output stream shape must match the assigned stream"
            );
            (data.image_width, data.image_height)
        };
        for t in 0..m.output_streams[self.id].tiles.len() {
            let out_tile = m.output_streams[self.id].tiles[t];
            let in_tile = m.streams[xs.id].tiles[t];
            for h in 0..image_height {
                for w in 0..image_width {
                    let producer = m.stream_elem(in_tile, h, w);
                    let dst = m.out_stream_tiles[out_tile].elems[h * image_width + w];
                    m.new_pseudo_output(producer, dst);
                }
            }
        }
    }
}

/// Element-wise sigmoid over every pixel of a stream
pub fn sig_stream(xs: &ImagePixelStream) -> ImagePixelStream {
    let model = xs.model.clone();
    let mut m = model.inner().borrow_mut();
    let (image_width, image_height, n_channels) = {
        let data = &m.streams[xs.id];
        (data.image_width, data.image_height, data.n_channels)
    };
    let ys = m.add_stream(image_width, image_height, n_channels);
    for t in 0..m.streams[xs.id].tiles.len() {
        let in_tile = m.streams[xs.id].tiles[t];
        let out_tile = m.streams[ys].tiles[t];
        for h in 0..image_height {
            for w in 0..image_width {
                let src = m.stream_elem(in_tile, h, w);
                let producer = m.new_alu(AluOp::Sig, src, None);
                m.set_stream_elem(out_tile, h, w, producer);
            }
        }
    }
    drop(m);
    ImagePixelStream { model, id: ys }
}

/// Max pooling over `hspan` x `wspan` pixel windows
pub fn maxpool(xs: &ImagePixelStream, hspan: usize, wspan: usize) -> ImagePixelStream {
    let model = xs.model.clone();
    let mut m = model.inner().borrow_mut();
    let (image_width, image_height, n_channels) = {
        let data = &m.streams[xs.id];
        (data.image_width, data.image_height, data.n_channels)
    };
    let ys_width = (image_width - 1) / wspan + 1;
    let ys_height = (image_height - 1) / hspan + 1;
    let ys = m.add_stream(ys_width, ys_height, n_channels);
    for t in 0..m.streams[xs.id].tiles.len() {
        let in_tile = m.streams[xs.id].tiles[t];
        let out_tile = m.streams[ys].tiles[t];
        // Running MAX per output pixel
        let mut accum: Vec<Vec<Option<OpId>>> = vec![vec![None; ys_width]; ys_height];
        for hi in 0..image_height {
            for wi in 0..image_width {
                let x = m.stream_elem(in_tile, hi, wi);
                let ho = hi / hspan;
                let wo = wi / wspan;
                accum[ho][wo] = Some(match accum[ho][wo] {
                    None => x,
                    Some(prev) => m.new_alu(AluOp::Max, prev, Some(x)),
                });
                let hh = hi % hspan;
                let ww = wi % wspan;
                if (hh == hspan - 1 || hi == image_height - 1)
                    && (ww == wspan - 1 || wi == image_width - 1)
                {
                    m.set_stream_elem(out_tile, ho, wo, accum[ho][wo].unwrap());
                }
            }
        }
    }
    drop(m);
    ImagePixelStream { model, id: ys }
}

impl Mul<&ImagePixelStream> for &ConvolutionalConstantMatrix {
    type Output = ImagePixelStream;
    /// Convolution lowered to per-pixel MVMs with a sequential
    /// accumulation across (kernel position x in-channel tile), padding
    /// out-of-bounds input pixels with zeros
    fn mul(self, xs: &ImagePixelStream) -> ImagePixelStream {
        assert!(
            Model::same(&self.model, &xs.model),
            "matrix and stream must belong to the same model"
        );
        let model = self.model.clone();
        let mut m = model.inner().borrow_mut();
        let (kernel_width, kernel_height, n_in_tiles, n_out_tiles, n_out_channels) = {
            let conv = &m.conv_matrices[self.id];
            assert!(
                conv.n_in_channels == m.streams[xs.id].n_channels,
                "convolution input channels must match the stream"
            );
            (
                conv.kernel_width as i64,
                conv.kernel_height as i64,
                conv.n_in_channel_tiles(),
                conv.n_out_channel_tiles(),
                conv.n_out_channels,
            )
        };
        let image_width = m.streams[xs.id].image_width as i64;
        let image_height = m.streams[xs.id].image_height as i64;
        let mut prev_stream: Option<usize> = None;
        for kh in 0..kernel_height {
            for kw in 0..kernel_width {
                for w in 0..n_in_tiles {
                    let ys = m.add_stream(
                        image_width as usize,
                        image_height as usize,
                        n_out_channels,
                    );
                    // One hint set per input pixel: the MVMs across the
                    // out-channel tiles all fire on that pixel's tile
                    let mut hint_sets: BTreeMap<(i64, i64), Vec<OpId>> = BTreeMap::new();
                    for h in 0..n_out_tiles {
                        let mat_tile =
                            m.conv_matrices[self.id].tiles[kh as usize][kw as usize][h][w];
                        let tile_height = m.cmat_tiles[mat_tile.0].height;
                        let xs_tile = m.streams[xs.id].tiles[w];
                        let accum_in_tile = prev_stream.map(|s| m.streams[s].tiles[h]);
                        let ys_tile = m.streams[ys].tiles[h];
                        for hi in -kernel_height / 2..image_height + kernel_height / 2 {
                            for wi in -kernel_width / 2..image_width + kernel_width / 2 {
                                let ho = hi + kernel_height / 2 - kh;
                                let wo = wi + kernel_width / 2 - kw;
                                let input_in_bounds =
                                    hi >= 0 && hi < image_height && wi >= 0 && wi < image_width;
                                let output_in_bounds =
                                    ho >= 0 && ho < image_height && wo >= 0 && wo < image_width;
                                if !output_in_bounds {
                                    continue;
                                }
                                let producer = if input_in_bounds {
                                    let pixel =
                                        m.stream_elem(xs_tile, hi as usize, wi as usize);
                                    let mvm = m.new_mvm(mat_tile, pixel);
                                    hint_sets.entry((hi, wi)).or_default().push(mvm);
                                    mvm
                                } else {
                                    // Zero padding outside the image
                                    m.new_set_immediate(0, tile_height)
                                };
                                let value = match accum_in_tile {
                                    None => producer,
                                    Some(accum_tile) => {
                                        let prev = m.stream_elem(
                                            accum_tile,
                                            ho as usize,
                                            wo as usize,
                                        );
                                        m.new_alu(AluOp::Add, producer, Some(prev))
                                    }
                                };
                                m.set_stream_elem(ys_tile, ho as usize, wo as usize, value);
                            }
                        }
                    }
                    for (_, set) in hint_sets {
                        m.add_coalesceable_mvm_set(set);
                    }
                    prev_stream = Some(ys);
                }
            }
        }
        drop(m);
        ImagePixelStream {
            model,
            id: prev_stream.expect("convolution kernel must not be empty"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::OpKind;
    use crate::model::Model;
    use crate::tensors::{ConstantMatrix, InputVector, OutputVector};

    fn count_ops(model: &Model, pred: impl Fn(&OpKind) -> bool) -> usize {
        let inner = model.inner().borrow();
        inner
            .graph
            .ids()
            .filter(|op| pred(&inner.graph.op(*op).kind))
            .count()
    }

    #[test]
    fn test_mvm_emits_tile_grid_and_hint_set() {
        let model = Model::new("mvm");
        let input = InputVector::new(&model, "in", 256);
        let matrix = ConstantMatrix::new(&model, "m", 256, 256);
        let x = Vector::from(&input);
        let y = &matrix * &x;
        assert_eq!(y.length(), 256);
        // 2x2 tile grid: four MVMs, one ADD per output tile
        assert_eq!(count_ops(&model, |k| matches!(k, OpKind::Mvm { .. })), 4);
        assert_eq!(
            count_ops(&model, |k| matches!(
                k,
                OpKind::Alu {
                    op: AluOp::Add,
                    ..
                }
            )),
            2
        );
        let inner = model.inner().borrow();
        assert_eq!(inner.coalesceable_mvm_sets.len(), 1);
        assert_eq!(inner.coalesceable_mvm_sets[0].len(), 4);
    }

    #[test]
    fn test_output_assignment_creates_pseudo_outputs() {
        let model = Model::new("out");
        let input = InputVector::new(&model, "in", 5);
        let matrix = ConstantMatrix::new(&model, "m", 5, 5);
        let out = OutputVector::new(&model, "out", 5);
        let y = &matrix * &Vector::from(&input);
        out.assign(&y);
        assert_eq!(
            count_ops(&model, |k| matches!(k, OpKind::PseudoOutput { .. })),
            1
        );
        assert_eq!(
            count_ops(&model, |k| matches!(k, OpKind::PseudoInput { .. })),
            1
        );
    }

    #[test]
    #[should_panic(expected = "operand lengths must match")]
    fn test_binary_op_length_mismatch_panics() {
        let model = Model::new("len");
        let a = InputVector::new(&model, "a", 5);
        let b = InputVector::new(&model, "b", 6);
        let _ = ConstantMatrix::new(&model, "m", 5, 5);
        let _ = &Vector::from(&a) + &Vector::from(&b);
    }

    #[test]
    fn test_scalar_mul_is_immediate() {
        let model = Model::new("imm");
        let a = InputVector::new(&model, "a", 4);
        let _ = ConstantMatrix::new(&model, "m", 4, 4);
        let y = 0.5f32 * &Vector::from(&a);
        assert_eq!(y.length(), 4);
        assert_eq!(
            count_ops(&model, |k| matches!(
                k,
                OpKind::Alu {
                    op: AluOp::Muli,
                    ..
                }
            )),
            1
        );
    }

    #[test]
    fn test_training_update_is_a_sink() {
        let model = Model::new("train");
        let x1 = InputVector::new(&model, "x1", 128);
        let x2 = InputVector::new(&model, "x2", 128);
        let mut matrix = TrainingMatrix::new(&model, "w", 128, 128);
        matrix -= OuterProduct::new(&Vector::from(&x1), &Vector::from(&x2));
        let inner = model.inner().borrow();
        let outer = inner
            .graph
            .ids()
            .find(|op| {
                matches!(
                    inner.graph.op(*op).kind,
                    OpKind::Training {
                        op_type: TrainingOpType::OuterProduct,
                        ..
                    }
                )
            })
            .unwrap();
        assert_eq!(inner.graph.op(outer).operands.len(), 2);
        assert!(inner.graph.op(outer).users.is_empty());
    }

    #[test]
    fn test_convolution_emits_hint_sets_per_pixel() {
        let model = Model::new("conv");
        let stream = InputImagePixelStream::new(&model, "img", 2, 2, 8);
        let kernel = ConvolutionalConstantMatrix::new(&model, "k", 3, 3, 8, 8);
        let xs = ImagePixelStream::from(&stream);
        let ys = &kernel * &xs;
        assert_eq!(ys.n_channels(), 8);
        // Each of the 9 kernel positions sees at most 4 valid
        // (input, output) pixel pairs on a 2x2 image
        let mvms = count_ops(&model, |k| matches!(k, OpKind::Mvm { .. }));
        assert!(mvms > 0 && mvms <= 9 * 4);
        let inner = model.inner().borrow();
        assert_eq!(inner.coalesceable_mvm_sets.len(), mvms);
        assert!(inner
            .coalesceable_mvm_sets
            .iter()
            .all(|set| set.len() == 1));
    }

    #[test]
    fn test_maxpool_shrinks_image() {
        let model = Model::new("pool");
        let stream = InputImagePixelStream::new(&model, "img", 4, 4, 8);
        let _ = ConstantMatrix::new(&model, "m", 8, 8);
        let xs = ImagePixelStream::from(&stream);
        let ys = maxpool(&xs, 2, 2);
        assert_eq!(ys.image_width(), 2);
        assert_eq!(ys.image_height(), 2);
        // 16 pixels fold into 4, three MAXes per window
        assert_eq!(
            count_ops(&model, |k| matches!(
                k,
                OpKind::Alu {
                    op: AluOp::Max,
                    ..
                }
            )),
            12
        );
    }
}
