//! Tensors of the front-end DSL and their tiled storage
//!
//! Every tensor is partitioned into tiles no larger than one MVMU
//! dimension: vectors along their single axis, matrices into a 2D grid
//! of 128x128 tiles (zero-padded at the edges when the weights are
//! exported), convolutional matrices into a 4D grid indexed by kernel
//! position and channel tiles, and image pixel streams on the channel
//! axis. Tile data lives in arenas on the model; the public handle
//! types (`InputVector`, `ConstantMatrix`, ...) are cheap clones that
//! name an arena entry.

use crate::graph::OpId;
use crate::hardware::{n_vector_tiles, vector_tile_size};
use crate::model::{Model, ModelImpl, ModelType};

/// Handle to a named external input vector tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InputTileId(pub(crate) usize);

/// Handle to a named external output vector tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputTileId(pub(crate) usize);

/// Handle to one constant matrix tile (at most 128x128)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CmatTileId(pub(crate) usize);

/// Handle to one training matrix tile (at most 128x128)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TmatTileId(pub(crate) usize);

/// A named input or output vector tile bound to an external buffer
#[derive(Debug)]
pub struct IoTile {
    pub name: String,
    pub length: usize,
}

/// One 128x128 (or smaller, at matrix edges) weight tile
#[derive(Debug)]
pub struct MatTile {
    pub name: String,
    pub width: usize,
    pub height: usize,
    /// Matrix operations firing on this tile, in creation order
    pub users: Vec<OpId>,
}

/// A named external input vector, tiled along its length
#[derive(Debug)]
pub struct InputVectorData {
    pub name: String,
    pub length: usize,
    pub tiles: Vec<InputTileId>,
}

/// A named external output vector, tiled along its length
#[derive(Debug)]
pub struct OutputVectorData {
    pub name: String,
    pub length: usize,
    pub tiles: Vec<OutputTileId>,
}

/// A hidden vector; each tile is the producer operation computing it
#[derive(Debug)]
pub struct VectorData {
    pub length: usize,
    pub tiles: Vec<Option<OpId>>,
}

/// A constant matrix, tiled into a height x width grid
#[derive(Debug)]
pub struct ConstMatrixData {
    pub name: String,
    pub width: usize,
    pub height: usize,
    /// Indexed `tiles[h][w]`
    pub tiles: Vec<Vec<CmatTileId>>,
}

impl ConstMatrixData {
    pub fn n_height_tiles(&self) -> usize {
        n_vector_tiles(self.height)
    }

    pub fn n_width_tiles(&self) -> usize {
        n_vector_tiles(self.width)
    }
}

/// A convolutional constant matrix: a constant matrix tile per
/// (kernel_h, kernel_w, out-channel tile, in-channel tile)
#[derive(Debug)]
pub struct ConvMatrixData {
    pub name: String,
    pub kernel_width: usize,
    pub kernel_height: usize,
    pub n_in_channels: usize,
    pub n_out_channels: usize,
    /// Indexed `tiles[kh][kw][h][w]`
    pub tiles: Vec<Vec<Vec<Vec<CmatTileId>>>>,
}

impl ConvMatrixData {
    pub fn n_in_channel_tiles(&self) -> usize {
        n_vector_tiles(self.n_in_channels)
    }

    pub fn n_out_channel_tiles(&self) -> usize {
        n_vector_tiles(self.n_out_channels)
    }
}

/// A training matrix, tiled into a height x width grid
#[derive(Debug)]
pub struct TrainMatrixData {
    pub name: String,
    pub width: usize,
    pub height: usize,
    /// Indexed `tiles[h][w]`
    pub tiles: Vec<Vec<TmatTileId>>,
}

impl TrainMatrixData {
    pub fn n_height_tiles(&self) -> usize {
        n_vector_tiles(self.height)
    }

    pub fn n_width_tiles(&self) -> usize {
        n_vector_tiles(self.width)
    }
}

/// One channel tile of an input pixel stream: a named input vector tile
/// per image pixel
#[derive(Debug)]
pub struct InStreamTileData {
    pub image_width: usize,
    pub image_height: usize,
    pub n_channels: usize,
    /// Row-major `elems[h * image_width + w]`
    pub elems: Vec<InputTileId>,
}

/// One channel tile of a hidden pixel stream: a producer per pixel
#[derive(Debug)]
pub struct StreamTileData {
    pub image_width: usize,
    pub image_height: usize,
    pub n_channels: usize,
    pub elems: Vec<Option<OpId>>,
}

/// One channel tile of an output pixel stream
#[derive(Debug)]
pub struct OutStreamTileData {
    pub image_width: usize,
    pub image_height: usize,
    pub n_channels: usize,
    pub elems: Vec<OutputTileId>,
}

/// A named external input image pixel stream, tiled on the channel axis
#[derive(Debug)]
pub struct InputStreamData {
    pub name: String,
    pub image_width: usize,
    pub image_height: usize,
    pub n_channels: usize,
    pub tiles: Vec<usize>,
}

/// A hidden image pixel stream
#[derive(Debug)]
pub struct StreamData {
    pub image_width: usize,
    pub image_height: usize,
    pub n_channels: usize,
    pub tiles: Vec<usize>,
}

/// A named external output image pixel stream
#[derive(Debug)]
pub struct OutputStreamData {
    pub name: String,
    pub image_width: usize,
    pub image_height: usize,
    pub n_channels: usize,
    pub tiles: Vec<usize>,
}

impl ModelImpl {
    pub(crate) fn add_input_vector(&mut self, name: &str, length: usize) -> usize {
        assert!(length > 0, "input vector {} must not be empty", name);
        let mut tiles = Vec::with_capacity(n_vector_tiles(length));
        for t in 0..n_vector_tiles(length) {
            let id = InputTileId(self.input_tiles.len());
            self.input_tiles.push(IoTile {
                name: format!("{}[{}]", name, t),
                length: vector_tile_size(length, t),
            });
            tiles.push(id);
        }
        self.input_vectors.push(InputVectorData {
            name: name.to_string(),
            length,
            tiles,
        });
        self.input_vectors.len() - 1
    }

    pub(crate) fn add_output_vector(&mut self, name: &str, length: usize) -> usize {
        assert!(length > 0, "output vector {} must not be empty", name);
        let mut tiles = Vec::with_capacity(n_vector_tiles(length));
        for t in 0..n_vector_tiles(length) {
            let id = OutputTileId(self.output_tiles.len());
            self.output_tiles.push(IoTile {
                name: format!("{}[{}]", name, t),
                length: vector_tile_size(length, t),
            });
            tiles.push(id);
        }
        self.output_vectors.push(OutputVectorData {
            name: name.to_string(),
            length,
            tiles,
        });
        self.output_vectors.len() - 1
    }

    pub(crate) fn add_vector(&mut self, length: usize) -> usize {
        self.vectors.push(VectorData {
            length,
            tiles: vec![None; n_vector_tiles(length)],
        });
        self.vectors.len() - 1
    }

    pub(crate) fn set_vector_tile(&mut self, vector: usize, t: usize, producer: OpId) {
        let slot = &mut self.vectors[vector].tiles[t];
        assert!(slot.is_none(), "cannot reassign vector tile");
        *slot = Some(producer);
    }

    pub(crate) fn vector_tile(&self, vector: usize, t: usize) -> OpId {
        self.vectors[vector].tiles[t].expect("vector tile has no producer")
    }

    fn new_cmat_tile(&mut self, name: String, width: usize, height: usize) -> CmatTileId {
        let id = CmatTileId(self.cmat_tiles.len());
        self.cmat_tiles.push(MatTile {
            name,
            width,
            height,
            users: Vec::new(),
        });
        id
    }

    pub(crate) fn add_constant_matrix(
        &mut self,
        name: &str,
        width: usize,
        height: usize,
    ) -> usize {
        self.specialize(ModelType::Inference);
        let n_h = n_vector_tiles(height);
        let n_w = n_vector_tiles(width);
        let mut tiles = Vec::with_capacity(n_h);
        for h in 0..n_h {
            let tile_height = vector_tile_size(height, h);
            let mut row = Vec::with_capacity(n_w);
            for w in 0..n_w {
                let tile_width = vector_tile_size(width, w);
                row.push(self.new_cmat_tile(
                    format!("{}[{}][{}]", name, h, w),
                    tile_width,
                    tile_height,
                ));
            }
            tiles.push(row);
        }
        self.const_matrices.push(ConstMatrixData {
            name: name.to_string(),
            width,
            height,
            tiles,
        });
        self.const_matrices.len() - 1
    }

    pub(crate) fn add_conv_matrix(
        &mut self,
        name: &str,
        kernel_width: usize,
        kernel_height: usize,
        n_in_channels: usize,
        n_out_channels: usize,
    ) -> usize {
        self.specialize(ModelType::Inference);
        let n_h = n_vector_tiles(n_out_channels);
        let n_w = n_vector_tiles(n_in_channels);
        let mut tiles = Vec::with_capacity(kernel_height);
        for kh in 0..kernel_height {
            let mut kernel_row = Vec::with_capacity(kernel_width);
            for kw in 0..kernel_width {
                let mut out_rows = Vec::with_capacity(n_h);
                for h in 0..n_h {
                    let tile_height = vector_tile_size(n_out_channels, h);
                    let mut row = Vec::with_capacity(n_w);
                    for w in 0..n_w {
                        let tile_width = vector_tile_size(n_in_channels, w);
                        row.push(self.new_cmat_tile(
                            format!("{}[{}][{}][{}][{}]", name, kh, kw, h, w),
                            tile_width,
                            tile_height,
                        ));
                    }
                    out_rows.push(row);
                }
                kernel_row.push(out_rows);
            }
            tiles.push(kernel_row);
        }
        self.conv_matrices.push(ConvMatrixData {
            name: name.to_string(),
            kernel_width,
            kernel_height,
            n_in_channels,
            n_out_channels,
            tiles,
        });
        self.conv_matrices.len() - 1
    }

    pub(crate) fn add_training_matrix(
        &mut self,
        name: &str,
        width: usize,
        height: usize,
    ) -> usize {
        self.specialize(ModelType::Training);
        let n_h = n_vector_tiles(height);
        let n_w = n_vector_tiles(width);
        let mut tiles = Vec::with_capacity(n_h);
        for h in 0..n_h {
            let tile_height = vector_tile_size(height, h);
            let mut row = Vec::with_capacity(n_w);
            for w in 0..n_w {
                let tile_width = vector_tile_size(width, w);
                let id = TmatTileId(self.tmat_tiles.len());
                self.tmat_tiles.push(MatTile {
                    name: format!("{}[{}][{}]", name, h, w),
                    width: tile_width,
                    height: tile_height,
                    users: Vec::new(),
                });
                row.push(id);
            }
            tiles.push(row);
        }
        self.training_matrices.push(TrainMatrixData {
            name: name.to_string(),
            width,
            height,
            tiles,
        });
        self.training_matrices.len() - 1
    }

    pub(crate) fn add_input_stream(
        &mut self,
        name: &str,
        image_width: usize,
        image_height: usize,
        n_channels: usize,
    ) -> usize {
        let mut tiles = Vec::with_capacity(n_vector_tiles(n_channels));
        for t in 0..n_vector_tiles(n_channels) {
            let tile_channels = vector_tile_size(n_channels, t);
            let mut elems = Vec::with_capacity(image_height * image_width);
            for h in 0..image_height {
                for w in 0..image_width {
                    let id = InputTileId(self.input_tiles.len());
                    self.input_tiles.push(IoTile {
                        name: format!("{}[{}][{}][{}]", name, t, h, w),
                        length: tile_channels,
                    });
                    elems.push(id);
                }
            }
            let tile = self.in_stream_tiles.len();
            self.in_stream_tiles.push(InStreamTileData {
                image_width,
                image_height,
                n_channels: tile_channels,
                elems,
            });
            tiles.push(tile);
        }
        self.input_streams.push(InputStreamData {
            name: name.to_string(),
            image_width,
            image_height,
            n_channels,
            tiles,
        });
        self.input_streams.len() - 1
    }

    pub(crate) fn add_stream(
        &mut self,
        image_width: usize,
        image_height: usize,
        n_channels: usize,
    ) -> usize {
        let mut tiles = Vec::with_capacity(n_vector_tiles(n_channels));
        for t in 0..n_vector_tiles(n_channels) {
            let tile_channels = vector_tile_size(n_channels, t);
            let tile = self.stream_tiles.len();
            self.stream_tiles.push(StreamTileData {
                image_width,
                image_height,
                n_channels: tile_channels,
                elems: vec![None; image_height * image_width],
            });
            tiles.push(tile);
        }
        self.streams.push(StreamData {
            image_width,
            image_height,
            n_channels,
            tiles,
        });
        self.streams.len() - 1
    }

    pub(crate) fn add_output_stream(
        &mut self,
        name: &str,
        image_width: usize,
        image_height: usize,
        n_channels: usize,
    ) -> usize {
        let mut tiles = Vec::with_capacity(n_vector_tiles(n_channels));
        for t in 0..n_vector_tiles(n_channels) {
            let tile_channels = vector_tile_size(n_channels, t);
            let mut elems = Vec::with_capacity(image_height * image_width);
            for h in 0..image_height {
                for w in 0..image_width {
                    let id = OutputTileId(self.output_tiles.len());
                    self.output_tiles.push(IoTile {
                        name: format!("{}[{}][{}][{}]", name, t, h, w),
                        length: tile_channels,
                    });
                    elems.push(id);
                }
            }
            let tile = self.out_stream_tiles.len();
            self.out_stream_tiles.push(OutStreamTileData {
                image_width,
                image_height,
                n_channels: tile_channels,
                elems,
            });
            tiles.push(tile);
        }
        self.output_streams.push(OutputStreamData {
            name: name.to_string(),
            image_width,
            image_height,
            n_channels,
            tiles,
        });
        self.output_streams.len() - 1
    }

    pub(crate) fn set_stream_elem(&mut self, tile: usize, h: usize, w: usize, producer: OpId) {
        let data = &mut self.stream_tiles[tile];
        let idx = h * data.image_width + w;
        assert!(
            self.graph.op(producer).length == data.n_channels,
            "pixel producer length must match the stream's channel tile"
        );
        data.elems[idx] = Some(producer);
    }

    pub(crate) fn stream_elem(&self, tile: usize, h: usize, w: usize) -> OpId {
        let data = &self.stream_tiles[tile];
        data.elems[h * data.image_width + w].expect("stream pixel has no producer")
    }
}

/// An external input vector handle
#[derive(Clone)]
pub struct InputVector {
    pub(crate) model: Model,
    pub(crate) id: usize,
}

impl InputVector {
    pub fn new(model: &Model, name: &str, length: usize) -> Self {
        let id = model.inner().borrow_mut().add_input_vector(name, length);
        Self {
            model: model.clone(),
            id,
        }
    }

    pub fn length(&self) -> usize {
        self.model.inner().borrow().input_vectors[self.id].length
    }
}

/// An external output vector handle
#[derive(Clone)]
pub struct OutputVector {
    pub(crate) model: Model,
    pub(crate) id: usize,
}

impl OutputVector {
    pub fn new(model: &Model, name: &str, length: usize) -> Self {
        let id = model.inner().borrow_mut().add_output_vector(name, length);
        Self {
            model: model.clone(),
            id,
        }
    }

    pub fn length(&self) -> usize {
        self.model.inner().borrow().output_vectors[self.id].length
    }
}

/// A hidden vector produced by DSL operations
#[derive(Clone)]
pub struct Vector {
    pub(crate) model: Model,
    pub(crate) id: usize,
}

impl Vector {
    pub fn length(&self) -> usize {
        self.model.inner().borrow().vectors[self.id].length
    }

    pub fn n_tiles(&self) -> usize {
        n_vector_tiles(self.length())
    }
}

/// A constant (inference) matrix handle
#[derive(Clone)]
pub struct ConstantMatrix {
    pub(crate) model: Model,
    pub(crate) id: usize,
}

impl ConstantMatrix {
    /// `width` columns (input length), `height` rows (output length)
    pub fn new(model: &Model, name: &str, width: usize, height: usize) -> Self {
        let id = model
            .inner()
            .borrow_mut()
            .add_constant_matrix(name, width, height);
        Self {
            model: model.clone(),
            id,
        }
    }
}

/// A convolutional constant matrix handle
#[derive(Clone)]
pub struct ConvolutionalConstantMatrix {
    pub(crate) model: Model,
    pub(crate) id: usize,
}

impl ConvolutionalConstantMatrix {
    pub fn new(
        model: &Model,
        name: &str,
        kernel_width: usize,
        kernel_height: usize,
        n_in_channels: usize,
        n_out_channels: usize,
    ) -> Self {
        let id = model.inner().borrow_mut().add_conv_matrix(
            name,
            kernel_width,
            kernel_height,
            n_in_channels,
            n_out_channels,
        );
        Self {
            model: model.clone(),
            id,
        }
    }
}

/// A training matrix handle
#[derive(Clone)]
pub struct TrainingMatrix {
    pub(crate) model: Model,
    pub(crate) id: usize,
}

impl TrainingMatrix {
    pub fn new(model: &Model, name: &str, width: usize, height: usize) -> Self {
        let id = model
            .inner()
            .borrow_mut()
            .add_training_matrix(name, width, height);
        Self {
            model: model.clone(),
            id,
        }
    }

    /// View of the transposed matrix for backward-pass MVMs
    pub fn t(&self) -> Transpose {
        Transpose {
            matrix: self.clone(),
        }
    }
}

/// Transposed view of a training matrix
#[derive(Clone)]
pub struct Transpose {
    pub(crate) matrix: TrainingMatrix,
}

/// Deferred outer product of two vectors, consumed by `TrainingMatrix`'s
/// `-=` update
#[derive(Clone)]
pub struct OuterProduct {
    pub(crate) x1: Vector,
    pub(crate) x2: Vector,
}

impl OuterProduct {
    pub fn new(x1: &Vector, x2: &Vector) -> Self {
        assert!(
            Model::same(&x1.model, &x2.model),
            "outer product operands must belong to the same model"
        );
        Self {
            x1: x1.clone(),
            x2: x2.clone(),
        }
    }
}

/// An external input image pixel stream handle
#[derive(Clone)]
pub struct InputImagePixelStream {
    pub(crate) model: Model,
    pub(crate) id: usize,
}

impl InputImagePixelStream {
    pub fn new(
        model: &Model,
        name: &str,
        image_width: usize,
        image_height: usize,
        n_channels: usize,
    ) -> Self {
        let id = model.inner().borrow_mut().add_input_stream(
            name,
            image_width,
            image_height,
            n_channels,
        );
        Self {
            model: model.clone(),
            id,
        }
    }
}

/// A hidden image pixel stream
#[derive(Clone)]
pub struct ImagePixelStream {
    pub(crate) model: Model,
    pub(crate) id: usize,
}

impl ImagePixelStream {
    pub fn image_width(&self) -> usize {
        self.model.inner().borrow().streams[self.id].image_width
    }

    pub fn image_height(&self) -> usize {
        self.model.inner().borrow().streams[self.id].image_height
    }

    pub fn n_channels(&self) -> usize {
        self.model.inner().borrow().streams[self.id].n_channels
    }
}

/// An external output image pixel stream handle
#[derive(Clone)]
pub struct OutputImagePixelStream {
    pub(crate) model: Model,
    pub(crate) id: usize,
}

impl OutputImagePixelStream {
    pub fn new(
        model: &Model,
        name: &str,
        image_width: usize,
        image_height: usize,
        n_channels: usize,
    ) -> Self {
        let id = model.inner().borrow_mut().add_output_stream(
            name,
            image_width,
            image_height,
            n_channels,
        );
        Self {
            model: model.clone(),
            id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::MVMU_DIM;
    use crate::model::Model;

    #[test]
    fn test_vector_tiling_shapes() {
        let model = Model::new("tiling");
        let vec = InputVector::new(&model, "in", 200);
        assert_eq!(vec.length(), 200);
        let inner = model.inner().borrow();
        let data = &inner.input_vectors[vec.id];
        assert_eq!(data.tiles.len(), 2);
        assert_eq!(inner.input_tiles[data.tiles[0].0].length, 128);
        assert_eq!(inner.input_tiles[data.tiles[1].0].length, 72);
        assert_eq!(inner.input_tiles[data.tiles[1].0].name, "in[1]");
    }

    #[test]
    fn test_constant_matrix_tiling() {
        let model = Model::new("tiling");
        let mat = ConstantMatrix::new(&model, "m", 300, 150);
        let inner = model.inner().borrow();
        let data = &inner.const_matrices[mat.id];
        assert_eq!(data.n_height_tiles(), 2);
        assert_eq!(data.n_width_tiles(), 3);
        let corner = &inner.cmat_tiles[data.tiles[1][2].0];
        assert_eq!(corner.width, 300 - 2 * MVMU_DIM);
        assert_eq!(corner.height, 150 - MVMU_DIM);
        assert_eq!(corner.name, "m[1][2]");
    }

    #[test]
    fn test_conv_matrix_tiling() {
        let model = Model::new("tiling");
        let mat = ConvolutionalConstantMatrix::new(&model, "k", 3, 3, 16, 200);
        let inner = model.inner().borrow();
        let data = &inner.conv_matrices[mat.id];
        assert_eq!(data.n_in_channel_tiles(), 1);
        assert_eq!(data.n_out_channel_tiles(), 2);
        let tile = &inner.cmat_tiles[data.tiles[2][1][1][0].0];
        assert_eq!(tile.width, 16);
        assert_eq!(tile.height, 72);
        assert_eq!(tile.name, "k[2][1][1][0]");
    }

    #[test]
    #[should_panic(expected = "Cannot mix inference and training matrices")]
    fn test_mixing_matrix_kinds_panics() {
        let model = Model::new("mixed");
        let _c = ConstantMatrix::new(&model, "c", 8, 8);
        let _t = TrainingMatrix::new(&model, "t", 8, 8);
    }

    #[test]
    fn test_input_stream_tiling() {
        let model = Model::new("stream");
        let stream = InputImagePixelStream::new(&model, "img", 4, 2, 130);
        let inner = model.inner().borrow();
        let data = &inner.input_streams[stream.id];
        assert_eq!(data.tiles.len(), 2);
        let tile0 = &inner.in_stream_tiles[data.tiles[0]];
        let tile1 = &inner.in_stream_tiles[data.tiles[1]];
        assert_eq!(tile0.n_channels, 128);
        assert_eq!(tile1.n_channels, 2);
        assert_eq!(tile0.elems.len(), 8);
        assert_eq!(inner.input_tiles[tile1.elems[5].0].name, "img[1][1][1]");
    }
}
