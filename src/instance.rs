//! Model instances: binding weight data and generating data files
//!
//! An instance pairs a compiled model with concrete weight buffers.
//! `generate_data` writes one `<model>-tile<P>-core<C>-mvmu<M>.weights`
//! file per constant (or convolutional) matrix tile: 128x128 row-major
//! floats, zero-padded outside the tile's actual extent, addressed by
//! the tile's physical placement.

use std::collections::HashMap;
use std::fs;
use std::io::Write;

use crate::error::{CompileError, CompileResult};
use crate::hardware::MVMU_DIM;
use crate::model::Model;

/// A compiled model plus bound tensor data
pub struct ModelInstance {
    model: Model,
    tensor_data: HashMap<String, Vec<f32>>,
}

impl ModelInstance {
    pub fn new(model: &Model) -> Self {
        Self {
            model: model.clone(),
            tensor_data: HashMap::new(),
        }
    }

    /// Bind row-major data to a named matrix
    pub fn bind(&mut self, tensor_name: &str, data: &[f32]) {
        self.tensor_data.insert(tensor_name.to_string(), data.to_vec());
    }

    /// Write the per-MVMU weight files for every constant and
    /// convolutional matrix
    pub fn generate_data(&self) -> CompileResult<()> {
        let inner = self.model.inner().borrow();
        let compiled = inner.compiled.as_ref().ok_or_else(|| {
            CompileError::io_binding("model must be compiled before generating data")
        })?;
        let partitioner = &compiled.partitioner;
        let placer = &compiled.placer;
        let output_dir = &compiled.options.output_dir;

        for mat in &inner.const_matrices {
            let data = self.tensor_data.get(&mat.name).ok_or_else(|| {
                CompileError::io_binding(format!("no data bound for matrix {}", mat.name))
            })?;
            for h in 0..mat.n_height_tiles() {
                for w in 0..mat.n_width_tiles() {
                    let tile_id = mat.tiles[h][w];
                    let tile = &inner.cmat_tiles[tile_id.0];
                    let file_name = format!(
                        "{}-tile{}-core{}-mvmu{}.weights",
                        inner.name(),
                        placer.ptile_of_cmat(partitioner, tile_id),
                        placer.pcore_of_cmat(partitioner, tile_id),
                        placer.pmvmu_of_cmat(partitioner, tile_id),
                    );
                    let mut out = fs::File::create(output_dir.join(file_name))?;
                    for row in 0..MVMU_DIM {
                        for col in 0..MVMU_DIM {
                            if row < tile.height && col < tile.width {
                                let value = data
                                    [(h * MVMU_DIM + row) * mat.width + w * MVMU_DIM + col];
                                write!(out, "{} ", value)?;
                            } else {
                                write!(out, "0.0 ")?;
                            }
                        }
                    }
                }
            }
        }

        for mat in &inner.conv_matrices {
            let data = self.tensor_data.get(&mat.name).ok_or_else(|| {
                CompileError::io_binding(format!("no data bound for matrix {}", mat.name))
            })?;
            for kh in 0..mat.kernel_height {
                for kw in 0..mat.kernel_width {
                    for h in 0..mat.n_out_channel_tiles() {
                        for w in 0..mat.n_in_channel_tiles() {
                            let tile_id = mat.tiles[kh][kw][h][w];
                            let tile = &inner.cmat_tiles[tile_id.0];
                            let file_name = format!(
                                "{}-tile{}-core{}-mvmu{}.weights",
                                inner.name(),
                                placer.ptile_of_cmat(partitioner, tile_id),
                                placer.pcore_of_cmat(partitioner, tile_id),
                                placer.pmvmu_of_cmat(partitioner, tile_id),
                            );
                            let mut out = fs::File::create(output_dir.join(file_name))?;
                            for row in 0..MVMU_DIM {
                                for col in 0..MVMU_DIM {
                                    if row < tile.height && col < tile.width {
                                        let value = data[((kh * mat.kernel_width + kw)
                                            * mat.n_out_channels
                                            + h * MVMU_DIM
                                            + row)
                                            * mat.n_in_channels
                                            + w * MVMU_DIM
                                            + col];
                                        write!(out, "{} ", value)?;
                                    } else {
                                        write!(out, "0.0 ")?;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl Model {
    /// Create an instance of this (compiled) model
    pub fn instance(&self) -> ModelInstance {
        ModelInstance::new(self)
    }
}
