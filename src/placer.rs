//! Physical layout: virtual tiles, cores, and MVMUs onto hardware
//!
//! Virtual tiles 0 and 1 map to physical tiles 0 and 1 (input and
//! output); the rest map identically. Within a tile, virtual cores
//! take physical core slots in ascending order; within a core, virtual
//! MVMUs take physical MVMU slots in ascending order. Exceeding a
//! physical capacity is a fatal placement error.

use crate::error::{CompileError, CompileResult};
use crate::graph::OpId;
use crate::hardware::N_CORES_PER_TILE;
use crate::model::ModelImpl;
use crate::partitioner::Partitioner;
use crate::tensors::{CmatTileId, TmatTileId};

/// Virtual-to-physical unit maps
pub struct Placer {
    vtile2ptile: Vec<usize>,
    vcore2pcore: Vec<usize>,
    vmvmu2pmvmu: Vec<usize>,
    n_ptiles: usize,
    n_pcores: usize,
    n_pmvmus: usize,
}

impl Placer {
    pub fn run(model: &ModelImpl, partitioner: &Partitioner) -> CompileResult<Self> {
        let mut placer = Placer {
            vtile2ptile: Vec::new(),
            vcore2pcore: Vec::new(),
            vmvmu2pmvmu: Vec::new(),
            n_ptiles: 0,
            n_pcores: 0,
            n_pmvmus: 0,
        };
        placer.assign_ptiles(partitioner);
        placer.assign_pcores(partitioner)?;
        placer.assign_pmvmus(model, partitioner)?;
        Ok(placer)
    }

    fn assign_ptiles(&mut self, partitioner: &Partitioner) {
        self.n_ptiles = partitioner.n_vtiles();
        self.vtile2ptile = (0..partitioner.n_vtiles()).collect();
    }

    fn assign_pcores(&mut self, partitioner: &Partitioner) -> CompileResult<()> {
        self.n_pcores = self.n_ptiles * N_CORES_PER_TILE;
        self.vcore2pcore = vec![0; partitioner.n_vcores()];
        let mut cores_per_ptile = vec![0usize; self.n_ptiles];
        for vcore in 0..partitioner.n_vcores() {
            let vtile = partitioner.vtile_of_vcore(vcore);
            let ptile = self.vtile2ptile[vtile];
            let pcore = cores_per_ptile[ptile];
            cores_per_ptile[ptile] += 1;
            if pcore >= N_CORES_PER_TILE {
                return Err(CompileError::placement(format!(
                    "physical tile {} exceeds {} cores",
                    ptile, N_CORES_PER_TILE
                )));
            }
            self.vcore2pcore[vcore] = pcore;
        }
        Ok(())
    }

    fn assign_pmvmus(
        &mut self,
        model: &ModelImpl,
        partitioner: &Partitioner,
    ) -> CompileResult<()> {
        let mvmus_per_core = model.mvmus_per_core();
        self.n_pmvmus = self.n_pcores * mvmus_per_core;
        self.vmvmu2pmvmu = vec![0; partitioner.n_vmvmus()];
        let mut mvmus_per_pcore = vec![0usize; self.n_pcores];
        for vmvmu in 0..partitioner.n_vmvmus() {
            let vcore = partitioner.vcore_of_vmvmu(vmvmu);
            let pcore = self.vcore2pcore[vcore];
            let vtile = partitioner.vtile_of_vcore(vcore);
            let ptile = self.vtile2ptile[vtile];
            let slot = ptile * N_CORES_PER_TILE + pcore;
            let pmvmu = mvmus_per_pcore[slot];
            mvmus_per_pcore[slot] += 1;
            if pmvmu >= mvmus_per_core {
                return Err(CompileError::placement(format!(
                    "physical core {} of tile {} exceeds {} MVMUs",
                    pcore, ptile, mvmus_per_core
                )));
            }
            self.vmvmu2pmvmu[vmvmu] = pmvmu;
        }
        Ok(())
    }

    pub fn n_ptiles(&self) -> usize {
        self.n_ptiles
    }

    pub fn n_pcores(&self) -> usize {
        self.n_pcores
    }

    pub fn n_pmvmus(&self) -> usize {
        self.n_pmvmus
    }

    pub fn ptile(&self, partitioner: &Partitioner, op: OpId) -> usize {
        self.vtile2ptile[partitioner.vtile(op)]
    }

    pub fn pcore(&self, partitioner: &Partitioner, op: OpId) -> usize {
        self.vcore2pcore[partitioner.vcore(op)]
    }

    pub fn pmvmu(&self, partitioner: &Partitioner, op: OpId) -> usize {
        self.vmvmu2pmvmu[partitioner.vmvmu(op)]
    }

    pub fn ptile_of_cmat(&self, partitioner: &Partitioner, tile: CmatTileId) -> usize {
        self.vtile2ptile
            [partitioner.vtile_of_vcore(partitioner.vcore_of_vmvmu(partitioner.vmvmu_of_cmat(tile)))]
    }

    pub fn pcore_of_cmat(&self, partitioner: &Partitioner, tile: CmatTileId) -> usize {
        self.vcore2pcore[partitioner.vcore_of_vmvmu(partitioner.vmvmu_of_cmat(tile))]
    }

    pub fn pmvmu_of_cmat(&self, partitioner: &Partitioner, tile: CmatTileId) -> usize {
        self.vmvmu2pmvmu[partitioner.vmvmu_of_cmat(tile)]
    }

    pub fn ptile_of_tmat(&self, partitioner: &Partitioner, tile: TmatTileId) -> usize {
        self.vtile2ptile
            [partitioner.vtile_of_vcore(partitioner.vcore_of_vmvmu(partitioner.vmvmu_of_tmat(tile)))]
    }

    pub fn pcore_of_tmat(&self, partitioner: &Partitioner, tile: TmatTileId) -> usize {
        self.vcore2pcore[partitioner.vcore_of_vmvmu(partitioner.vmvmu_of_tmat(tile))]
    }

    pub fn pmvmu_of_tmat(&self, partitioner: &Partitioner, tile: TmatTileId) -> usize {
        self.vmvmu2pmvmu[partitioner.vmvmu_of_tmat(tile)]
    }

    pub(crate) fn assignment_label(&self, partitioner: &Partitioner, op: OpId) -> String {
        format!(
            "\\npMVMU = {}, pCore = {}, pTile = {}",
            self.pmvmu(partitioner, op),
            self.pcore(partitioner, op),
            self.ptile(partitioner, op)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileError;
    use crate::model::{GraphPartitioningScheme, Model};
    use crate::partitioner::{GraphPartitionOracle, KahipOracle};
    use crate::tensors::{ConstantMatrix, InputVector, OutputVector, Vector};
    use std::cell::Cell;

    fn two_by_two_model() -> Model {
        let model = Model::new("placer");
        let input = InputVector::new(&model, "in", 256);
        let matrix = ConstantMatrix::new(&model, "m", 256, 256);
        let out = OutputVector::new(&model, "out", 256);
        let y = &matrix * &Vector::from(&input);
        out.assign(&y);
        model
    }

    #[test]
    fn test_identity_tile_mapping_and_ascending_slots() {
        let model = two_by_two_model();
        let inner = model.inner();
        let mut m = inner.borrow_mut();
        let partitioner =
            Partitioner::run(&mut m, GraphPartitioningScheme::RowMajor, &KahipOracle).unwrap();
        let placer = Placer::run(&m, &partitioner).unwrap();
        assert_eq!(placer.n_ptiles(), 3);
        let tiles = &m.const_matrices[0].tiles;
        assert_eq!(placer.ptile_of_cmat(&partitioner, tiles[0][0]), 2);
        assert_eq!(placer.pcore_of_cmat(&partitioner, tiles[0][0]), 0);
        assert_eq!(placer.pmvmu_of_cmat(&partitioner, tiles[0][0]), 0);
        assert_eq!(placer.pmvmu_of_cmat(&partitioner, tiles[0][1]), 1);
        assert_eq!(placer.pmvmu_of_cmat(&partitioner, tiles[1][0]), 2);
        assert_eq!(placer.pmvmu_of_cmat(&partitioner, tiles[1][1]), 3);
    }

    #[test]
    fn test_placement_is_idempotent() {
        let model = two_by_two_model();
        let inner = model.inner();
        let mut m = inner.borrow_mut();
        let partitioner =
            Partitioner::run(&mut m, GraphPartitioningScheme::RowMajor, &KahipOracle).unwrap();
        let a = Placer::run(&m, &partitioner).unwrap();
        let b = Placer::run(&m, &partitioner).unwrap();
        assert_eq!(a.vtile2ptile, b.vtile2ptile);
        assert_eq!(a.vcore2pcore, b.vcore2pcore);
        assert_eq!(a.vmvmu2pmvmu, b.vmvmu2pmvmu);
    }

    #[test]
    fn test_core_capacity_exceeded_is_an_error() {
        // 49 matrix tiles need nine core partitions; an oracle that
        // then packs every core into one tile partition overflows the
        // eight-core tile capacity
        struct Lopsided {
            call: Cell<usize>,
        }
        impl GraphPartitionOracle for Lopsided {
            fn partition(
                &self,
                num_nodes: usize,
                _num_edges: usize,
                nodes_per_partition: usize,
                _edges: &[Vec<(usize, usize)>],
            ) -> crate::error::CompileResult<Vec<usize>> {
                let call = self.call.get();
                self.call.set(call + 1);
                if call == 0 {
                    Ok((0..num_nodes).map(|n| n / nodes_per_partition).collect())
                } else {
                    Ok(vec![0; num_nodes])
                }
            }
        }
        let model = Model::new("overflow");
        let input = InputVector::new(&model, "in", 49 * 128);
        let matrix = ConstantMatrix::new(&model, "m", 49 * 128, 128);
        let out = OutputVector::new(&model, "out", 128);
        let y = &matrix * &Vector::from(&input);
        out.assign(&y);
        let inner = model.inner();
        let mut m = inner.borrow_mut();
        let partitioner = Partitioner::run(
            &mut m,
            GraphPartitioningScheme::Kahip,
            &Lopsided { call: Cell::new(0) },
        )
        .unwrap();
        let result = Placer::run(&m, &partitioner);
        assert!(matches!(
            result,
            Err(CompileError::PlacementError { .. })
        ));
    }
}
