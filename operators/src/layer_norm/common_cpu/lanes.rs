use super::{Reduce, Rows};
use crate::{
    common_cpu::{Lanes, Pass},
    LaunchError,
};
use rayon::{
    iter::{IndexedParallelIterator, IntoParallelRefMutIterator, ParallelIterator},
    slice::ParallelSlice,
};

/// 每行一个硬件协作组。
pub(super) struct HardwareCohort(pub Lanes);

impl Reduce for HardwareCohort {
    fn reduce(&self, rows: &Rows, mean: &mut [f32], rstd: &mut [f32]) -> Result<(), LaunchError> {
        let Rows { x, d, epsilon } = *rows;
        let lanes = self.0;
        mean.par_iter_mut()
            .zip(rstd.par_iter_mut())
            .zip(x.par_chunks(d))
            .for_each(|((mean, rstd), x)| {
                let m = lanes.sum(x, Pass::Sum) / d as f32;
                let sum2 = lanes.sum(x, Pass::SquaredDeviation(m));
                *mean = m;
                *rstd = super::rstd(sum2, d, epsilon);
            });
        Ok(())
    }
}
