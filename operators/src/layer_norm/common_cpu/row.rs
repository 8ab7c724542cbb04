use super::{Reduce, Rows};
use crate::LaunchError;
use rayon::{
    iter::{IndexedParallelIterator, IntoParallelRefMutIterator, ParallelIterator},
    slice::ParallelSlice,
};

/// 每行一个工作者。
pub(super) struct RowPerWorker;

impl Reduce for RowPerWorker {
    fn reduce(&self, rows: &Rows, mean: &mut [f32], rstd: &mut [f32]) -> Result<(), LaunchError> {
        let Rows { x, d, epsilon } = *rows;
        mean.par_iter_mut()
            .zip(rstd.par_iter_mut())
            .zip(x.par_chunks(d))
            .for_each(|((mean, rstd), x)| {
                let mut sum = 0.;
                for &x in x {
                    sum += x;
                }
                let m = sum / d as f32;

                let mut sum2 = 0.;
                for &x in x {
                    let d = x - m;
                    sum2 += d * d;
                }

                *mean = m;
                *rstd = super::rstd(sum2, d, epsilon);
            });
        Ok(())
    }
}
