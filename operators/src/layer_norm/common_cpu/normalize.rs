use super::Rows;
use crate::common_cpu::AccessMode;
use rayon::{
    iter::{IndexedParallelIterator, IntoParallelRefIterator, ParallelIterator},
    slice::{ParallelSlice, ParallelSliceMut},
};

/// 普通访存时每个任务处理的元素数。
const BLOCK: usize = 4096;

pub(super) struct Normalize<'a> {
    pub mean: &'a [f32],
    pub rstd: &'a [f32],
    pub scale: &'a [f32],
    pub bias: &'a [f32],
}

impl Normalize<'_> {
    pub fn launch(&self, rows: &Rows, y: &mut [f32], mode: AccessMode) {
        let &Rows { x, d, .. } = rows;
        let Self {
            mean,
            rstd,
            scale,
            bias,
        } = *self;

        match mode.resolve() {
            AccessMode::Cached => {
                y.par_chunks_mut(BLOCK)
                    .enumerate()
                    .for_each(|(block, y)| {
                        let base = block * BLOCK;
                        for (i, y) in y.iter_mut().enumerate() {
                            let idx = base + i;
                            let (r, c) = (idx / d, idx % d);
                            *y = affine(x[idx], mean[r], rstd[r], scale[c], bias[c]);
                        }
                    })
            }
            AccessMode::Streaming => y
                .par_chunks_mut(d)
                .zip(x.par_chunks(d))
                .zip(mean.par_iter().zip(rstd))
                .for_each(|((y, x), (&mean, &rstd))| {
                    AccessMode::Streaming.write_row(y, x, |c| {
                        affine(x[c], mean, rstd, scale[c], bias[c])
                    })
                }),
        }
    }
}

#[inline(always)]
fn affine(x: f32, mean: f32, rstd: f32, scale: f32, bias: f32) -> f32 {
    (x - mean) * rstd * scale + bias
}
