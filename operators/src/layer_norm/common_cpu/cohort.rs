use super::{Reduce, Rows};
use crate::{common_cpu::CohortPool, LaunchError};

/// 每行一个协作组，组内以暂存区和屏障规约。
pub(super) struct Cohort<'a>(pub &'a CohortPool);

#[derive(Clone, Copy)]
struct Stats {
    mean: *mut f32,
    rstd: *mut f32,
}

unsafe impl Send for Stats {}
unsafe impl Sync for Stats {}

impl Stats {
    /// # Safety
    ///
    /// 每个 `i` 只能由一个线程写入一次。
    #[inline]
    unsafe fn write(&self, i: usize, mean: f32, rstd: f32) {
        self.mean.add(i).write(mean);
        self.rstd.add(i).write(rstd);
    }
}

impl Reduce for Cohort<'_> {
    fn reduce(&self, rows: &Rows, mean: &mut [f32], rstd: &mut [f32]) -> Result<(), LaunchError> {
        let n = mean.len();
        if n == 0 {
            return Ok(());
        }

        let Rows { x, d, epsilon } = *rows;
        let stats = Stats {
            mean: mean.as_mut_ptr(),
            rstd: rstd.as_mut_ptr(),
        };

        self.0.launch(|rank| {
            let (k, width) = (rank.rank(), rank.width());
            // 同组线程访问同样的行序列，保证各自调用 reduce 的次数相同
            for i in (rank.cohort()..n).step_by(rank.cohorts()) {
                let x = &x[i * d..][..d];

                let sum = rank.reduce(x.iter().skip(k).step_by(width).sum());
                let m = sum / d as f32;

                let sum2 = rank.reduce(
                    x.iter()
                        .skip(k)
                        .step_by(width)
                        .map(|&x| {
                            let d = x - m;
                            d * d
                        })
                        .sum(),
                );

                if k == 0 {
                    // 每行只由所在组的 0 号线程写
                    unsafe { stats.write(i, m, super::rstd(sum2, d, epsilon)) }
                }
            }
        })?;
        Ok(())
    }
}
