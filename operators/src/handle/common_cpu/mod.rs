mod cohort;
mod lanes;
mod stream;

use crate::Hardware;
use std::{num::NonZeroUsize, thread::available_parallelism};

pub use cohort::{CohortPool, CohortRank};
pub use lanes::{GroupReduce, Lanes, Pass, MAX_LANES};
pub use stream::AccessMode;

#[derive(Clone, Copy, Debug)]
pub struct Cpu;

#[derive(Clone, Copy, Debug)]
pub struct ThisThread;

impl Hardware for Cpu {
    type Byte = u8;
    type Queue<'ctx> = ThisThread;
}

impl Cpu {
    /// 单个协作组允许的最大线程数。
    pub const MAX_COHORT_WIDTH: usize = 1024;

    /// 硬件原生的同步执行宽度，即最宽向量寄存器容纳的 `f32` 数量。
    #[inline]
    pub fn native_width(&self) -> usize {
        lanes::native_width()
    }

    #[inline]
    pub fn max_cohort_width(&self) -> usize {
        Self::MAX_COHORT_WIDTH
    }

    #[inline]
    pub fn parallelism(&self) -> usize {
        available_parallelism().map_or(1, NonZeroUsize::get)
    }
}
