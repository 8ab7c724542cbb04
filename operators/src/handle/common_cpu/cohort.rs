use crate::{args_not_support, execution_failed, resource_exhausted, LaunchError, SchemeError};
use log::debug;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::{
    atomic::{AtomicU32, Ordering::Relaxed},
    Barrier, Mutex,
};

/// 协作线程池。
///
/// 池中 `width × cohorts` 个线程被划分为 `cohorts` 个协作组，每组 `width` 个线程。
/// 每次发射时，每个线程恰好执行一次任务，组内线程共享一块 `width` 大小的暂存区和一个屏障。
pub struct CohortPool {
    width: usize,
    cohorts: usize,
    pool: ThreadPool,
    launch: Mutex<()>,
}

/// 协作组中的一个线程。
pub struct CohortRank<'a> {
    cohort: usize,
    rank: usize,
    cohorts: usize,
    group: &'a Group,
}

struct Group {
    scratch: Box<[AtomicU32]>,
    barrier: Barrier,
}

impl CohortPool {
    pub fn new(width: usize, cohorts: usize) -> Result<Self, SchemeError> {
        if !width.is_power_of_two() {
            return Err(args_not_support(format!(
                "cohort width {width} is not a power of two"
            )));
        }
        if cohorts == 0 {
            return Err(args_not_support("a cohort pool needs at least one cohort"));
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(width * cohorts)
            .thread_name(move |i| format!("cohort{}.{}", i / width, i % width))
            .build()
            .map_err(|e| {
                resource_exhausted(format!(
                    "failed to spawn {cohorts} cohorts of {width} threads: {e}"
                ))
            })?;
        debug!("cohort pool ready: {cohorts} x {width} threads");

        Ok(Self {
            width,
            cohorts,
            pool,
            launch: Mutex::new(()),
        })
    }

    #[inline]
    pub const fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub const fn cohorts(&self) -> usize {
        self.cohorts
    }

    /// 在池中每个线程上执行一次 `f`，按线程序号返回结果。
    ///
    /// 同一组内的线程必须以相同的次数调用 [`CohortRank::reduce`]。
    pub fn launch<R, F>(&self, f: F) -> Result<Vec<R>, LaunchError>
    where
        R: Send,
        F: Fn(CohortRank) -> R + Sync,
    {
        // 两次发射在同一个池中交错会令各组屏障互相等待
        let _guard = self
            .launch
            .lock()
            .map_err(|_| execution_failed("cohort pool poisoned by a panicked launch"))?;

        let groups = (0..self.cohorts)
            .map(|_| Group {
                scratch: (0..self.width).map(|_| AtomicU32::new(0)).collect(),
                barrier: Barrier::new(self.width),
            })
            .collect::<Vec<_>>();

        Ok(self.pool.broadcast(|ctx| {
            let i = ctx.index();
            let cohort = i / self.width;
            f(CohortRank {
                cohort,
                rank: i % self.width,
                cohorts: self.cohorts,
                group: &groups[cohort],
            })
        }))
    }
}

impl CohortRank<'_> {
    #[inline]
    pub const fn cohort(&self) -> usize {
        self.cohort
    }

    #[inline]
    pub const fn cohorts(&self) -> usize {
        self.cohorts
    }

    #[inline]
    pub const fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.group.scratch.len()
    }

    /// 组内求和，每个线程都得到全组之和。
    ///
    /// 各线程先写入以序号确定的暂存位置，再以折半树规约，每一步之间以屏障分隔。
    pub fn reduce(&self, value: f32) -> f32 {
        let Group { scratch, barrier } = self.group;
        let rank = self.rank;

        scratch[rank].store(value.to_bits(), Relaxed);
        barrier.wait();

        let mut stride = scratch.len() / 2;
        while stride > 0 {
            if rank < stride {
                let a = f32::from_bits(scratch[rank].load(Relaxed));
                let b = f32::from_bits(scratch[rank + stride].load(Relaxed));
                scratch[rank].store((a + b).to_bits(), Relaxed);
            }
            barrier.wait();
            stride /= 2;
        }

        let total = f32::from_bits(scratch[0].load(Relaxed));
        // 所有线程读完结果之后暂存区才能被下一次规约覆盖
        barrier.wait();
        total
    }
}
