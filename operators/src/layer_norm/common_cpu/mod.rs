mod cohort;
mod lanes;
mod normalize;
mod row;

use super::{args::Meta, Args, LayerNorm, Strategy};
use crate::{
    args_not_support,
    common_cpu::{AccessMode, CohortPool, Cpu, GroupReduce, Lanes},
    resource_exhausted, LaunchError, QueueOf, SchemeError,
};
use cohort::Cohort;
use lanes::HardwareCohort;
use log::{debug, trace};
use lru::LruCache;
use normalize::Normalize;
use row::RowPerWorker;
use std::{
    num::NonZero,
    slice::{from_raw_parts, from_raw_parts_mut},
    sync::{Arc, Mutex},
};

/// 默认缓存的协作线程池数量。
pub const POOL_CAPACITY: usize = 4;

pub struct Operator {
    pools: Mutex<LruCache<usize, Arc<CohortPool>>>,
    group_reduce: GroupReduce,
}

/// 归一化的输入行。
#[derive(Clone, Copy)]
pub(super) struct Rows<'a> {
    pub x: &'a [f32],
    pub d: usize,
    pub epsilon: f32,
}

/// 均值和标准差倒数的计算策略。
pub(super) trait Reduce: Sync {
    fn reduce(&self, rows: &Rows, mean: &mut [f32], rstd: &mut [f32]) -> Result<(), LaunchError>;
}

#[inline]
fn rstd(sum2: f32, d: usize, epsilon: f32) -> f32 {
    (sum2 / d as f32 + epsilon).sqrt().recip()
}

impl Operator {
    pub fn with_pool_capacity(capacity: NonZero<usize>) -> Self {
        Self {
            pools: Mutex::new(LruCache::new(capacity)),
            group_reduce: GroupReduce::detect(),
        }
    }

    /// 指定硬件协作组的组内求和方式。
    pub fn with_group_reduce(mut self, group_reduce: GroupReduce) -> Self {
        self.group_reduce = group_reduce;
        self
    }

    #[inline]
    pub fn set_group_reduce(&mut self, group_reduce: GroupReduce) {
        self.group_reduce = group_reduce;
    }

    #[inline]
    pub const fn group_reduce(&self) -> GroupReduce {
        self.group_reduce
    }

    fn cohort_pool(&self, width: usize) -> Result<Arc<CohortPool>, SchemeError> {
        let cohorts = (Cpu.parallelism() / width).max(1);
        self.pools
            .lock()
            .unwrap()
            .try_get_or_insert(width, || CohortPool::new(width, cohorts).map(Arc::new))
            .cloned()
    }
}

fn check_width(strategy: Strategy, width: usize) -> Result<(), SchemeError> {
    if width == 0 {
        return Err(args_not_support("cohort width must be positive"));
    }
    match strategy {
        Strategy::RowPerWorker => Ok(()),
        Strategy::Cohort if !width.is_power_of_two() => Err(args_not_support(format!(
            "cohort width {width} is not a power of two"
        ))),
        Strategy::Cohort if width > Cpu.max_cohort_width() => Err(resource_exhausted(format!(
            "cohort width {width} exceeds {}",
            Cpu.max_cohort_width()
        ))),
        Strategy::Cohort => Ok(()),
        Strategy::HardwareCohort => {
            let native = Cpu.native_width();
            if width == native {
                Ok(())
            } else {
                Err(args_not_support(format!(
                    "hardware cohort width {width} differs from native width {native}"
                )))
            }
        }
    }
}

impl LayerNorm<Cpu> for Operator {}

impl crate::Operator for Operator {
    type Hardware = Cpu;
    type Args = Args<Cpu>;

    fn new(_processor: &Self::Hardware) -> Self {
        Self::with_pool_capacity(NonZero::new(POOL_CAPACITY).unwrap())
    }

    fn scheme(&mut self, args: &Self::Args) -> Result<(), SchemeError> {
        let _meta = args.meta()?;
        check_width(args.strategy, args.cohort_width)?;
        if args.strategy == Strategy::Cohort {
            self.cohort_pool(args.cohort_width)?;
        }
        Ok(())
    }

    fn launch(
        &self,
        args: &Self::Args,
        _queue: &QueueOf<Self::Hardware>,
    ) -> Result<(), LaunchError> {
        let meta = args.meta()?;
        let (n, len) = (meta.n(), meta.numel());
        let Meta { dt, batch, seq, d } = meta;
        let Args {
            y_base,
            mean_base,
            rstd_base,
            x_base,
            scale_base,
            bias_base,
            epsilon,
            strategy,
            cohort_width: width,
            ..
        } = args;
        let (strategy, width) = (*strategy, *width);
        check_width(strategy, width)?;

        debug!("layernorm {strategy} width={width} {dt:?} [{batch}, {seq}, {d}]");
        if n == 0 {
            return Ok(());
        }

        let pool;
        let (reduce, mode): (Box<dyn Reduce + '_>, _) = match strategy {
            Strategy::RowPerWorker => (Box::new(RowPerWorker), AccessMode::Cached),
            Strategy::Cohort => {
                pool = self.cohort_pool(width)?;
                (Box::new(Cohort(&pool)), AccessMode::Cached)
            }
            Strategy::HardwareCohort => (
                Box::new(HardwareCohort(Lanes::new(width, self.group_reduce)?)),
                AccessMode::Streaming,
            ),
        };

        let x = unsafe { from_raw_parts(x_base.cast::<f32>(), len) };
        let y = unsafe { from_raw_parts_mut(y_base.cast::<f32>(), len) };
        let mean = unsafe { from_raw_parts_mut(mean_base.cast::<f32>(), n) };
        let rstd = unsafe { from_raw_parts_mut(rstd_base.cast::<f32>(), n) };
        let scale = unsafe { from_raw_parts(scale_base.cast::<f32>(), d) };
        let bias = unsafe { from_raw_parts(bias_base.cast::<f32>(), d) };

        let rows = Rows {
            x,
            d,
            epsilon: *epsilon,
        };
        reduce.reduce(&rows, mean, rstd)?;
        Normalize {
            mean,
            rstd,
            scale,
            bias,
        }
        .launch(&rows, y, mode);

        trace!("layernorm {strategy} done: {n} rows of {d}, width={width}");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{Operator, Strategy};
    use crate::{
        common::test_utils::{Diff, ErrorCollector},
        common_cpu::{Cpu, GroupReduce, ThisThread},
        layer_norm::{Args, EPSILON},
        LaunchErrorKind, Operator as _, SchemeErrorKind, TensorLayout,
    };
    use digit_layout::{types as ty, DigitLayout};
    use rand::Rng;

    struct Data {
        b: usize,
        t: usize,
        c: usize,
        x: Vec<f32>,
        scale: Vec<f32>,
        bias: Vec<f32>,
    }

    impl Data {
        fn random(b: usize, t: usize, c: usize) -> Self {
            let mut rng = rand::thread_rng();
            let mut random = |len| (0..len).map(|_| rng.gen_range(-1f32..1.)).collect::<Vec<_>>();
            Self {
                b,
                t,
                c,
                x: random(b * t * c),
                scale: random(c),
                bias: random(c),
            }
        }

        fn args(
            &self,
            strategy: Strategy,
            width: usize,
            y: &mut [f32],
            mean: &mut [f32],
            rstd: &mut [f32],
        ) -> Args<Cpu> {
            let Self { b, t, c, .. } = *self;
            let act = TensorLayout::new_contiguous(ty::F32, &[b, t, c]);
            let stat = TensorLayout::new_contiguous(ty::F32, &[b, t]);
            let param = TensorLayout::new_contiguous(ty::F32, &[c]);
            Args {
                y_layout: act.clone(),
                y_base: y.as_mut_ptr().cast(),
                mean_layout: stat.clone(),
                mean_base: mean.as_mut_ptr().cast(),
                rstd_layout: stat,
                rstd_base: rstd.as_mut_ptr().cast(),
                x_layout: act,
                x_base: self.x.as_ptr().cast(),
                scale_layout: param.clone(),
                scale_base: self.scale.as_ptr().cast(),
                bias_layout: param,
                bias_base: self.bias.as_ptr().cast(),
                epsilon: EPSILON,
                strategy,
                cohort_width: width,
            }
        }

        fn run(&self, op: &Operator, strategy: Strategy, width: usize) -> [Vec<f32>; 3] {
            let n = self.b * self.t;
            let mut y = vec![0f32; n * self.c];
            let mut mean = vec![0f32; n];
            let mut rstd = vec![0f32; n];
            let args = self.args(strategy, width, &mut y, &mut mean, &mut rstd);
            op.launch(&args, &ThisThread).unwrap();
            [y, mean, rstd]
        }

        /// 以 `f64` 顺序计算的参考结果。
        fn reference(&self) -> [Vec<f64>; 3] {
            let c = self.c;
            let mut y = Vec::with_capacity(self.x.len());
            let mut mean = Vec::new();
            let mut rstd = Vec::new();
            for row in self.x.chunks(c) {
                let m = row.iter().map(|&x| x as f64).sum::<f64>() / c as f64;
                let v = row.iter().map(|&x| (x as f64 - m).powi(2)).sum::<f64>() / c as f64;
                let r = 1. / (v + EPSILON as f64).sqrt();
                for (j, &x) in row.iter().enumerate() {
                    y.push((x as f64 - m) * r * self.scale[j] as f64 + self.bias[j] as f64);
                }
                mean.push(m);
                rstd.push(r);
            }
            [y, mean, rstd]
        }
    }

    /// 均值和标准差倒数的绝对误差不超过 1e-5。
    fn assert_stats(res: &[f32], ans: &[f64]) {
        for (i, (&res, &ans)) in res.iter().zip(ans).enumerate() {
            let diff = Diff::new(res as f64, ans);
            assert!(diff.abs <= 1e-5, "[{i}] {res} vs {ans}");
        }
    }

    fn width_of(strategy: Strategy) -> usize {
        match strategy {
            Strategy::RowPerWorker => 1,
            Strategy::Cohort => 32,
            Strategy::HardwareCohort => Cpu.native_width(),
        }
    }

    #[test]
    fn test_compute() {
        let op = Operator::new(&Cpu);
        let data = Data::random(4, 16, 768);
        let ans = data.reference();

        for strategy in Strategy::ALL {
            let res = data.run(&op, strategy, width_of(strategy));
            for (res, ans) in res.iter().zip(&ans) {
                let mut ec = ErrorCollector::new(1e-5, 1e-5);
                ec.extend(res, ans);
                println!("{strategy}: {ec}");
                let (out, count) = ec.summary();
                assert_eq!(out, 0, "{strategy}: {out}/{count}");
            }
            assert_stats(&res[1], &ans[1]);
            assert_stats(&res[2], &ans[2]);
        }
    }

    #[test]
    fn test_deterministic() {
        let op = Operator::new(&Cpu);
        let data = Data::random(3, 5, 300);
        for strategy in Strategy::ALL {
            let width = width_of(strategy);
            let first = data.run(&op, strategy, width);
            let second = data.run(&op, strategy, width);
            for (a, b) in first.iter().zip(&second) {
                assert!(a.iter().zip(b).all(|(a, b)| a.to_bits() == b.to_bits()));
            }
        }
    }

    #[test]
    fn test_identity_affine() {
        let op = Operator::new(&Cpu);
        let mut data = Data::random(2, 7, 129);
        data.scale.fill(1.);
        data.bias.fill(0.);
        for strategy in Strategy::ALL {
            let [y, mean, rstd] = data.run(&op, strategy, width_of(strategy));
            for (i, (y, x)) in y.chunks(data.c).zip(data.x.chunks(data.c)).enumerate() {
                for (&y, &x) in y.iter().zip(x) {
                    assert_eq!(y, (x - mean[i]) * rstd[i], "{strategy}");
                }
            }
        }
    }

    #[test]
    fn test_constant_row() {
        let op = Operator::new(&Cpu);
        let mut data = Data::random(1, 2, 64);
        data.x.fill(3.);
        let expected = (EPSILON as f64).sqrt().recip();
        for strategy in Strategy::ALL {
            let [y, mean, rstd] = data.run(&op, strategy, width_of(strategy));
            assert!(mean.iter().all(|&m| m == 3.), "{strategy}: {mean:?}");
            assert!(rstd
                .iter()
                .all(|&r| (r as f64 - expected).abs() / expected < 1e-6));
            for y in y.chunks(data.c) {
                assert_eq!(y, data.bias, "{strategy}");
            }
        }
    }

    #[test]
    fn test_cohort_widths() {
        let op = Operator::new(&Cpu);
        let data = Data::random(2, 2, 1000);
        let [_, mean_ans, rstd_ans] = data.reference();

        let mut width = 32;
        while width <= Cpu::MAX_COHORT_WIDTH {
            let [_, mean, rstd] = data.run(&op, Strategy::Cohort, width);
            let mut ec = ErrorCollector::new(1e-5, 1e-5);
            ec.extend(&mean, &mean_ans);
            ec.extend(&rstd, &rstd_ans);
            println!("width {width}: {ec}");
            assert_eq!(ec.summary().0, 0, "width {width}");
            assert_stats(&mean, &mean_ans);
            assert_stats(&rstd, &rstd_ans);
            width *= 2;
        }
    }

    #[test]
    fn test_group_reduce() {
        let data = Data::random(5, 3, 515);
        let width = Cpu.native_width();
        let shuffle = Operator::new(&Cpu).with_group_reduce(GroupReduce::Shuffle);
        let mut scratch = Operator::new(&Cpu);
        scratch.set_group_reduce(GroupReduce::Scratch);
        assert_eq!(scratch.group_reduce(), GroupReduce::Scratch);

        let a = data.run(&shuffle, Strategy::HardwareCohort, width);
        let b = data.run(&scratch, Strategy::HardwareCohort, width);
        for (a, b) in a.iter().zip(&b) {
            assert!(a.iter().zip(b).all(|(a, b)| a.to_bits() == b.to_bits()));
        }
    }

    #[test]
    fn test_scheme() {
        let mut op = Operator::new(&Cpu);
        let data = Data::random(1, 4, 64);
        let (mut y, mut mean, mut rstd) = (vec![0f32; 256], vec![0f32; 4], vec![0f32; 4]);

        let args = data.args(Strategy::Cohort, 64, &mut y, &mut mean, &mut rstd);
        op.scheme(&args).unwrap();
        op.launch(&args, &ThisThread).unwrap();

        let args = data.args(Strategy::Cohort, 96, &mut y, &mut mean, &mut rstd);
        assert_eq!(op.scheme(&args).unwrap_err().kind, SchemeErrorKind::ArgsNotSupport);
    }

    #[test]
    fn test_rejected_layouts() {
        use LaunchErrorKind::Scheme;
        use SchemeErrorKind::*;

        let op = Operator::new(&Cpu);
        let data = Data::random(1, 2, 8);
        let (mut y, mut mean, mut rstd) = (vec![7f32; 16], vec![7f32; 2], vec![7f32; 2]);

        let launch = |args: &Args<Cpu>| op.launch(args, &ThisThread).unwrap_err().kind;
        let with_dt = |layout: &TensorLayout, dt: DigitLayout| TensorLayout {
            dt,
            layout: layout.layout.clone(),
        };

        let mut args = data.args(Strategy::RowPerWorker, 1, &mut y, &mut mean, &mut rstd);
        args.x_layout = with_dt(&args.x_layout, ty::F16);
        assert_eq!(launch(&args), Scheme(TypeMismatch));

        let mut args = data.args(Strategy::RowPerWorker, 1, &mut y, &mut mean, &mut rstd);
        for layout in [
            &mut args.y_layout,
            &mut args.mean_layout,
            &mut args.rstd_layout,
            &mut args.x_layout,
            &mut args.scale_layout,
            &mut args.bias_layout,
        ] {
            *layout = with_dt(layout, ty::F64);
        }
        assert_eq!(launch(&args), Scheme(TypeNotSupport));

        let mut args = data.args(Strategy::RowPerWorker, 1, &mut y, &mut mean, &mut rstd);
        args.x_layout = TensorLayout::new(ty::F32, &[1, 2, 8], &[64, 4, 8]);
        assert_eq!(launch(&args), Scheme(StridesNotSupport));

        let mut args = data.args(Strategy::RowPerWorker, 1, &mut y, &mut mean, &mut rstd);
        args.y_layout = TensorLayout::new_contiguous(ty::F32, &[2, 8]);
        assert_eq!(launch(&args), Scheme(RankNotSupport));

        let mut args = data.args(Strategy::RowPerWorker, 1, &mut y, &mut mean, &mut rstd);
        args.scale_layout = TensorLayout::new_contiguous(ty::F32, &[9]);
        assert_eq!(launch(&args), Scheme(ShapeMismatch));

        let mut args = data.args(Strategy::RowPerWorker, 1, &mut y, &mut mean, &mut rstd);
        args.epsilon = f32::NAN;
        assert_eq!(launch(&args), Scheme(ArgsNotSupport));

        let mut args = data.args(Strategy::RowPerWorker, 1, &mut y, &mut mean, &mut rstd);
        let huge = usize::MAX / 2 + 1;
        args.y_layout = TensorLayout::new(ty::F32, &[huge, 2, 8], &[64, 32, 4]);
        args.x_layout = args.y_layout.clone();
        args.mean_layout = TensorLayout::new(ty::F32, &[huge, 2], &[8, 4]);
        args.rstd_layout = args.mean_layout.clone();
        assert_eq!(launch(&args), Scheme(ShapeNotSupport));

        assert!(y.iter().chain(&mean).chain(&rstd).all(|&x| x == 7.));
    }
}
