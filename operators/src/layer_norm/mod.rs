#[cfg(any(use_cpu, test))]
pub mod common_cpu;

mod args;
pub use args::Args;

use crate::{args_not_support, SchemeError};
use std::{fmt, str::FromStr};

crate::op_trait!(LayerNorm);

/// 防止方差为 0 时除零的默认常数。
pub const EPSILON: f32 = 1e-5;

/// 计算每行均值和标准差倒数的并行策略。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum Strategy {
    /// 每行一个工作者，顺序两遍扫描。
    RowPerWorker = 1,
    /// 每行一个 `cohort_width` 线程的协作组，暂存区折半树规约，步间以屏障同步。
    Cohort = 2,
    /// 每行一个硬件原生宽度的协作组，以寄存器混洗规约。
    HardwareCohort = 3,
}

impl Strategy {
    pub const ALL: [Self; 3] = [Self::RowPerWorker, Self::Cohort, Self::HardwareCohort];

    #[inline]
    pub const fn id(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for Strategy {
    type Error = SchemeError;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        match id {
            1 => Ok(Self::RowPerWorker),
            2 => Ok(Self::Cohort),
            3 => Ok(Self::HardwareCohort),
            _ => Err(args_not_support(format!(
                "unknown layernorm strategy {id}, expected 1, 2 or 3"
            ))),
        }
    }
}

impl FromStr for Strategy {
    type Err = SchemeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "row" | "row-per-worker" => Ok(Self::RowPerWorker),
            "cohort" | "block" => Ok(Self::Cohort),
            "hardware-cohort" | "warp" | "simd" => Ok(Self::HardwareCohort),
            id => match id.parse::<u32>() {
                Ok(id) => Self::try_from(id),
                Err(_) => Err(args_not_support(format!("unknown layernorm strategy \"{s}\""))),
            },
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::RowPerWorker => "row-per-worker",
            Self::Cohort => "cohort",
            Self::HardwareCohort => "hardware-cohort",
        };
        write!(f, "{name}")
    }
}

/// 以平坦的行优先缓冲区执行层归一化前向。
///
/// - `inp`, `out`: `batch × seq × d`；
/// - `mean`, `rstd`: `batch × seq`，每行一个值；
/// - `weight`, `bias`: `d`。
///
/// 参数非法时立即返回错误，不写入任何输出。
#[cfg(any(use_cpu, test))]
#[allow(clippy::too_many_arguments)]
pub fn layernorm_forward(
    strategy_id: u32,
    out: &mut [f32],
    mean: &mut [f32],
    rstd: &mut [f32],
    inp: &[f32],
    weight: &[f32],
    bias: &[f32],
    batch: usize,
    seq: usize,
    d: usize,
    cohort_width: usize,
) -> Result<(), crate::LaunchError> {
    use crate::{
        common_cpu::{Cpu, ThisThread},
        shape_mismatch, shape_not_support, Operator as _, TensorLayout,
    };
    use digit_layout::types::F32;
    use std::sync::OnceLock;

    static OPERATOR: OnceLock<common_cpu::Operator> = OnceLock::new();

    let strategy = Strategy::try_from(strategy_id)?;
    let Some(len) = batch.checked_mul(seq).and_then(|n| n.checked_mul(d)) else {
        return Err(shape_not_support(format!("[{batch}, {seq}, {d}] overflows usize")).into());
    };
    let n = batch * seq;
    for (name, len, expected) in [
        ("out", out.len(), len),
        ("inp", inp.len(), len),
        ("mean", mean.len(), n),
        ("rstd", rstd.len(), n),
        ("weight", weight.len(), d),
        ("bias", bias.len(), d),
    ] {
        if len != expected {
            return Err(shape_mismatch(format!("{name}.len = {len}, {expected} expected")).into());
        }
    }

    let act = TensorLayout::new_contiguous(F32, &[batch, seq, d]);
    let stat = TensorLayout::new_contiguous(F32, &[batch, seq]);
    let param = TensorLayout::new_contiguous(F32, &[d]);
    OPERATOR
        .get_or_init(|| common_cpu::Operator::new(&Cpu))
        .launch(
            &Args {
                y_layout: act.clone(),
                y_base: out.as_mut_ptr().cast(),
                mean_layout: stat.clone(),
                mean_base: mean.as_mut_ptr().cast(),
                rstd_layout: stat,
                rstd_base: rstd.as_mut_ptr().cast(),
                x_layout: act,
                x_base: inp.as_ptr().cast(),
                scale_layout: param.clone(),
                scale_base: weight.as_ptr().cast(),
                bias_layout: param,
                bias_base: bias.as_ptr().cast(),
                epsilon: EPSILON,
                strategy,
                cohort_width,
            },
            &ThisThread,
        )
}
