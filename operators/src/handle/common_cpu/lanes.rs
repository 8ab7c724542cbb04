use crate::{args_not_support, SchemeError};

/// 一个硬件协作组最多容纳的通道数。
pub const MAX_LANES: usize = 8;

pub(super) fn native_width() -> usize {
    #[cfg(target_arch = "x86_64")]
    if is_x86_feature_detected!("avx") {
        return 8;
    }
    4
}

/// 硬件协作组内求和的实现方式。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum GroupReduce {
    /// 在寄存器中以异或蝶形交换求和，每个通道都得到全组之和。
    Shuffle,
    /// 以暂存区折半树模拟，结果从 0 号位置广播。
    Scratch,
}

impl GroupReduce {
    /// 平台提供向量混洗指令时选择 [`GroupReduce::Shuffle`]。
    pub fn detect() -> Self {
        if cfg!(target_arch = "x86_64") {
            Self::Shuffle
        } else {
            Self::Scratch
        }
    }
}

/// 对一行数据的一次扫描。
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Pass {
    /// Σx
    Sum,
    /// Σ(x - mean)²
    SquaredDeviation(f32),
}

impl Pass {
    #[inline(always)]
    fn term(self, x: f32) -> f32 {
        match self {
            Self::Sum => x,
            Self::SquaredDeviation(mean) => {
                let d = x - mean;
                d * d
            }
        }
    }
}

/// 硬件协作组。
///
/// 通道 `l` 依次累加下标为 `l, l + width, l + 2 width, …` 的元素，
/// 再由组内求和得到整行的结果。两种 [`GroupReduce`] 的结果逐位相同。
#[derive(Clone, Copy, Debug)]
pub struct Lanes {
    width: usize,
    reduce: GroupReduce,
}

impl Lanes {
    pub fn new(width: usize, reduce: GroupReduce) -> Result<Self, SchemeError> {
        if !width.is_power_of_two() || width > MAX_LANES {
            return Err(args_not_support(format!(
                "lane count {width} must be a power of two no more than {MAX_LANES}"
            )));
        }
        Ok(Self { width, reduce })
    }

    #[inline]
    pub const fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub const fn group_reduce(&self) -> GroupReduce {
        self.reduce
    }

    pub fn sum(&self, row: &[f32], pass: Pass) -> f32 {
        match self.reduce {
            GroupReduce::Shuffle => {
                #[cfg(target_arch = "x86_64")]
                match self.width {
                    8 if is_x86_feature_detected!("avx") => {
                        return unsafe { x86::sum_avx(row, pass) };
                    }
                    4 => return unsafe { x86::sum_sse(row, pass) },
                    _ => {}
                }
                butterfly(accumulate(row, self.width, pass), self.width)
            }
            GroupReduce::Scratch => halving_tree(accumulate(row, self.width, pass), self.width),
        }
    }
}

fn accumulate(row: &[f32], width: usize, pass: Pass) -> [f32; MAX_LANES] {
    let mut lanes = [0.; MAX_LANES];
    for chunk in row.chunks(width) {
        for (lane, &x) in lanes.iter_mut().zip(chunk) {
            *lane += pass.term(x);
        }
    }
    lanes
}

fn butterfly(mut lanes: [f32; MAX_LANES], width: usize) -> f32 {
    let mut offset = width / 2;
    while offset > 0 {
        let prev = lanes;
        for (l, lane) in lanes[..width].iter_mut().enumerate() {
            *lane = prev[l] + prev[l ^ offset];
        }
        offset /= 2;
    }
    lanes[0]
}

fn halving_tree(mut scratch: [f32; MAX_LANES], width: usize) -> f32 {
    let mut stride = width / 2;
    while stride > 0 {
        for l in 0..stride {
            scratch[l] += scratch[l + stride];
        }
        stride /= 2;
    }
    scratch[0]
}

#[cfg(target_arch = "x86_64")]
mod x86 {
    use super::Pass;
    use std::arch::x86_64::*;

    #[target_feature(enable = "avx")]
    pub(super) unsafe fn sum_avx(row: &[f32], pass: Pass) -> f32 {
        let chunks = row.chunks_exact(8);
        let tail = chunks.remainder();

        let mut acc = _mm256_setzero_ps();
        match pass {
            Pass::Sum => {
                for chunk in chunks {
                    acc = _mm256_add_ps(acc, _mm256_loadu_ps(chunk.as_ptr()));
                }
            }
            Pass::SquaredDeviation(mean) => {
                let mean = _mm256_set1_ps(mean);
                for chunk in chunks {
                    let d = _mm256_sub_ps(_mm256_loadu_ps(chunk.as_ptr()), mean);
                    acc = _mm256_add_ps(acc, _mm256_mul_ps(d, d));
                }
            }
        }

        let mut lanes = [0f32; 8];
        _mm256_storeu_ps(lanes.as_mut_ptr(), acc);
        for (lane, &x) in lanes.iter_mut().zip(tail) {
            *lane += pass.term(x);
        }
        let acc = _mm256_loadu_ps(lanes.as_ptr());

        let acc = _mm256_add_ps(acc, _mm256_permute2f128_ps::<0x01>(acc, acc));
        let acc = _mm256_add_ps(acc, _mm256_shuffle_ps::<0x4e>(acc, acc));
        let acc = _mm256_add_ps(acc, _mm256_shuffle_ps::<0xb1>(acc, acc));
        _mm256_cvtss_f32(acc)
    }

    pub(super) unsafe fn sum_sse(row: &[f32], pass: Pass) -> f32 {
        let chunks = row.chunks_exact(4);
        let tail = chunks.remainder();

        let mut acc = _mm_setzero_ps();
        match pass {
            Pass::Sum => {
                for chunk in chunks {
                    acc = _mm_add_ps(acc, _mm_loadu_ps(chunk.as_ptr()));
                }
            }
            Pass::SquaredDeviation(mean) => {
                let mean = _mm_set1_ps(mean);
                for chunk in chunks {
                    let d = _mm_sub_ps(_mm_loadu_ps(chunk.as_ptr()), mean);
                    acc = _mm_add_ps(acc, _mm_mul_ps(d, d));
                }
            }
        }

        let mut lanes = [0f32; 4];
        _mm_storeu_ps(lanes.as_mut_ptr(), acc);
        for (lane, &x) in lanes.iter_mut().zip(tail) {
            *lane += pass.term(x);
        }
        let acc = _mm_loadu_ps(lanes.as_ptr());

        let acc = _mm_add_ps(acc, _mm_shuffle_ps::<0x4e>(acc, acc));
        let acc = _mm_add_ps(acc, _mm_shuffle_ps::<0xb1>(acc, acc));
        _mm_cvtss_f32(acc)
    }
}

#[cfg(test)]
mod test {
    use super::{GroupReduce, Lanes, Pass};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn test_shuffle_matches_scratch() {
        let mut rng = StdRng::seed_from_u64(42);
        for width in [1, 2, 4, 8] {
            let shuffle = Lanes::new(width, GroupReduce::Shuffle).unwrap();
            let scratch = Lanes::new(width, GroupReduce::Scratch).unwrap();
            for len in [1, 3, 7, 8, 9, 64, 77, 1000] {
                let row = (0..len)
                    .map(|_| rng.gen_range(-1.0f32..1.0))
                    .collect::<Vec<_>>();
                for pass in [Pass::Sum, Pass::SquaredDeviation(0.25)] {
                    let a = shuffle.sum(&row, pass);
                    let b = scratch.sum(&row, pass);
                    assert_eq!(a.to_bits(), b.to_bits(), "width {width} len {len}");

                    let exact = row
                        .iter()
                        .map(|&x| match pass {
                            Pass::Sum => x as f64,
                            Pass::SquaredDeviation(m) => (x as f64 - m as f64).powi(2),
                        })
                        .sum::<f64>();
                    let tolerance = 1e-4 * exact.abs().max(1.);
                    assert!((a as f64 - exact).abs() <= tolerance, "{a} vs {exact}");
                }
            }
        }
    }

    #[test]
    fn test_native_width() {
        let width = super::native_width();
        assert!(width == 4 || width == 8);
        let lanes = Lanes::new(width, GroupReduce::detect()).unwrap();
        assert_eq!(lanes.width(), width);
        assert_eq!(lanes.group_reduce(), GroupReduce::detect());
    }

    #[test]
    fn test_invalid_width() {
        assert!(Lanes::new(0, GroupReduce::Scratch).is_err());
        assert!(Lanes::new(6, GroupReduce::Shuffle).is_err());
        assert!(Lanes::new(16, GroupReduce::Shuffle).is_err());
    }
}
