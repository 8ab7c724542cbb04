use digit_layout::DigitLayout;
use ndarray_layout::ArrayLayout;

/// 张量布局，即数字类型和以字节为单位的形状与步长。
#[derive(Clone)]
pub struct TensorLayout {
    pub dt: DigitLayout,
    pub layout: ArrayLayout<4>,
}

impl TensorLayout {
    pub fn new(dt: DigitLayout, shape: &[usize], strides: &[isize]) -> Self {
        Self {
            dt,
            layout: ArrayLayout::new(shape, strides, 0),
        }
    }

    /// 行优先的连续布局。
    pub fn new_contiguous(dt: DigitLayout, shape: &[usize]) -> Self {
        let mut strides = shape
            .iter()
            .rev()
            .scan(dt.nbytes() as isize, |mul, &d| {
                let stride = *mul;
                *mul *= d as isize;
                Some(stride)
            })
            .collect::<Vec<_>>();
        strides.reverse();
        Self::new(dt, shape, &strides)
    }

    #[inline]
    pub const fn dt(&self) -> DigitLayout {
        self.dt
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.layout.ndim()
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    #[inline]
    pub fn strides(&self) -> &[isize] {
        self.layout.strides()
    }

    /// 布局是否与同形状的行优先连续布局一致。
    ///
    /// 长度为 1 的维度不参与判断。
    pub fn is_contiguous(&self) -> bool {
        let mut expected = self.dt.nbytes() as isize;
        for (&d, &s) in self.shape().iter().zip(self.strides()).rev() {
            if d != 1 && s != expected {
                return false;
            }
            expected *= d as isize;
        }
        true
    }
}

#[test]
fn test_contiguous() {
    use digit_layout::types::F32;

    let layout = TensorLayout::new_contiguous(F32, &[2, 3, 4]);
    assert_eq!(layout.shape(), &[2, 3, 4]);
    assert_eq!(layout.strides(), &[48, 16, 4]);
    assert!(layout.is_contiguous());

    let transposed = TensorLayout::new(F32, &[3, 4], &[4, 12]);
    assert!(!transposed.is_contiguous());

    let single_row = TensorLayout::new(F32, &[1, 4], &[1024, 4]);
    assert!(single_row.is_contiguous());
}
