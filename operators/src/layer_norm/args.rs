use super::Strategy;
use crate::{
    args_not_support, shape_not_support, strides_not_support, type_not_support,
    utils::{dim_distinct, rank_error, type_distinct},
    ConstPtr, Hardware, MutPtr, SchemeError, TensorLayout,
};
use digit_layout::{types::F32, DigitLayout};

pub struct Args<H: Hardware> {
    pub y_layout: TensorLayout,
    pub y_base: MutPtr<H>,
    pub mean_layout: TensorLayout,
    pub mean_base: MutPtr<H>,
    pub rstd_layout: TensorLayout,
    pub rstd_base: MutPtr<H>,
    pub x_layout: TensorLayout,
    pub x_base: ConstPtr<H>,
    pub scale_layout: TensorLayout,
    pub scale_base: ConstPtr<H>,
    pub bias_layout: TensorLayout,
    pub bias_base: ConstPtr<H>,
    pub epsilon: f32,
    pub strategy: Strategy,
    pub cohort_width: usize,
}

pub(super) struct Meta {
    pub dt: DigitLayout,
    pub batch: usize,
    pub seq: usize,
    pub d: usize,
}

impl Meta {
    /// 行数。
    #[inline]
    pub const fn n(&self) -> usize {
        self.batch * self.seq
    }

    /// 激活的元素数。
    #[inline]
    pub const fn numel(&self) -> usize {
        self.n() * self.d
    }
}

impl<H: Hardware> Args<H> {
    pub(super) fn meta(&self) -> Result<Meta, SchemeError> {
        let Self {
            y_layout: y,
            mean_layout: mean,
            rstd_layout: rstd,
            x_layout: x,
            scale_layout: scale,
            bias_layout: bias,
            epsilon,
            ..
        } = self;

        let &[yb, ys, yd] = y.shape() else {
            return Err(rank_error("y", 3, y.ndim()));
        };
        let &[mb, ms] = mean.shape() else {
            return Err(rank_error("mean", 2, mean.ndim()));
        };
        let &[rb, rs] = rstd.shape() else {
            return Err(rank_error("rstd", 2, rstd.ndim()));
        };
        let &[xb, xs, xd] = x.shape() else {
            return Err(rank_error("x", 3, x.ndim()));
        };
        let &[sd] = scale.shape() else {
            return Err(rank_error("scale", 1, scale.ndim()));
        };
        let &[bd] = bias.shape() else {
            return Err(rank_error("bias", 1, bias.ndim()));
        };

        let dt = type_distinct(&[y.dt(), mean.dt(), rstd.dt(), x.dt(), scale.dt(), bias.dt()])?;
        if dt != F32 {
            return Err(type_not_support(format!("{dt:?} not supported, F32 expected")));
        }

        let meta = Meta {
            dt,
            batch: dim_distinct(&[yb, mb, rb, xb])?,
            seq: dim_distinct(&[ys, ms, rs, xs])?,
            d: dim_distinct(&[yd, xd, sd, bd])?,
        };
        if meta.d == 0 {
            return Err(shape_not_support("normalized dimension must not be 0"));
        }
        if meta
            .batch
            .checked_mul(meta.seq)
            .and_then(|n| n.checked_mul(meta.d))
            .is_none()
        {
            return Err(shape_not_support(format!(
                "[{}, {}, {}] overflows usize",
                meta.batch, meta.seq, meta.d
            )));
        }

        for (name, layout) in [
            ("y", y),
            ("mean", mean),
            ("rstd", rstd),
            ("x", x),
            ("scale", scale),
            ("bias", bias),
        ] {
            if !layout.is_contiguous() {
                return Err(strides_not_support(format!(
                    "{name}.strides = {:?} is not row-major contiguous",
                    layout.strides()
                )));
            }
        }

        if !(epsilon.is_finite() && *epsilon >= 0.) {
            return Err(args_not_support(format!("epsilon = {epsilon}")));
        }

        Ok(meta)
    }
}
