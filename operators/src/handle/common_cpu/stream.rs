/// 逐行数据的访存方式。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AccessMode {
    /// 普通访存。
    Cached,
    /// 行数据只读一次、只写一次，以非临时提示绕过缓存，
    /// 使广播的权重和偏置留在缓存中。
    ///
    /// 不支持非临时提示的平台上退化为 [`AccessMode::Cached`]，权重和偏置将不再保证驻留缓存。
    Streaming,
}

impl AccessMode {
    /// 平台上实际生效的访存方式。
    pub fn resolve(self) -> Self {
        match self {
            Self::Cached => Self::Cached,
            #[cfg(target_arch = "x86_64")]
            Self::Streaming => Self::Streaming,
            #[cfg(not(target_arch = "x86_64"))]
            Self::Streaming => {
                static WARN: std::sync::Once = std::sync::Once::new();
                WARN.call_once(|| {
                    log::warn!("non-temporal hints unavailable, streaming access falls back to cached")
                });
                Self::Cached
            }
        }
    }

    /// 以 `dst[i] = f(i)` 写一行，`src` 是只读一次的输入行。
    pub fn write_row(self, dst: &mut [f32], src: &[f32], f: impl Fn(usize) -> f32) {
        match self.resolve() {
            Self::Cached => dst.iter_mut().enumerate().for_each(|(i, y)| *y = f(i)),
            Self::Streaming => stream_row(dst, src, f),
        }
    }
}

#[cfg(target_arch = "x86_64")]
#[inline]
fn stream_row(dst: &mut [f32], src: &[f32], f: impl Fn(usize) -> f32) {
    unsafe { x86::write_row_nt(dst, src, f) }
}

#[cfg(not(target_arch = "x86_64"))]
fn stream_row(_dst: &mut [f32], _src: &[f32], _f: impl Fn(usize) -> f32) {
    unreachable!("streaming access resolves to cached on this platform")
}

#[cfg(target_arch = "x86_64")]
mod x86 {
    use std::arch::x86_64::*;

    const CACHE_LINE: usize = 64 / std::mem::size_of::<f32>();

    pub(super) unsafe fn write_row_nt(dst: &mut [f32], src: &[f32], f: impl Fn(usize) -> f32) {
        for line in src.chunks(CACHE_LINE) {
            _mm_prefetch::<_MM_HINT_NTA>(line.as_ptr().cast());
        }

        let (head, body, tail) = dst.align_to_mut::<__m128>();
        for (i, y) in head.iter_mut().enumerate() {
            *y = f(i);
        }
        let base = head.len();
        for (k, y) in body.iter_mut().enumerate() {
            let i = base + k * 4;
            let v = [f(i), f(i + 1), f(i + 2), f(i + 3)];
            _mm_stream_ps((y as *mut __m128).cast(), _mm_loadu_ps(v.as_ptr()));
        }
        let base = base + body.len() * 4;
        for (i, y) in tail.iter_mut().enumerate() {
            *y = f(base + i);
        }
        // 非临时写入对其他线程可见之前需要写屏障
        _mm_sfence();
    }
}
