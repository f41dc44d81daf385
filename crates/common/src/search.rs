//! Bisection over integer ranges against monotonic predicates.
//!
//! Both searches treat `[lo, hi]` as inclusive and evaluate the predicate
//! `O(log(hi - lo))` times. Monotonicity is a caller precondition and is not
//! checked: a predicate that flips more than once yields whichever boundary
//! the search path lands on. The result is still deterministic for a given
//! predicate and range.
//!
//! "No legal value" is reported as `None`. An empty range (`lo > hi`) has no
//! legal value.

/// Integer types the bisection can walk.
pub trait SearchDomain: Copy + Ord {
    /// Midpoint of `lo..=hi`, rounded towards `lo`. Requires `lo <= hi`.
    fn midpoint(lo: Self, hi: Self) -> Self;
    /// `self - 1`, or `None` at the type's minimum.
    fn step_down(self) -> Option<Self>;
    /// `self + 1`, or `None` at the type's maximum.
    fn step_up(self) -> Option<Self>;
}

macro_rules! impl_search_domain {
    ($($t:ty),*) => {
        $(
            impl SearchDomain for $t {
                fn midpoint(lo: Self, hi: Self) -> Self {
                    let (lo, hi) = (lo as i128, hi as i128);
                    (lo + (hi - lo) / 2) as $t
                }

                fn step_down(self) -> Option<Self> {
                    self.checked_sub(1)
                }

                fn step_up(self) -> Option<Self> {
                    self.checked_add(1)
                }
            }
        )*
    };
}

impl_search_domain!(u32, u64, usize, i32, i64);

/// Smallest `v` in `[lo, hi]` with `pred(v)`, for `pred` that is false below
/// some threshold and true from it onwards.
///
/// Returns `Some(lo)` when `pred(lo)` already holds and `None` when `pred` is
/// false on the whole range.
pub fn find_min_legal_value<T, F>(pred: F, lo: T, hi: T) -> Option<T>
where
    T: SearchDomain,
    F: Fn(T) -> bool,
{
    let mut found = None;
    let (mut l, mut r) = (lo, hi);
    while l <= r {
        let mid = T::midpoint(l, r);
        if pred(mid) {
            found = Some(mid);
            match mid.step_down() {
                Some(next) if next >= lo => r = next,
                _ => break,
            }
        } else {
            match mid.step_up() {
                Some(next) => l = next,
                None => break,
            }
        }
    }
    found
}

/// Largest `v` in `[lo, hi]` with `pred(v)`, for `pred` that is true up to
/// some threshold and false after it.
pub fn find_max_legal_value<T, F>(pred: F, lo: T, hi: T) -> Option<T>
where
    T: SearchDomain,
    F: Fn(T) -> bool,
{
    let mut found = None;
    let (mut l, mut r) = (lo, hi);
    while l <= r {
        let mid = T::midpoint(l, r);
        if pred(mid) {
            found = Some(mid);
            match mid.step_up() {
                Some(next) if next <= hi => l = next,
                _ => break,
            }
        } else {
            match mid.step_down() {
                Some(next) => r = next,
                None => break,
            }
        }
    }
    found
}
