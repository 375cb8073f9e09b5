// ========================================================================================
//
//                  The kernel: per-marker arithmetic against the residual
//
// ========================================================================================
//
// Every representation answers the same questions about its standardized column `x`:
// `x . epsilon`, `x . x`, how `epsilon` moves when the marker's effect changes, and the
// Weibull-specific sums used by the quadrature and by the effect-size density.
//
// Sparse markers never materialise `x`. With `x_i = (g_i - mean) * inv_sd`, a sum
// over individuals splits into a sum over the listed individuals plus a closed-form
// term in `mean * sum(epsilon)`. The results agree across representations up to
// floating-point reassociation.

use rayon::prelude::*;

use crate::marker::{DenseMarker, Marker, SparseEigenMarker, SparseRaggedMarker};
use crate::types::{PARALLEL_CHUNK, PARALLEL_THRESHOLD, Residual, dot_slices, sum_slice};

/// Numeric strategy of one decoded marker.
pub trait Kernel {
    /// `sum_i x_i * epsilon_i`.
    fn dot_residual(&self, residual: &Residual) -> f64;

    /// `sum_i x_i^2`: `N - 1` for a standardized polymorphic marker, zero for a
    /// monomorphic one.
    fn squared_norm(&self) -> f64;

    /// `epsilon += (beta_old - beta_new) * x`.
    fn update_residual(&self, residual: &mut Residual, beta_old: f64, beta_new: f64);

    /// The sums the Weibull family needs for this marker given the current
    /// `vi = exp(alpha * epsilon - gamma)`.
    fn weibull_terms<'a>(&'a self, ctx: &WeibullContext<'a>) -> WeibullTerms<'a>;
}

/// Per-sweep quantities shared by every Weibull marker update.
pub struct WeibullContext<'a> {
    pub vi: &'a [f64],
    pub vi_total: f64,
    pub failure: &'a [f64],
    pub failure_total: f64,
}

enum Groups<'a> {
    /// One group per individual.
    PerIndividual { x: &'a [f64], vi: &'a [f64] },
    /// Individuals sharing a standardized value, as `(x, sum of vi)`.
    Classes(Vec<(f64, f64)>),
}

/// Weibull sums for one marker.
pub struct WeibullTerms<'a> {
    groups: Groups<'a>,
    vi_total: f64,
    /// `sum_i x_i * failure_i`.
    pub failure_dot: f64,
    /// `sum_i vi_i * x_i^2`.
    pub exponent_sum: f64,
}

impl WeibullTerms<'_> {
    /// `sum_i vi_i * exp(-t * x_i)`.
    pub fn weighted_exp(&self, t: f64) -> f64 {
        match &self.groups {
            Groups::PerIndividual { x, vi } => {
                if x.len() >= PARALLEL_THRESHOLD {
                    let partials: Vec<f64> = x
                        .par_chunks(PARALLEL_CHUNK)
                        .zip(vi.par_chunks(PARALLEL_CHUNK))
                        .map(|(x, v)| weighted_exp_serial(x, v, t))
                        .collect();
                    partials.iter().sum()
                } else {
                    weighted_exp_serial(x, vi, t)
                }
            }
            Groups::Classes(classes) => classes.iter().map(|&(x, v)| v * (-t * x).exp()).sum(),
        }
    }

    /// The adaptive quadrature integrand at node `s`:
    /// `exp(-alpha s d c + sum_i vi_i (1 - exp(-x_i s c alpha)) - s^2)`, with
    /// `c = sqrt(2 C_k sigma_b)`.
    pub fn integrand(&self, s: f64, alpha: f64, scale: f64) -> f64 {
        let t = s * scale * alpha;
        (-alpha * s * self.failure_dot * scale + self.vi_total - self.weighted_exp(t) - s * s)
            .exp()
    }

    /// Log conditional density of the marker effect under component variance
    /// `c_k * sigma_b`, up to a constant.
    pub fn effect_log_density(&self, beta: f64, alpha: f64, prior_variance: f64) -> f64 {
        -alpha * beta * self.failure_dot
            - self.weighted_exp(alpha * beta)
            - beta * beta / (2.0 * prior_variance)
    }
}

fn weighted_exp_serial(x: &[f64], vi: &[f64], t: f64) -> f64 {
    x.iter().zip(vi).map(|(x, v)| v * (-t * x).exp()).sum()
}

// ========================================================================================
//                                   Dense markers
// ========================================================================================

impl Kernel for DenseMarker {
    fn dot_residual(&self, residual: &Residual) -> f64 {
        dot_slices(&self.values, residual.values())
    }

    fn squared_norm(&self) -> f64 {
        self.squared_norm
    }

    fn update_residual(&self, residual: &mut Residual, beta_old: f64, beta_new: f64) {
        residual.add_scaled(&self.values, beta_old - beta_new);
    }

    fn weibull_terms<'a>(&'a self, ctx: &WeibullContext<'a>) -> WeibullTerms<'a> {
        let x: &[f64] = &self.values;
        let weighted_sq: Vec<f64> = x.iter().zip(ctx.vi).map(|(x, v)| v * x * x).collect();
        WeibullTerms {
            groups: Groups::PerIndividual { x, vi: ctx.vi },
            vi_total: ctx.vi_total,
            failure_dot: dot_slices(x, ctx.failure),
            exponent_sum: sum_slice(&weighted_sq),
        }
    }
}

// ========================================================================================
//                                   Sparse markers
// ========================================================================================

impl Kernel for SparseEigenMarker {
    fn dot_residual(&self, residual: &Residual) -> f64 {
        let eps = residual.values();
        let raw: f64 = self.entries.iter().map(|&(i, g)| g * eps[i as usize]).sum();
        (raw - self.stats.mean * residual.sum()) * self.stats.inv_sd
    }

    fn squared_norm(&self) -> f64 {
        self.stats.squared_norm
    }

    fn update_residual(&self, residual: &mut Residual, beta_old: f64, beta_new: f64) {
        let scaled = (beta_old - beta_new) * self.stats.inv_sd;
        if scaled == 0.0 {
            return;
        }
        residual.shift(-scaled * self.stats.mean);
        residual.add_entries(&self.entries, scaled);
    }

    fn weibull_terms<'a>(&'a self, ctx: &WeibullContext<'a>) -> WeibullTerms<'a> {
        let (mean, inv_sd) = (self.stats.mean, self.stats.inv_sd);
        let zero = -mean * inv_sd;
        let mut classes = Vec::with_capacity(self.entries.len() + 1);
        let mut listed_vi = 0.0;
        let mut raw_failure = 0.0;
        for &(i, g) in &self.entries {
            let v = ctx.vi[i as usize];
            listed_vi += v;
            raw_failure += g * ctx.failure[i as usize];
            classes.push(((g - mean) * inv_sd, v));
        }
        classes.push((zero, ctx.vi_total - listed_vi));
        finish_classes(classes, ctx, (raw_failure - mean * ctx.failure_total) * inv_sd)
    }
}

impl Kernel for SparseRaggedMarker {
    fn dot_residual(&self, residual: &Residual) -> f64 {
        let eps = residual.values();
        let sum_over = |list: &[u32]| list.iter().map(|&i| eps[i as usize]).sum::<f64>();
        let mean = self.stats.mean;
        let raw = sum_over(&self.ones) + 2.0 * sum_over(&self.twos) + mean * sum_over(&self.missing);
        (raw - mean * residual.sum()) * self.stats.inv_sd
    }

    fn squared_norm(&self) -> f64 {
        self.stats.squared_norm
    }

    fn update_residual(&self, residual: &mut Residual, beta_old: f64, beta_new: f64) {
        let scaled = (beta_old - beta_new) * self.stats.inv_sd;
        if scaled == 0.0 {
            return;
        }
        let mean = self.stats.mean;
        residual.shift(-scaled * mean);
        residual.add_at(&self.ones, scaled);
        residual.add_at(&self.twos, 2.0 * scaled);
        residual.add_at(&self.missing, scaled * mean);
    }

    fn weibull_terms<'a>(&'a self, ctx: &WeibullContext<'a>) -> WeibullTerms<'a> {
        let x = self.class_values();
        let vi_over = |list: &[u32]| list.iter().map(|&i| ctx.vi[i as usize]).sum::<f64>();
        let f_over = |list: &[u32]| list.iter().map(|&i| ctx.failure[i as usize]).sum::<f64>();
        let (v1, v2, vm) = (vi_over(&self.ones), vi_over(&self.twos), vi_over(&self.missing));
        let mean = self.stats.mean;
        let raw_failure =
            f_over(&self.ones) + 2.0 * f_over(&self.twos) + mean * f_over(&self.missing);
        let classes = vec![
            (x.zero, ctx.vi_total - v1 - v2 - vm),
            (x.one, v1),
            (x.two, v2),
            (0.0, vm),
        ];
        finish_classes(
            classes,
            ctx,
            (raw_failure - mean * ctx.failure_total) * self.stats.inv_sd,
        )
    }
}

fn finish_classes<'a>(
    classes: Vec<(f64, f64)>,
    ctx: &WeibullContext<'a>,
    failure_dot: f64,
) -> WeibullTerms<'a> {
    let exponent_sum = classes.iter().map(|&(x, v)| v * x * x).sum();
    WeibullTerms {
        groups: Groups::Classes(classes),
        vi_total: ctx.vi_total,
        failure_dot,
        exponent_sum,
    }
}

// ========================================================================================
//                                     Dispatch
// ========================================================================================

impl Kernel for Marker {
    #[inline]
    fn dot_residual(&self, residual: &Residual) -> f64 {
        match self {
            Marker::Dense(m) => m.dot_residual(residual),
            Marker::SparseEigen(m) => m.dot_residual(residual),
            Marker::SparseRagged(m) => m.dot_residual(residual),
        }
    }

    #[inline]
    fn squared_norm(&self) -> f64 {
        match self {
            Marker::Dense(m) => m.squared_norm(),
            Marker::SparseEigen(m) => m.squared_norm(),
            Marker::SparseRagged(m) => m.squared_norm(),
        }
    }

    #[inline]
    fn update_residual(&self, residual: &mut Residual, beta_old: f64, beta_new: f64) {
        match self {
            Marker::Dense(m) => m.update_residual(residual, beta_old, beta_new),
            Marker::SparseEigen(m) => m.update_residual(residual, beta_old, beta_new),
            Marker::SparseRagged(m) => m.update_residual(residual, beta_old, beta_new),
        }
    }

    fn weibull_terms<'a>(&'a self, ctx: &WeibullContext<'a>) -> WeibullTerms<'a> {
        match self {
            Marker::Dense(m) => m.weibull_terms(ctx),
            Marker::SparseEigen(m) => m.weibull_terms(ctx),
            Marker::SparseRagged(m) => m.weibull_terms(ctx),
        }
    }
}
