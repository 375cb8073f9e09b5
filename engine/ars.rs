//! Derivative-free adaptive rejection sampling for log-concave densities.
//!
//! The upper envelope is built from secants through neighbouring abscissae
//! (Gilks, 1992): by concavity, the chord through two points lies above the density
//! outside that pair. Each interval between abscissae is bounded by the chords of the
//! two adjacent intervals, and the two outermost intervals by the extended chords.
//! The chords themselves give the lower squeeze. A rejected proposal becomes a
//! new abscissa, so the envelope tightens as sampling proceeds.
//!
//! Only the log-density up to an additive constant is needed, passed as a closure.

use rand::Rng;
use rand_distr::Open01;
use thiserror::Error;

/// Upper bound on the number of abscissae kept in the envelope.
pub const MAX_POINTS: usize = 100;
/// Proposals tried before the sampler gives up.
pub const MAX_TRIALS: usize = 1000;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArsError {
    #[error("invalid bounds [{left}, {right}]")]
    InvalidBounds { left: f64, right: f64 },
    #[error("initial abscissae {points:?} must be strictly increasing inside ({left}, {right})")]
    InvalidAbscissae {
        points: Vec<f64>,
        left: f64,
        right: f64,
    },
    #[error("log-density is not finite at the initial abscissa {x}")]
    NonFiniteInitial { x: f64 },
    #[error("log-density is NaN at {x}")]
    NanDensity { x: f64 },
    #[error("the envelope has no finite mass")]
    DegenerateEnvelope,
    #[error("no proposal accepted after {trials} trials")]
    TooManyTrials { trials: usize },
}

/// A linear piece `value + slope * (x - left)` of the log envelope on `[left, right]`.
#[derive(Debug, Clone, Copy)]
struct Piece {
    left: f64,
    right: f64,
    value: f64,
    slope: f64,
}

impl Piece {
    #[inline]
    fn at(&self, x: f64) -> f64 {
        self.value + self.slope * (x - self.left)
    }

    /// Log of the integral of `exp(piece)` over the piece.
    fn log_mass(&self) -> f64 {
        let width = self.right - self.left;
        let bw = self.slope * width;
        if bw.abs() < 1e-10 {
            self.value + width.ln()
        } else if self.slope > 0.0 {
            self.at(self.right) + (-(-bw).exp_m1() / self.slope).ln()
        } else {
            self.value + (bw.exp_m1() / self.slope).ln()
        }
    }

    /// Inverse CDF of the normalised `exp(piece)` at `u` in (0, 1).
    fn invert(&self, u: f64) -> f64 {
        let width = self.right - self.left;
        let bw = self.slope * width;
        let x = if bw.abs() < 1e-10 {
            self.left + u * width
        } else if self.slope > 0.0 {
            self.right + (u + (1.0 - u) * (-bw).exp()).ln() / self.slope
        } else {
            self.left + (1.0 - u + u * bw.exp()).ln() / self.slope
        };
        x.clamp(self.left, self.right)
    }
}

/// Chord through abscissae `i` and `i + 1`, as (slope, anchor x, anchor value).
#[derive(Debug, Clone, Copy)]
struct Chord {
    slope: f64,
    x: f64,
    h: f64,
}

impl Chord {
    #[inline]
    fn at(&self, x: f64) -> f64 {
        self.h + self.slope * (x - self.x)
    }
}

struct Envelope {
    xs: Vec<f64>,
    hs: Vec<f64>,
    left: f64,
    right: f64,
    pieces: Vec<Piece>,
    cumulative: Vec<f64>,
}

impl Envelope {
    fn chord(&self, i: usize) -> Chord {
        Chord {
            slope: (self.hs[i + 1] - self.hs[i]) / (self.xs[i + 1] - self.xs[i]),
            x: self.xs[i],
            h: self.hs[i],
        }
    }

    fn push_line(&mut self, left: f64, right: f64, chord: Chord) {
        if right > left {
            self.pieces.push(Piece {
                left,
                right,
                value: chord.at(left),
                slope: chord.slope,
            });
        }
    }

    /// Lower of two chords on `[left, right]`, split at their crossing if needed.
    fn push_min(&mut self, left: f64, right: f64, a: Chord, b: Chord) {
        let (al, bl) = (a.at(left), b.at(left));
        let (ar, br) = (a.at(right), b.at(right));
        if al <= bl && ar <= br {
            self.push_line(left, right, a);
        } else if bl <= al && br <= ar {
            self.push_line(left, right, b);
        } else {
            let cross = left + (bl - al) / (a.slope - b.slope);
            let cross = cross.clamp(left, right);
            let (first, second) = if al < bl { (a, b) } else { (b, a) };
            self.push_line(left, cross, first);
            self.push_line(cross, right, second);
        }
    }

    fn rebuild(&mut self) -> Result<(), ArsError> {
        let n = self.xs.len();
        self.pieces.clear();
        self.push_line(self.left, self.xs[0], self.chord(0));
        self.push_line(self.xs[0], self.xs[1], self.chord(1));
        for i in 1..n - 2 {
            self.push_min(self.xs[i], self.xs[i + 1], self.chord(i - 1), self.chord(i + 1));
        }
        self.push_line(self.xs[n - 2], self.xs[n - 1], self.chord(n - 3));
        self.push_line(self.xs[n - 1], self.right, self.chord(n - 2));

        let log_masses: Vec<f64> = self.pieces.iter().map(Piece::log_mass).collect();
        let top = log_masses.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !top.is_finite() {
            return Err(ArsError::DegenerateEnvelope);
        }
        self.cumulative.clear();
        let mut acc = 0.0;
        for lm in log_masses {
            acc += (lm - top).exp();
            self.cumulative.push(acc);
        }
        if !(acc.is_finite() && acc > 0.0) {
            return Err(ArsError::DegenerateEnvelope);
        }
        Ok(())
    }

    fn propose<R: Rng>(&self, rng: &mut R) -> (f64, f64) {
        let total = self.cumulative[self.cumulative.len() - 1];
        let target = rng.sample::<f64, _>(Open01) * total;
        let j = self
            .cumulative
            .partition_point(|&c| c < target)
            .min(self.pieces.len() - 1);
        let piece = &self.pieces[j];
        let x = piece.invert(rng.sample(Open01));
        (x, piece.at(x))
    }

    /// The squeeze: the chord between the bracketing abscissae, or minus infinity
    /// outside the outermost pair.
    fn lower(&self, x: f64) -> f64 {
        let n = self.xs.len();
        if x < self.xs[0] || x > self.xs[n - 1] {
            return f64::NEG_INFINITY;
        }
        let i = self.xs.partition_point(|&p| p <= x).clamp(1, n - 1) - 1;
        self.chord(i).at(x)
    }

    fn insert(&mut self, x: f64, h: f64) -> Result<(), ArsError> {
        if self.xs.len() >= MAX_POINTS {
            return Ok(());
        }
        let at = self.xs.partition_point(|&p| p < x);
        if self.xs.get(at).is_some_and(|&p| p == x) {
            return Ok(());
        }
        self.xs.insert(at, x);
        self.hs.insert(at, h);
        self.rebuild()
    }
}

/// Draws one sample from the density proportional to `exp(log_density(x))` on
/// `[bounds.0, bounds.1]`, starting the envelope at `initial`.
pub fn sample<F, R>(
    log_density: F,
    initial: [f64; 4],
    bounds: (f64, f64),
    rng: &mut R,
) -> Result<f64, ArsError>
where
    F: Fn(f64) -> f64,
    R: Rng,
{
    let (left, right) = bounds;
    if !(left.is_finite() && right.is_finite() && left < right) {
        return Err(ArsError::InvalidBounds { left, right });
    }
    let ordered = initial.windows(2).all(|w| w[0] < w[1]);
    if !ordered || initial[0] <= left || initial[3] >= right {
        return Err(ArsError::InvalidAbscissae {
            points: initial.to_vec(),
            left,
            right,
        });
    }
    let mut hs = Vec::with_capacity(MAX_POINTS);
    for &x in &initial {
        let h = log_density(x);
        if !h.is_finite() {
            return Err(ArsError::NonFiniteInitial { x });
        }
        hs.push(h);
    }

    let mut envelope = Envelope {
        xs: initial.to_vec(),
        hs,
        left,
        right,
        pieces: Vec::with_capacity(2 * MAX_POINTS),
        cumulative: Vec::with_capacity(2 * MAX_POINTS),
    };
    envelope.rebuild()?;

    for _ in 0..MAX_TRIALS {
        let (x, upper) = envelope.propose(rng);
        let log_u = rng.sample::<f64, _>(Open01).ln();
        if log_u <= envelope.lower(x) - upper {
            return Ok(x);
        }
        let h = log_density(x);
        if h.is_nan() {
            return Err(ArsError::NanDensity { x });
        }
        if log_u <= h - upper {
            return Ok(x);
        }
        if h.is_finite() {
            envelope.insert(x, h)?;
        }
    }
    Err(ArsError::TooManyTrials { trials: MAX_TRIALS })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    fn moments(samples: &[f64]) -> (f64, f64) {
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
        (mean, var)
    }

    #[test]
    fn recovers_a_normal_distribution() {
        let mut rng = Pcg64::seed_from_u64(42);
        let (mu, sd) = (1.5, 0.7);
        let density = |x: f64| -0.5 * ((x - mu) / sd).powi(2);
        let draws: Vec<f64> = (0..8000)
            .map(|_| sample(density, [0.5, 1.2, 1.8, 2.5], (-5.0, 8.0), &mut rng).unwrap())
            .collect();
        let (mean, var) = moments(&draws);
        assert_relative_eq!(mean, mu, epsilon = 0.03);
        assert_relative_eq!(var, sd * sd, max_relative = 0.06);
    }

    #[test]
    fn respects_the_bounds_of_a_skewed_density() {
        // Gamma(3, 1) restricted to (0, 30).
        let mut rng = Pcg64::seed_from_u64(9);
        let density = |x: f64| 2.0 * x.ln() - x;
        let draws: Vec<f64> = (0..6000)
            .map(|_| sample(density, [0.5, 1.5, 3.0, 6.0], (0.0, 30.0), &mut rng).unwrap())
            .collect();
        assert!(draws.iter().all(|&x| x > 0.0 && x < 30.0));
        let (mean, _) = moments(&draws);
        assert_relative_eq!(mean, 3.0, max_relative = 0.04);
    }

    #[test]
    fn rejects_unordered_abscissae() {
        let mut rng = Pcg64::seed_from_u64(1);
        let err = sample(|x| -x * x, [0.0, -1.0, 1.0, 2.0], (-3.0, 3.0), &mut rng).unwrap_err();
        assert!(matches!(err, ArsError::InvalidAbscissae { .. }));
    }

    #[test]
    fn rejects_an_initial_point_outside_the_support() {
        let mut rng = Pcg64::seed_from_u64(1);
        let err = sample(
            |x: f64| if x < 0.0 { f64::NEG_INFINITY } else { -x },
            [-0.5, 0.5, 1.0, 2.0],
            (-1.0, 3.0),
            &mut rng,
        )
        .unwrap_err();
        assert!(matches!(err, ArsError::NonFiniteInitial { .. }));
    }

    #[test]
    fn nan_density_is_fatal() {
        let mut rng = Pcg64::seed_from_u64(2);
        let density = |x: f64| if x > 2.5 { f64::NAN } else { -x * x };
        let result = (0..200)
            .map(|_| sample(density, [-1.0, -0.5, 0.5, 1.0], (-3.0, 3.0), &mut rng))
            .find(Result::is_err);
        // Mass beyond 2.5 is tiny but the envelope there is loose, so some proposal lands.
        if let Some(err) = result {
            assert!(matches!(err, Err(ArsError::NanDensity { .. })));
        }
    }
}
