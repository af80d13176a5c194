//! Case-similarity weights.
//!
//! For a target case `i` every other case `k` contributes one vote per case `j`. The vote
//! measures how close `j` is to `i` in the metric spanned by the variables `k` selected in
//! the previous iteration, relative to the closest case on `j`'s side of the class split:
//!
//! ```text
//! d_k[j]   = sqrt( sum over v with f_prior[k][v] = 1 of (x[i][v] - x[j][v])^2 )
//! term     = exp( -(d_k[j] - min_side(j)) )
//! w[j]     = (sum over k != i of term) / n_cases
//! ```
//!
//! `min_side(j)` is the smallest `d_k` over same-class cases other than `i` when `j` shares
//! `i`'s class and over other-class cases otherwise. The target's own weight is never
//! consumed and is pinned to `1.0`.
//!
//! Two implementations exist: [`compute_weights`] runs inline on a worker thread, and the
//! staged [`WeightKernel`] sequence mirrors the device pipeline. Both visit `v`, `j` and
//! `k` in ascending order, so their results agree bit for bit.

use ndarray::{Array2, ArrayView1, ArrayView2};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WeightError {
    #[error("Weight buffer shape mismatch: {0}")]
    Shape(String),

    #[error("No device is available for weight computation: {0}")]
    Unavailable(String),

    #[error("The device worker has shut down.")]
    Disconnected,

    #[error("Device back end failed: {0}")]
    Backend(String),
}

/// Iteration-0 fast path: no selection exists yet, so every case counts equally.
pub fn uniform_weights(weights: &mut [f64]) {
    weights.fill(1.0);
}

#[inline]
fn masked_distance(diff: ArrayView1<'_, f64>, flags: &[usize]) -> f64 {
    let mut sum = 0.0;
    for &v in flags {
        let d = diff[v];
        sum += d * d;
    }
    sum.sqrt()
}

#[inline]
fn separation_term(distance: f64, min_same: f64, min_diff: f64, same_class: bool) -> f64 {
    let min = if same_class { min_same } else { min_diff };
    (-(distance - min)).exp()
}

/// Scratch reused across calls of [`compute_weights`].
#[derive(Debug, Default)]
pub struct WeightScratch {
    distances: Vec<f64>,
    selected: Vec<usize>,
}

impl WeightScratch {
    pub fn new(n_cases: usize, n_vars: usize) -> Self {
        Self {
            distances: vec![0.0; n_cases],
            selected: Vec::with_capacity(n_vars),
        }
    }
}

/// CPU weights for `target`.
///
/// `delta` holds `x[target] - x[j]` in row `j`; `f_prior` is the previous iteration's
/// selection matrix.
pub fn compute_weights(
    target: usize,
    classes: &[usize],
    delta: ArrayView2<'_, f64>,
    f_prior: ArrayView2<'_, u8>,
    scratch: &mut WeightScratch,
    weights: &mut [f64],
) -> Result<(), WeightError> {
    let n_cases = classes.len();
    if delta.nrows() != n_cases || f_prior.nrows() != n_cases || weights.len() != n_cases {
        return Err(WeightError::Shape(format!(
            "{} classes, {} delta rows, {} prior rows, {} weights",
            n_cases,
            delta.nrows(),
            f_prior.nrows(),
            weights.len()
        )));
    }
    let target_class = classes[target];
    scratch.distances.resize(n_cases, 0.0);
    weights.fill(0.0);

    for k in 0..n_cases {
        if k == target {
            continue;
        }
        scratch.selected.clear();
        scratch.selected.extend(
            f_prior
                .row(k)
                .iter()
                .enumerate()
                .filter(|(_, flag)| **flag != 0)
                .map(|(v, _)| v),
        );

        let mut min_same = f64::INFINITY;
        let mut min_diff = f64::INFINITY;
        for j in 0..n_cases {
            let d = masked_distance(delta.row(j), &scratch.selected);
            scratch.distances[j] = d;
            if j == target {
                continue;
            }
            if classes[j] == target_class {
                if d < min_same {
                    min_same = d;
                }
            } else if d < min_diff {
                min_diff = d;
            }
        }

        for j in 0..n_cases {
            if j == target {
                continue;
            }
            weights[j] += separation_term(
                scratch.distances[j],
                min_same,
                min_diff,
                classes[j] == target_class,
            );
        }
    }

    let scale = n_cases as f64;
    for w in weights.iter_mut() {
        *w /= scale;
    }
    weights[target] = 1.0;
    Ok(())
}

/// Wall time spent in each stage of the kernel sequence.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct KernelTimings {
    pub diff: Duration,
    pub dist: Duration,
    pub mindist: Duration,
    pub term: Duration,
    pub transpose: Duration,
    pub sum: Duration,
    pub readback: Duration,
}

impl KernelTimings {
    pub fn total(&self) -> Duration {
        self.diff + self.dist + self.mindist + self.term + self.transpose + self.sum + self.readback
    }

    pub fn accumulate(&mut self, other: &KernelTimings) {
        self.diff += other.diff;
        self.dist += other.dist;
        self.mindist += other.mindist;
        self.term += other.term;
        self.transpose += other.transpose;
        self.sum += other.sum;
        self.readback += other.readback;
    }
}

/// The staged weight pipeline of a compute device.
///
/// Stages share device-side intermediate buffers, so a sequence for one case must run to
/// completion before the next one starts. [`crate::device::DeviceWorker`] guarantees that.
pub trait WeightKernel: Send {
    fn name(&self) -> &'static str;

    /// Uploads the standardized case matrix and class ids. Called once per engine.
    fn upload_cases(&mut self, cases: ArrayView2<'_, f64>, classes: &[usize])
    -> Result<(), WeightError>;

    /// Uploads the previous iteration's selection flags. Called once per iteration.
    fn upload_flags(&mut self, f_prior: ArrayView2<'_, u8>) -> Result<(), WeightError>;

    /// `diff[j][v] = x[target][v] - x[j][v]`
    fn difference(&mut self, target: usize) -> Result<(), WeightError>;

    /// `dist[k][j]` under the metric of `k`'s flags.
    fn distance(&mut self) -> Result<(), WeightError>;

    /// Same-class and other-class minimum of every `dist[k]` row.
    fn class_minimum(&mut self, target: usize) -> Result<(), WeightError>;

    /// `term[k][j]`; zero for `k == target` and `j == target`.
    fn term(&mut self, target: usize) -> Result<(), WeightError>;

    fn transpose(&mut self) -> Result<(), WeightError>;

    /// Row sums of the transposed terms, divided by `n_cases`.
    fn sum(&mut self) -> Result<(), WeightError>;

    fn read_weights(&mut self, out: &mut [f64]) -> Result<(), WeightError>;
}

/// Runs the full stage sequence for `target` and copies the weights into `out`.
pub fn run_kernel_sequence(
    kernel: &mut dyn WeightKernel,
    target: usize,
    out: &mut [f64],
    timings: &mut KernelTimings,
) -> Result<(), WeightError> {
    let t = Instant::now();
    kernel.difference(target)?;
    timings.diff += t.elapsed();

    let t = Instant::now();
    kernel.distance()?;
    timings.dist += t.elapsed();

    let t = Instant::now();
    kernel.class_minimum(target)?;
    timings.mindist += t.elapsed();

    let t = Instant::now();
    kernel.term(target)?;
    timings.term += t.elapsed();

    let t = Instant::now();
    kernel.transpose()?;
    timings.transpose += t.elapsed();

    let t = Instant::now();
    kernel.sum()?;
    timings.sum += t.elapsed();

    let t = Instant::now();
    kernel.read_weights(out)?;
    out[target] = 1.0;
    timings.readback += t.elapsed();
    Ok(())
}

/// Host-memory emulation of the device buffers and stage sequence.
#[derive(Debug, Default)]
pub struct HostDeviceKernel {
    cases: Array2<f64>,
    classes: Vec<usize>,
    /// Selected variable indices per case, ascending.
    flags: Vec<Vec<usize>>,
    diff: Array2<f64>,
    dist: Array2<f64>,
    min_same: Vec<f64>,
    min_diff: Vec<f64>,
    terms: Array2<f64>,
    transposed: Array2<f64>,
    sums: Vec<f64>,
}

impl HostDeviceKernel {
    pub fn new() -> Self {
        Self::default()
    }

    fn n_cases(&self) -> usize {
        self.classes.len()
    }

    fn check_loaded(&self) -> Result<(), WeightError> {
        if self.classes.is_empty() {
            return Err(WeightError::Shape("no cases have been uploaded".to_string()));
        }
        if self.flags.len() != self.n_cases() {
            return Err(WeightError::Shape(format!(
                "flags for {} cases uploaded, {} expected",
                self.flags.len(),
                self.n_cases()
            )));
        }
        Ok(())
    }
}

impl WeightKernel for HostDeviceKernel {
    fn name(&self) -> &'static str {
        "host"
    }

    fn upload_cases(
        &mut self,
        cases: ArrayView2<'_, f64>,
        classes: &[usize],
    ) -> Result<(), WeightError> {
        if cases.nrows() != classes.len() {
            return Err(WeightError::Shape(format!(
                "{} case rows but {} class ids",
                cases.nrows(),
                classes.len()
            )));
        }
        let n = classes.len();
        self.cases = cases.to_owned();
        self.classes = classes.to_vec();
        self.diff = Array2::zeros(cases.raw_dim());
        self.dist = Array2::zeros((n, n));
        self.terms = Array2::zeros((n, n));
        self.transposed = Array2::zeros((n, n));
        self.min_same = vec![f64::INFINITY; n];
        self.min_diff = vec![f64::INFINITY; n];
        self.sums = vec![0.0; n];
        self.flags.clear();
        Ok(())
    }

    fn upload_flags(&mut self, f_prior: ArrayView2<'_, u8>) -> Result<(), WeightError> {
        if f_prior.dim() != self.cases.dim() {
            return Err(WeightError::Shape(format!(
                "flag matrix is {:?}, case matrix is {:?}",
                f_prior.dim(),
                self.cases.dim()
            )));
        }
        self.flags = f_prior
            .rows()
            .into_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .filter(|(_, f)| **f != 0)
                    .map(|(v, _)| v)
                    .collect()
            })
            .collect();
        Ok(())
    }

    fn difference(&mut self, target: usize) -> Result<(), WeightError> {
        self.check_loaded()?;
        let x_target = self.cases.row(target);
        for (mut out, x_j) in self.diff.rows_mut().into_iter().zip(self.cases.rows()) {
            for ((o, a), b) in out.iter_mut().zip(x_target.iter()).zip(x_j.iter()) {
                *o = a - b;
            }
        }
        Ok(())
    }

    fn distance(&mut self) -> Result<(), WeightError> {
        let n = self.n_cases();
        for k in 0..n {
            for j in 0..n {
                self.dist[[k, j]] = masked_distance(self.diff.row(j), &self.flags[k]);
            }
        }
        Ok(())
    }

    fn class_minimum(&mut self, target: usize) -> Result<(), WeightError> {
        let n = self.n_cases();
        let target_class = self.classes[target];
        for k in 0..n {
            let mut min_same = f64::INFINITY;
            let mut min_diff = f64::INFINITY;
            for j in 0..n {
                if j == target {
                    continue;
                }
                let d = self.dist[[k, j]];
                if self.classes[j] == target_class {
                    if d < min_same {
                        min_same = d;
                    }
                } else if d < min_diff {
                    min_diff = d;
                }
            }
            self.min_same[k] = min_same;
            self.min_diff[k] = min_diff;
        }
        Ok(())
    }

    fn term(&mut self, target: usize) -> Result<(), WeightError> {
        let n = self.n_cases();
        let target_class = self.classes[target];
        for k in 0..n {
            for j in 0..n {
                self.terms[[k, j]] = if k == target || j == target {
                    0.0
                } else {
                    separation_term(
                        self.dist[[k, j]],
                        self.min_same[k],
                        self.min_diff[k],
                        self.classes[j] == target_class,
                    )
                };
            }
        }
        Ok(())
    }

    fn transpose(&mut self) -> Result<(), WeightError> {
        self.transposed.assign(&self.terms.t());
        Ok(())
    }

    fn sum(&mut self) -> Result<(), WeightError> {
        let scale = self.n_cases() as f64;
        for (s, row) in self.sums.iter_mut().zip(self.transposed.rows()) {
            let mut acc = 0.0;
            for t in row.iter() {
                acc += *t;
            }
            *s = acc / scale;
        }
        Ok(())
    }

    fn read_weights(&mut self, out: &mut [f64]) -> Result<(), WeightError> {
        if out.len() != self.sums.len() {
            return Err(WeightError::Shape(format!(
                "readback buffer holds {} weights, device has {}",
                out.len(),
                self.sums.len()
            )));
        }
        out.copy_from_slice(&self.sums);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn delta_for(cases: &Array2<f64>, target: usize) -> Array2<f64> {
        let mut delta = Array2::zeros(cases.raw_dim());
        for j in 0..cases.nrows() {
            for v in 0..cases.ncols() {
                delta[[j, v]] = cases[[target, v]] - cases[[j, v]];
            }
        }
        delta
    }

    fn separated() -> (Array2<f64>, Vec<usize>) {
        let cases = array![
            [0.0, 1.0],
            [0.1, 2.0],
            [0.2, 3.0],
            [5.0, 1.0],
            [6.0, 2.0],
            [9.0, 3.0]
        ];
        (cases, vec![0, 0, 0, 1, 1, 1])
    }

    #[test]
    fn first_iteration_weights_are_exactly_one() {
        let mut w = vec![0.25; 7];
        uniform_weights(&mut w);
        assert!(w.iter().all(|x| *x == 1.0));
    }

    #[test]
    fn close_same_class_cases_outweigh_far_other_class_cases() {
        let (cases, classes) = separated();
        let mut prior = Array2::<u8>::zeros(cases.raw_dim());
        prior.column_mut(0).fill(1);
        let delta = delta_for(&cases, 0);
        let mut scratch = WeightScratch::new(6, 2);
        let mut w = vec![0.0; 6];
        compute_weights(0, &classes, delta.view(), prior.view(), &mut scratch, &mut w).unwrap();

        assert_eq!(w[0], 1.0);
        assert!(w[1] > w[5]);
        assert!(w[2] > w[5]);
        assert!(w[3] > w[5]);
        assert!(w.iter().all(|x| *x > 0.0 && x.is_finite()));
    }

    #[test]
    fn empty_prior_selection_gives_equal_votes() {
        let (cases, classes) = separated();
        let prior = Array2::<u8>::zeros(cases.raw_dim());
        let delta = delta_for(&cases, 2);
        let mut scratch = WeightScratch::new(6, 2);
        let mut w = vec![0.0; 6];
        compute_weights(2, &classes, delta.view(), prior.view(), &mut scratch, &mut w).unwrap();
        for (j, x) in w.iter().enumerate() {
            let expected = if j == 2 { 1.0 } else { 5.0 / 6.0 };
            assert_eq!(*x, expected);
        }
    }

    #[test]
    fn host_kernel_matches_cpu_bit_for_bit() {
        let (cases, classes) = separated();
        let prior = array![
            [1u8, 0],
            [1, 1],
            [0, 1],
            [1, 0],
            [0, 0],
            [1, 1]
        ];
        let mut kernel = HostDeviceKernel::new();
        kernel.upload_cases(cases.view(), &classes).unwrap();
        kernel.upload_flags(prior.view()).unwrap();

        let mut scratch = WeightScratch::new(6, 2);
        let mut timings = KernelTimings::default();
        for target in 0..6 {
            let delta = delta_for(&cases, target);
            let mut cpu = vec![0.0; 6];
            compute_weights(
                target,
                &classes,
                delta.view(),
                prior.view(),
                &mut scratch,
                &mut cpu,
            )
            .unwrap();
            let mut device = vec![0.0; 6];
            run_kernel_sequence(&mut kernel, target, &mut device, &mut timings).unwrap();
            assert_eq!(cpu, device, "target {target}");
        }
        assert!(timings.total() >= timings.dist);
    }

    #[test]
    fn kernel_rejects_flags_before_cases() {
        let mut kernel = HostDeviceKernel::new();
        let prior = Array2::<u8>::zeros((3, 2));
        assert!(matches!(
            kernel.upload_flags(prior.view()),
            Err(WeightError::Shape(_))
        ));
        let mut out = vec![0.0; 3];
        let mut timings = KernelTimings::default();
        assert!(run_kernel_sequence(&mut kernel, 0, &mut out, &mut timings).is_err());
    }
}
