//! Least-squares solvers for linear regression.
//!
//! Both solvers minimize `(1/2n) * ||y - Xb - c||^2 + (reg/2) * ||b||^2`.
//! The intercept `c` is never regularized.

use tracing::{debug, info};

/// Solver choice for [`super::LinearRegression`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Solver {
    /// Normal equations, falling back to gradient descent when the system
    /// is singular.
    #[default]
    Auto,
    Normal,
    Sgd,
}

/// Fitted parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    pub iterations: usize,
}

const PIVOT_EPSILON: f64 = 1e-12;

/// Solve `a * x = b` with Gaussian elimination and partial pivoting.
/// Returns `None` when `a` is singular.
pub fn solve_linear_system(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    let scale = a
        .iter()
        .flatten()
        .fold(0.0f64, |m, v| m.max(v.abs()))
        .max(1.0);
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() <= PIVOT_EPSILON * scale {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Some(x)
}

/// Closed-form solution through the normal equations.
pub fn normal_equations(
    features: &[Vec<f64>],
    labels: &[f64],
    fit_intercept: bool,
    reg_param: f64,
) -> Option<Solution> {
    let n = labels.len();
    let d = features.first().map_or(0, Vec::len);
    let dim = if fit_intercept { d + 1 } else { d };

    let mut gram = vec![vec![0.0; dim]; dim];
    let mut moment = vec![0.0; dim];
    let mut row = vec![0.0; dim];
    for (x, &y) in features.iter().zip(labels) {
        row[..d].copy_from_slice(x);
        if fit_intercept {
            row[d] = 1.0;
        }
        for i in 0..dim {
            moment[i] += row[i] * y;
            for j in 0..dim {
                gram[i][j] += row[i] * row[j];
            }
        }
    }
    for (i, gram_row) in gram.iter_mut().enumerate().take(d) {
        gram_row[i] += reg_param * n as f64;
    }

    let solution = solve_linear_system(gram, moment)?;
    let intercept = if fit_intercept { solution[d] } else { 0.0 };
    Some(Solution {
        coefficients: solution[..d].to_vec(),
        intercept,
        iterations: 0,
    })
}

/// Parameters for [`gradient_descent`].
#[derive(Debug, Clone)]
pub struct GradientDescentParams {
    pub max_iter: usize,
    pub learning_rate: f64,
    pub tolerance: f64,
}

impl Default for GradientDescentParams {
    fn default() -> Self {
        Self {
            max_iter: 1000,
            learning_rate: 0.1,
            tolerance: 1e-6,
        }
    }
}

/// Batch gradient descent on standardized features.
pub fn gradient_descent(
    features: &[Vec<f64>],
    labels: &[f64],
    fit_intercept: bool,
    reg_param: f64,
    params: &GradientDescentParams,
) -> Solution {
    let n = labels.len() as f64;
    let d = features.first().map_or(0, Vec::len);

    let mut means = vec![0.0; d];
    let mut stds = vec![0.0; d];
    for x in features {
        for j in 0..d {
            means[j] += x[j] / n;
        }
    }
    for x in features {
        for j in 0..d {
            stds[j] += (x[j] - means[j]).powi(2) / n;
        }
    }
    for s in stds.iter_mut() {
        *s = s.sqrt();
    }
    let scaled = |x: &[f64], j: usize| {
        if stds[j] > 0.0 {
            (x[j] - means[j]) / stds[j]
        } else {
            0.0
        }
    };

    let mut weights = vec![0.0; d];
    let mut bias = 0.0;
    let mut previous_loss = f64::MAX;
    let mut iterations = 0;
    for epoch in 0..params.max_iter {
        iterations = epoch + 1;
        let mut gradient = vec![0.0; d];
        let mut bias_gradient = 0.0;
        let mut loss = 0.0;
        for (x, &y) in features.iter().zip(labels) {
            let prediction: f64 =
                bias + (0..d).map(|j| weights[j] * scaled(x, j)).sum::<f64>();
            let error = prediction - y;
            loss += error * error;
            for (j, g) in gradient.iter_mut().enumerate() {
                *g += error * scaled(x, j);
            }
            bias_gradient += error;
        }
        loss = loss / (2.0 * n) + reg_param / 2.0 * weights.iter().map(|w| w * w).sum::<f64>();
        for (w, g) in weights.iter_mut().zip(&gradient) {
            *w -= params.learning_rate * (g / n + reg_param * *w);
        }
        if fit_intercept {
            bias -= params.learning_rate * bias_gradient / n;
        }
        debug!("Epoch {}: loss={:.6}", epoch, loss);
        if (previous_loss - loss).abs() < params.tolerance {
            info!("Gradient descent converged at epoch {} with loss {:.6}", epoch, loss);
            break;
        }
        previous_loss = loss;
    }

    let coefficients: Vec<f64> = (0..d)
        .map(|j| if stds[j] > 0.0 { weights[j] / stds[j] } else { 0.0 })
        .collect();
    let shift: f64 = coefficients.iter().zip(&means).map(|(c, m)| c * m).sum();
    Solution {
        coefficients,
        intercept: if fit_intercept { bias - shift } else { 0.0 },
        iterations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solve_linear_system() {
        // 2x + y = 5, x + 3y = 10
        let x = solve_linear_system(vec![vec![2.0, 1.0], vec![1.0, 3.0]], vec![5.0, 10.0]).unwrap();
        assert!((x[0] - 1.0).abs() < 1e-9);
        assert!((x[1] - 3.0).abs() < 1e-9);
        // needs a row swap
        let x = solve_linear_system(vec![vec![0.0, 1.0], vec![1.0, 0.0]], vec![2.0, 3.0]).unwrap();
        assert_eq!(x, vec![3.0, 2.0]);
        assert!(solve_linear_system(vec![vec![1.0, 2.0], vec![2.0, 4.0]], vec![1.0, 2.0]).is_none());
    }

    #[test]
    fn test_normal_equations_exact() {
        // y = 3 + 2 * x1 - x2
        let features = vec![
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![2.0, 1.0],
            vec![3.0, 5.0],
        ];
        let labels: Vec<f64> = features.iter().map(|x| 3.0 + 2.0 * x[0] - x[1]).collect();
        let solution = normal_equations(&features, &labels, true, 0.0).unwrap();
        assert!((solution.intercept - 3.0).abs() < 1e-9);
        assert!((solution.coefficients[0] - 2.0).abs() < 1e-9);
        assert!((solution.coefficients[1] + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_collinear_features_are_singular() {
        let features = vec![vec![1.0, 2.0], vec![2.0, 4.0], vec![3.0, 6.0]];
        let labels = vec![1.0, 2.0, 3.0];
        assert!(normal_equations(&features, &labels, true, 0.0).is_none());
        // ridge makes it solvable
        assert!(normal_equations(&features, &labels, true, 0.1).is_some());
    }

    #[test]
    fn test_gradient_descent_converges() {
        // y = 1 + 1 * x1 + 2 * x2, with x1 on a larger scale
        let features: Vec<Vec<f64>> = (0..20)
            .map(|i| vec![100.0 + i as f64 * 10.0, (i % 5) as f64])
            .collect();
        let labels: Vec<f64> = features.iter().map(|x| 1.0 + x[0] + 2.0 * x[1]).collect();
        let params = GradientDescentParams {
            max_iter: 20_000,
            learning_rate: 0.1,
            tolerance: 1e-14,
        };
        let solution = gradient_descent(&features, &labels, true, 0.0, &params);
        assert!((solution.coefficients[0] - 1.0).abs() < 1e-3);
        assert!((solution.coefficients[1] - 2.0).abs() < 1e-3);
        assert!((solution.intercept - 1.0).abs() < 0.1);
    }
}
