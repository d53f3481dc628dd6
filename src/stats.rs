//! Deterministic statistical primitives: OLS hedge ratio, ADF-style
//! stationarity test and residual half-life.
//!
//! Every reduction here runs in fixed index order over plain `f64` slices,
//! so identical inputs always produce bit-identical outputs. Pair selection
//! depends on that for reproducibility.

use thiserror::Error;

/// Minimum residual length the AR(1) regression can work with.
pub const ADF_MIN_SAMPLES: usize = 5;

const DEGENERATE_EPS: f64 = 1e-12;

#[derive(Debug, Error)]
#[error("insufficient data: need {required} samples, have {actual}")]
pub struct InsufficientDataError {
    pub required: usize,
    pub actual: usize,
}

/// Output of a cointegration test on two aligned price series.
#[derive(Debug, Clone, Copy)]
pub struct CointStats {
    pub beta: f64,
    pub t_stat: f64,
    pub p_value: f64,
    pub half_life: f64,
}

/// OLS slope of `y` on `x` (hedge ratio). `None` when `x` is degenerate.
pub fn ols_beta(y: &[f64], x: &[f64]) -> Option<f64> {
    let n = y.len().min(x.len());
    if n < 2 {
        return None;
    }
    let (mut sum_x, mut sum_y) = (0.0, 0.0);
    for i in 0..n {
        sum_x += x[i];
        sum_y += y[i];
    }
    let mean_x = sum_x / n as f64;
    let mean_y = sum_y / n as f64;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    for i in 0..n {
        let dx = x[i] - mean_x;
        let dy = y[i] - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
    }
    if var_x.abs() < DEGENERATE_EPS {
        None
    } else {
        Some(cov / var_x)
    }
}

/// Pearson correlation of two aligned series. `None` when either side is
/// degenerate (constant).
pub fn correlation(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 2 {
        return None;
    }
    let (mut sum_a, mut sum_b) = (0.0, 0.0);
    for i in 0..n {
        sum_a += a[i];
        sum_b += b[i];
    }
    let mean_a = sum_a / n as f64;
    let mean_b = sum_b / n as f64;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a < DEGENERATE_EPS || var_b < DEGENERATE_EPS {
        None
    } else {
        Some(cov / (var_a * var_b).sqrt())
    }
}

/// ADF-style AR(1) regression on levels: dY_t = phi * Y_{t-1} + eps.
///
/// Returns (t statistic, p-value, half-life in samples). A residual series
/// with no variance at all is treated as trivially stationary (half-life 0,
/// p-value 0): a constant spread is the strongest form of mean reversion.
pub fn adf_test(residuals: &[f64]) -> (f64, f64, f64) {
    if residuals.len() < ADF_MIN_SAMPLES {
        return (0.0, 1.0, f64::INFINITY);
    }
    let mut x: Vec<f64> = Vec::with_capacity(residuals.len() - 1);
    let mut dy: Vec<f64> = Vec::with_capacity(residuals.len() - 1);
    for win in residuals.windows(2) {
        x.push(win[0]);
        dy.push(win[1] - win[0]);
    }
    let n = x.len();
    let mean_x = x.iter().sum::<f64>() / n as f64;
    let mean_dy = dy.iter().sum::<f64>() / n as f64;
    let mut num = 0.0;
    let mut den = 0.0;
    for i in 0..n {
        let dx = x[i] - mean_x;
        let ddy = dy[i] - mean_dy;
        num += dx * ddy;
        den += dx * dx;
    }
    if den.abs() < DEGENERATE_EPS {
        return (f64::NEG_INFINITY, 0.0, 0.0);
    }
    let phi = (num / den).clamp(-0.999, 0.999);

    // residual variance and standard error of phi
    let mut rss = 0.0;
    for i in 0..n {
        let fit = phi * (x[i] - mean_x) + mean_dy;
        let err = dy[i] - fit;
        rss += err * err;
    }
    let sigma2 = rss / (n.saturating_sub(2)).max(1) as f64;
    let se_phi = (sigma2 / den).sqrt();
    let t_stat = if se_phi < DEGENERATE_EPS {
        if phi < 0.0 {
            f64::NEG_INFINITY
        } else {
            0.0
        }
    } else {
        phi / se_phi
    };
    let p_value = df_p_value(t_stat, n).clamp(0.0, 1.0);

    let ar_coef = 1.0 + phi;
    let half_life = if ar_coef <= 0.0 || ar_coef >= 1.0 {
        f64::INFINITY
    } else {
        -((2.0_f64).ln()) / ar_coef.ln()
    };

    (t_stat, p_value, half_life)
}

/// Cointegration test: OLS of `a` on `b` for the hedge ratio, then an ADF
/// stationarity test on the residual `a - beta * b`.
pub fn cointegration_test(
    a: &[f64],
    b: &[f64],
    min_samples: usize,
) -> Result<CointStats, InsufficientDataError> {
    let required = min_samples.max(ADF_MIN_SAMPLES);
    let actual = a.len().min(b.len());
    if actual < required {
        return Err(InsufficientDataError { required, actual });
    }
    let Some(beta) = ols_beta(a, b) else {
        // flat quote leg: no meaningful hedge relationship
        return Ok(CointStats {
            beta: 0.0,
            t_stat: 0.0,
            p_value: 1.0,
            half_life: f64::INFINITY,
        });
    };
    let n = a.len().min(b.len());
    let mut residuals = Vec::with_capacity(n);
    for i in 0..n {
        residuals.push(a[i] - beta * b[i]);
    }
    let (t_stat, p_value, half_life) = adf_test(&residuals);
    Ok(CointStats {
        beta,
        t_stat,
        p_value,
        half_life,
    })
}

/// Interpolated Dickey-Fuller critical values (with constant), approximate.
fn df_p_value(t_stat: f64, n: usize) -> f64 {
    const CRITS: &[(usize, f64, f64, f64)] = &[
        (25, -3.75, -3.00, -2.63),
        (50, -3.58, -2.93, -2.60),
        (100, -3.51, -2.89, -2.58),
        (250, -3.46, -2.88, -2.57),
        (500, -3.44, -2.87, -2.57),
    ];
    let (c1, c5, c10) = interpolate_crits(n, CRITS);
    if t_stat < c1 {
        0.005
    } else if t_stat < c5 {
        0.025
    } else if t_stat < c10 {
        0.075
    } else {
        0.5
    }
}

fn interpolate_crits(n: usize, table: &[(usize, f64, f64, f64)]) -> (f64, f64, f64) {
    if n <= table[0].0 {
        return (table[0].1, table[0].2, table[0].3);
    }
    for w in table.windows(2) {
        let (n1, c1_1, c5_1, c10_1) = w[0];
        let (n2, c1_2, c5_2, c10_2) = w[1];
        if n >= n1 && n <= n2 {
            let t = (n - n1) as f64 / (n2 - n1) as f64;
            let lerp = |a: f64, b: f64| a + t * (b - a);
            return (lerp(c1_1, c1_2), lerp(c5_1, c5_2), lerp(c10_1, c10_2));
        }
    }
    let last = table.last().unwrap();
    (last.1, last.2, last.3)
}
