//! Distribution functions.
//!
//! Thin wrappers over `statrs` that return `NaN` instead of panicking on
//! invalid parameters, plus two distributions `statrs` does not ship:
//! the studentized range (Tukey HSD) and the many-to-one maximum |t|
//! (Dunnett).
//!
//! ```
//! use u_labstat::special;
//!
//! assert!((special::normal_cdf(1.959964) - 0.975).abs() < 1e-6);
//! assert!((special::t_two_sided_p(2.228, 10.0) - 0.05).abs() < 1e-3);
//! assert!((special::ptukey(3.773, 3, 12.0) - 0.95).abs() < 1e-3);
//! ```

use statrs::distribution::{ChiSquared, ContinuousCDF, FisherSnedecor, Normal, StudentsT};
use statrs::function::gamma::ln_gamma;

// ── statrs wrappers ───────────────────────────────────────────────────

/// Standard normal CDF.
pub fn normal_cdf(z: f64) -> f64 {
    Normal::standard().cdf(z)
}

/// Standard normal quantile.
pub fn normal_quantile(p: f64) -> f64 {
    if !(0.0..=1.0).contains(&p) {
        return f64::NAN;
    }
    Normal::standard().inverse_cdf(p)
}

/// Two-sided p-value of a standard normal statistic.
pub fn normal_two_sided_p(z: f64) -> f64 {
    2.0 * Normal::standard().sf(z.abs())
}

/// Two-sided p-value of a Student t statistic.
pub fn t_two_sided_p(t: f64, df: f64) -> f64 {
    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) if t.is_finite() => 2.0 * dist.sf(t.abs()),
        Ok(_) if t.is_infinite() => 0.0,
        _ => f64::NAN,
    }
}

/// Student t quantile.
pub fn t_quantile(p: f64, df: f64) -> f64 {
    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) if (0.0..=1.0).contains(&p) => dist.inverse_cdf(p),
        _ => f64::NAN,
    }
}

/// Upper-tail probability of the F distribution.
pub fn f_sf(f: f64, df1: f64, df2: f64) -> f64 {
    if f.is_infinite() && f > 0.0 {
        return 0.0;
    }
    match FisherSnedecor::new(df1, df2) {
        Ok(dist) if f.is_finite() => dist.sf(f.max(0.0)),
        _ => f64::NAN,
    }
}

/// Upper-tail probability of the chi-square distribution.
pub fn chi2_sf(x: f64, df: f64) -> f64 {
    if x.is_infinite() && x > 0.0 {
        return 0.0;
    }
    match ChiSquared::new(df) {
        Ok(dist) if x.is_finite() => dist.sf(x.max(0.0)),
        _ => f64::NAN,
    }
}

// ── Studentized range ─────────────────────────────────────────────────

const LEG12_X: [f64; 6] = [
    0.981_560_634_246_719_3,
    0.904_117_256_370_474_9,
    0.769_902_674_194_304_7,
    0.587_317_954_286_617_4,
    0.367_831_498_998_180_2,
    0.125_233_408_511_468_9,
];
const LEG12_W: [f64; 6] = [
    0.047_175_336_386_511_83,
    0.106_939_325_995_318_43,
    0.160_078_328_543_346_23,
    0.203_167_426_723_065_92,
    0.233_492_536_538_354_8,
    0.249_147_045_813_402_8,
];
const LEG16_X: [f64; 8] = [
    0.989_400_934_991_649_9,
    0.944_575_023_073_232_6,
    0.865_631_202_387_831_7,
    0.755_404_408_355_003,
    0.617_876_244_402_643_7,
    0.458_016_777_657_227_4,
    0.281_603_550_779_258_9,
    0.095_012_509_837_637_44,
];
const LEG16_W: [f64; 8] = [
    0.027_152_459_411_754_095,
    0.062_253_523_938_647_89,
    0.095_158_511_682_492_78,
    0.124_628_971_255_533_87,
    0.149_595_988_816_576_73,
    0.169_156_519_395_002_54,
    0.182_603_415_044_923_6,
    0.189_450_610_455_068_5,
];

/// Probability that the range of `cc` standard normals is below `w`
/// (Copenhaver & Holland 1988, Gauss-Legendre over the largest value).
fn range_prob(w: f64, cc: f64) -> f64 {
    const BB: f64 = 8.0;
    const C1: f64 = -30.0;
    const C3: f64 = 60.0;
    let inv_sqrt_2pi = 1.0 / (2.0 * std::f64::consts::PI).sqrt();

    let qsqz = w * 0.5;
    if qsqz >= BB {
        return 1.0;
    }
    // P(all within the symmetric window) term
    let mut pr_w = 2.0 * normal_cdf(qsqz) - 1.0;
    pr_w = if pr_w >= 1.0 { 1.0 } else { pr_w.powf(cc) };

    let wincr = if w > 3.0 { 2 } else { 3 };
    let mut blb = qsqz;
    let binc = (BB - qsqz) / wincr as f64;
    let mut bub = blb + binc;
    let cc1 = cc - 1.0;
    let mut einsum = 0.0;

    for _ in 0..wincr {
        let a = 0.5 * (bub + blb);
        let b = 0.5 * (bub - blb);
        let mut elsum = 0.0;
        for jj in 0..12 {
            let (j, xx) = if jj >= 6 {
                (11 - jj, LEG12_X[11 - jj])
            } else {
                (jj, -LEG12_X[jj])
            };
            let ac = a + b * xx;
            let qexpo = ac * ac;
            if qexpo > C3 {
                break;
            }
            let rinsum = normal_cdf(ac) - normal_cdf(ac - w);
            if rinsum >= (C1 / cc1).exp() {
                elsum += LEG12_W[j] * (-0.5 * qexpo).exp() * rinsum.powf(cc1);
            }
        }
        einsum += elsum * 2.0 * b * cc * inv_sqrt_2pi;
        blb = bub;
        bub += binc;
    }

    pr_w += einsum;
    if pr_w <= C1.exp() {
        return 0.0;
    }
    pr_w.min(1.0)
}

/// CDF of the studentized range for `nmeans` means and `df` error degrees
/// of freedom.
pub fn ptukey(q: f64, nmeans: usize, df: f64) -> f64 {
    if q.is_nan() || nmeans < 2 || df < 2.0 {
        return f64::NAN;
    }
    if q <= 0.0 {
        return 0.0;
    }
    if q.is_infinite() {
        return 1.0;
    }
    let cc = nmeans as f64;
    if df > 25_000.0 {
        return range_prob(q, cc);
    }

    const EPS1: f64 = -30.0;
    const EPS2: f64 = 1.0e-14;
    let f2 = df * 0.5;
    let ulen: f64 = if df <= 100.0 {
        1.0
    } else if df <= 800.0 {
        0.5
    } else if df <= 5000.0 {
        0.25
    } else {
        0.125
    };
    let f2lf = f2 * df.ln() - df * std::f64::consts::LN_2 - ln_gamma(f2) + ulen.ln();
    let f21 = f2 - 1.0;
    let ff4 = df * 0.25;

    let mut ans = 0.0;
    for i in 1..=50 {
        let mut otsum = 0.0;
        let twa1 = (2 * i - 1) as f64 * ulen;
        for jj in 0..16 {
            let (j, upper) = if jj >= 8 { (jj - 8, true) } else { (jj, false) };
            let xu = LEG16_X[j] * ulen;
            let t1 = if upper {
                f2lf + f21 * (twa1 + xu).ln() - (xu + twa1) * ff4
            } else {
                f2lf + f21 * (twa1 - xu).ln() + (xu - twa1) * ff4
            };
            if t1 >= EPS1 {
                let scale = if upper { twa1 + xu } else { twa1 - xu };
                let qsqz = q * (scale * 0.5).sqrt();
                otsum += range_prob(qsqz, cc) * LEG16_W[j] * t1.exp();
            }
        }
        if i as f64 * ulen >= 1.0 && otsum <= EPS2 {
            break;
        }
        ans += otsum;
    }
    ans.min(1.0)
}

/// Upper-tail probability of the studentized range.
pub fn tukey_sf(q: f64, nmeans: usize, df: f64) -> f64 {
    (1.0 - ptukey(q, nmeans, df)).max(0.0)
}

/// Quantile of the studentized range (bisection on [`ptukey`]).
pub fn qtukey(p: f64, nmeans: usize, df: f64) -> f64 {
    if !(0.0..1.0).contains(&p) || nmeans < 2 || df < 2.0 {
        return f64::NAN;
    }
    let (mut lo, mut hi) = (0.0, 10.0);
    while ptukey(hi, nmeans, df) < p {
        hi *= 2.0;
        if hi > 1e4 {
            return f64::NAN;
        }
    }
    for _ in 0..60 {
        let mid = 0.5 * (lo + hi);
        if ptukey(mid, nmeans, df) < p {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < 1e-9 {
            break;
        }
    }
    0.5 * (lo + hi)
}

// ── Dunnett ───────────────────────────────────────────────────────────

/// Composite Simpson rule over `[a, b]` with an even number of panels.
fn simpson(a: f64, b: f64, panels: usize, f: impl Fn(f64) -> f64) -> f64 {
    let n = panels.max(2) + panels % 2;
    let h = (b - a) / n as f64;
    let mut sum = f(a) + f(b);
    for i in 1..n {
        let w = if i % 2 == 1 { 4.0 } else { 2.0 };
        sum += w * f(a + i as f64 * h);
    }
    sum * h / 3.0
}

/// P(max |Z_i| < c) for Z_i = λ_i Z_0 + √(1 − λ_i²) E_i.
fn max_abs_normal_cdf(c: f64, lambdas: &[f64], panels: usize) -> f64 {
    let phi = |z: f64| (-0.5 * z * z).exp() / (2.0 * std::f64::consts::PI).sqrt();
    simpson(-8.0, 8.0, panels, |z| {
        let prod: f64 = lambdas
            .iter()
            .map(|&l| {
                let s = (1.0 - l * l).max(1e-12).sqrt();
                normal_cdf((c - l * z) / s) - normal_cdf((-c - l * z) / s)
            })
            .product();
        phi(z) * prod
    })
}

/// Two-sided Dunnett CDF: P(max_i |T_i| < t) for many-to-one comparisons.
///
/// `lambdas[i] = sqrt(n_i / (n_i + n_control))` gives the correlation
/// structure; `df` is the pooled error degrees of freedom.
pub fn dunnett_cdf(t: f64, lambdas: &[f64], df: f64, panels: usize) -> f64 {
    if !t.is_finite() || lambdas.is_empty() || df < 1.0 {
        return f64::NAN;
    }
    if t <= 0.0 {
        return 0.0;
    }
    if df > 1000.0 {
        return max_abs_normal_cdf(t, lambdas, panels).min(1.0);
    }
    // S = sqrt(χ²_df / df)
    let half = df / 2.0;
    let log_norm = std::f64::consts::LN_2 + half * half.ln() - ln_gamma(half);
    let spread = 8.0 / (2.0 * df).sqrt();
    let (s_lo, s_hi) = ((1.0 - spread).max(0.0), 1.0 + spread);
    let value = simpson(s_lo, s_hi, panels, |s| {
        if s <= 0.0 {
            return 0.0;
        }
        let log_density = log_norm + (df - 1.0) * s.ln() - df * s * s / 2.0;
        log_density.exp() * max_abs_normal_cdf(t * s, lambdas, panels)
    });
    value.clamp(0.0, 1.0)
}

/// Two-sided Dunnett p-value for one observed |t|.
pub fn dunnett_p(t: f64, lambdas: &[f64], df: f64, panels: usize) -> f64 {
    (1.0 - dunnett_cdf(t.abs(), lambdas, df, panels)).max(0.0)
}

// ── Tests ─────────────────────────────────────────────────────────────
