//! Tangent-point energy invariants: closed forms, Barnes–Hut consistency,
//! and analytic gradients against finite differences.

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use repel_algo::{EdgeBvh, TangentPointEnergy};
use repel_core::CurveNetwork;

fn circle(n: usize) -> CurveNetwork {
    let positions = (0..n)
        .map(|i| {
            let t = 2.0 * std::f64::consts::PI * i as f64 / n as f64;
            Vector3::new(t.cos(), t.sin(), 0.0)
        })
        .collect();
    let edges = (0..n).map(|i| [i, (i + 1) % n]).collect();
    CurveNetwork::new(positions, edges).unwrap()
}

fn random_direction(n: usize, seed: u64) -> Vec<Vector3<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            Vector3::new(
                rng.gen_range(-0.5..0.5),
                rng.gen_range(-0.5..0.5),
                rng.gen_range(-0.5..0.5),
            )
        })
        .collect()
}

/// Unit square, α = 2, β = 4: only opposite edges interact (neighbors share
/// a vertex), their midpoints are distance 1 apart with the separation
/// orthogonal to the tangent, so each of the 4 ordered pairs contributes
/// exactly 1 and E = 4.
#[test]
fn square_energy_matches_closed_form() {
    let curve = CurveNetwork::new(
        vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(1.0, 1.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
        ],
        vec![[0, 1], [1, 2], [2, 3], [3, 0]],
    )
    .unwrap();
    let tpe = TangentPointEnergy::new(2.0, 4.0).unwrap();
    let e = tpe.energy_exact(&curve);
    assert!(
        (e - 4.0).abs() < 1e-12,
        "square energy {e} deviates from closed form 4"
    );

    // The fast path agrees on this tiny input at any separation ratio.
    let bvh = EdgeBvh::build(&curve);
    let bh = tpe.energy_barnes_hut(&curve, &bvh, 1.0);
    assert!((bh - 4.0).abs() < 1e-12, "barnes-hut square energy {bh}");
}

/// As sep → 0 every cluster fails admissibility and the Barnes–Hut
/// traversal degenerates to the exact sum.
#[test]
fn barnes_hut_energy_converges_to_exact() {
    let curve = circle(128);
    let bvh = EdgeBvh::build(&curve);
    let tpe = TangentPointEnergy::new(3.0, 6.0).unwrap();
    let exact = tpe.energy_exact(&curve);

    let mut last_err = f64::INFINITY;
    for sep in [2.0, 1.0, 0.5, 0.25] {
        let bh = tpe.energy_barnes_hut(&curve, &bvh, sep);
        let err = (bh - exact).abs() / exact;
        assert!(
            err <= last_err * 1.5,
            "error did not shrink with sep: {err} after {last_err}"
        );
        last_err = err;
    }

    let bh0 = tpe.energy_barnes_hut(&curve, &bvh, 1e-9);
    assert!(
        (bh0 - exact).abs() <= 1e-12 * exact,
        "sep → 0 must recover the exact energy: {bh0} vs {exact}"
    );
}

/// Central finite differences match ⟨∇E, d⟩ to 6 digits for random d.
#[test]
fn gradient_matches_finite_differences() {
    let curve = circle(24);
    let tpe = TangentPointEnergy::new(3.0, 6.0).unwrap();
    let grad = tpe.gradient_exact(&curve);

    let eps = 1e-4;
    for seed in [7, 21, 1999] {
        let dir = random_direction(curve.num_vertices(), seed);
        let eval = |s: f64| {
            let mut c = curve.clone();
            c.displace(&dir, s);
            tpe.energy_exact(&c)
        };
        let fd = (eval(eps) - eval(-eps)) / (2.0 * eps);
        let analytic: f64 = grad.iter().zip(dir.iter()).map(|(g, d)| g.dot(d)).sum();
        let denom = fd.abs().max(analytic.abs()).max(1e-12);
        assert!(
            (fd - analytic).abs() / denom < 1e-6,
            "seed {seed}: finite difference {fd} vs analytic {analytic}"
        );
    }
}

/// The Barnes–Hut gradient at tiny sep reproduces the exact gradient, and at
/// the default sep it stays within the far-field approximation band.
#[test]
fn barnes_hut_gradient_consistency() {
    let curve = circle(96);
    let bvh = EdgeBvh::build(&curve);
    let tpe = TangentPointEnergy::new(3.0, 6.0).unwrap();

    let exact = tpe.gradient_exact(&curve);
    let scale: f64 = exact.iter().map(|g| g.norm_squared()).sum::<f64>().sqrt();

    let tight = tpe.gradient_barnes_hut(&curve, &bvh, 1e-9);
    let tight_err: f64 = exact
        .iter()
        .zip(tight.iter())
        .map(|(a, b)| (a - b).norm_squared())
        .sum::<f64>()
        .sqrt();
    assert!(tight_err <= 1e-12 * scale, "tight-sep gradient error {tight_err}");

    let loose = tpe.gradient_barnes_hut(&curve, &bvh, 1.0);
    let loose_err: f64 = exact
        .iter()
        .zip(loose.iter())
        .map(|(a, b)| (a - b).norm_squared())
        .sum::<f64>()
        .sqrt();
    assert!(
        loose_err <= 5e-2 * scale,
        "default-sep gradient error {} of scale {}",
        loose_err,
        scale
    );
}

/// Gradient directional derivative also holds on an asymmetric open curve
/// (junction-free but with endpoints, exercising valence-1 vertices).
#[test]
fn gradient_check_on_open_polyline() {
    let mut rng = StdRng::seed_from_u64(99);
    let mut p = Vector3::zeros();
    let mut positions = vec![p];
    for _ in 0..40 {
        let step = Vector3::new(
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
        );
        p += step.normalize() * 0.5;
        positions.push(p);
    }
    let n = positions.len();
    let edges = (0..n - 1).map(|i| [i, i + 1]).collect();
    let curve = CurveNetwork::new(positions, edges).unwrap();

    let tpe = TangentPointEnergy::new(3.0, 6.0).unwrap();
    let grad = tpe.gradient_exact(&curve);
    let dir = random_direction(n, 5);

    let eps = 1e-5;
    let eval = |s: f64| {
        let mut c = curve.clone();
        c.displace(&dir, s);
        tpe.energy_exact(&c)
    };
    let fd = (eval(eps) - eval(-eps)) / (2.0 * eps);
    let analytic: f64 = grad.iter().zip(dir.iter()).map(|(g, d)| g.dot(d)).sum();
    let denom = fd.abs().max(analytic.abs()).max(1e-12);
    assert!(
        (fd - analytic).abs() / denom < 1e-5,
        "finite difference {fd} vs analytic {analytic}"
    );
}
