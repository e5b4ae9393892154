//! End-to-end tests on synthetic star fields.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::catalog::{CatalogRow, StarCatalog};
use crate::config::{
    InputConfig, InterpConfig, ModelConfig, OneOrMany, OutliersConfig, PixelGridInit, PsfConfig,
    PsfSection, SelectConfig,
};
use crate::error::PsfError;
use crate::image::Image;
use crate::interpolant::Interpolant;
use crate::model::analytic::{GaussianPSF, PSFFunction};
use crate::psf::{fit, FocalPlaneModel, StarStatus};
use crate::select::select_stars;

const FIELD: usize = 420;
const FLUX: f64 = 20000.0;

fn true_size(u: f64, v: f64) -> f64 {
    1.5 + 0.15 * u / 400.0 - 0.1 * v / 400.0
}

fn true_g1(u: f64, _v: f64) -> f64 {
    0.02 + 0.03 * u / 400.0
}

fn true_g2(_u: f64, v: f64) -> f64 {
    -0.01 + 0.02 * v / 400.0
}

/// Stars on a 10x10 grid with unit Gaussian pixel noise. Stars listed in
/// `outliers` are drawn 60% wider than the field PSF. `size_scale` lets a
/// test widen individual stars by other amounts.
fn synthetic_field(
    outliers: &[usize],
    size_scale: impl Fn(usize) -> f64,
    seed: u64,
) -> (StarCatalog, Image) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut image = Image::filled(FIELD, FIELD, 0.0);
    let psf = GaussianPSF { pixel_area: 1.0 };
    let mut rows = Vec::new();

    for k in 0..100 {
        let x = 30.0 + 40.0 * (k % 10) as f64 + rng.gen_range(-0.5..0.5);
        let y = 30.0 + 40.0 * (k / 10) as f64 + rng.gen_range(-0.5..0.5);
        let mut size = true_size(x, y) * size_scale(k);
        if outliers.contains(&k) {
            size *= 1.6;
        }
        let params = [FLUX, 0.0, 0.0, 0.0, size, true_g1(x, y), true_g2(x, y)];
        let (xc, yc) = (x.round() as i64, y.round() as i64);
        for j in (yc - 12)..=(yc + 12) {
            for i in (xc - 12)..=(xc + 12) {
                let value = psf.value(i as f64 - x, j as f64 - y, &params);
                image.data[j as usize * FIELD + i as usize] += value;
            }
        }
        rows.push(CatalogRow {
            index: k,
            image: 0,
            x,
            y,
            u: x,
            v: y,
            flag: 0,
            properties: HashMap::from([("x".to_string(), x), ("y".to_string(), y)]),
        });
    }
    let noise = Normal::new(0.0, 1.0).unwrap();
    for value in image.data.iter_mut() {
        *value += noise.sample(&mut rng);
    }
    (StarCatalog::from_rows(rows), image)
}

fn config(interp: InterpConfig, outliers: Option<OutliersConfig>) -> PsfConfig {
    let mut psf = PsfSection::new(ModelConfig::Gaussian, interp);
    psf.outliers = outliers;
    PsfConfig {
        input: InputConfig {
            dir: None,
            image_file_name: OneOrMany::One("synthetic.fits".into()),
            cat_file_name: OneOrMany::One("synthetic.csv".into()),
            x_col: "x".into(),
            y_col: "y".into(),
            u_col: None,
            v_col: None,
            flag_col: None,
            skip_flag: None,
            use_flag: None,
            property_cols: vec![],
            stamp_size: 21,
            pixel_scale: 1.0,
            gain: None,
            noise: Some(1.0),
        },
        select: SelectConfig {
            min_stars: 10,
            ..Default::default()
        },
        psf,
        output: None,
        verbose: 0,
    }
}

fn chisq_outliers(max_remove: f64) -> Option<OutliersConfig> {
    Some(OutliersConfig::Chisq {
        nsigma: 6.0,
        max_remove: Some(max_remove),
    })
}

fn rejected(model: &FocalPlaneModel) -> Vec<usize> {
    model
        .stars
        .iter()
        .filter(|s| matches!(s.status, StarStatus::Rejected { .. }))
        .map(|s| s.index)
        .collect()
}

#[test]
fn test_recovers_field_and_flags_exactly_the_outliers() {
    let outliers = [7, 42, 88];
    let (catalog, image) = synthetic_field(&outliers, |_| 1.0, 11);
    let cfg = config(
        InterpConfig::BasisPolynomial { order: 1 },
        Some(OutliersConfig::Chisq {
            nsigma: 4.0,
            max_remove: None,
        }),
    );

    let model = fit(&catalog, &[image], &cfg).unwrap();

    assert!(model.converged);
    assert_eq!(rejected(&model), outliers.to_vec());
    assert_eq!(model.accepted().count(), 97);
    // The default cap removes one star per pass at this sample size, then a clean pass.
    assert_eq!(model.iterations, 4);

    for &(u, v) in &[(50.0, 50.0), (200.0, 310.0), (380.0, 120.0)] {
        let shape = model.shape_at((u, v));
        let size = true_size(u, v);
        assert!((shape[0] - size).abs() < 0.01 * size, "size {} vs {}", shape[0], size);
        assert!((shape[1] - true_g1(u, v)).abs() < 0.005, "g1 {}", shape[1]);
        assert!((shape[2] - true_g2(u, v)).abs() < 0.005, "g2 {}", shape[2]);
    }
}

#[test]
fn test_accepted_stars_are_subset_of_selection() {
    let (catalog, image) = synthetic_field(&[3, 50], |_| 1.0, 5);
    let mut cfg = config(InterpConfig::BasisPolynomial { order: 1 }, chisq_outliers(1.0));
    cfg.select.hsm_size_reject = Some(10.0);
    cfg.select.reserve_frac = 0.1;
    let images = [image];

    let selection = select_stars(&catalog, &images, &cfg.input, &cfg.select).unwrap();
    let selected: Vec<usize> = selection.stars.iter().map(|s| s.index()).collect();
    let model = fit(&catalog, &images, &cfg).unwrap();

    assert_eq!(model.stars.len(), selection.total());
    for star in model.accepted() {
        assert!(selected.contains(&star.index));
    }
    let reserved = model.count(|s| *s == StarStatus::Reserved);
    assert_eq!(reserved, selection.reserve.len());
}

#[test]
fn test_rerun_is_bit_identical() {
    let (catalog, image) = synthetic_field(&[10, 20, 30], |_| 1.0, 3);
    let cfg = config(InterpConfig::BasisPolynomial { order: 1 }, chisq_outliers(1.0));
    let images = [image];

    let first = fit(&catalog, &images, &cfg).unwrap();
    let second = fit(&catalog, &images, &cfg).unwrap();
    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[test]
fn test_size_reject_is_monotone() {
    // A spread of sizes so that each threshold cuts somewhere different.
    let (catalog, image) = synthetic_field(&[], |k| 1.0 + 0.004 * ((k * 37) % 100) as f64, 9);
    let mut cfg = config(InterpConfig::Mean, None);
    cfg.select.min_stars = 0;
    let images = [image];

    let mut last = 0;
    for threshold in [0.25, 0.5, 1.0, 1.5, 2.0, 3.0, 5.0, 100.0] {
        cfg.select.hsm_size_reject = Some(threshold);
        let selection = select_stars(&catalog, &images, &cfg.input, &cfg.select).unwrap();
        assert!(
            selection.total() >= last,
            "threshold {} kept {} < {}",
            threshold,
            selection.total(),
            last
        );
        last = selection.total();
    }
    assert_eq!(last, 100);
}

#[test]
fn test_max_iter_exceeded_is_reported() {
    let (catalog, image) = synthetic_field(&[7, 42, 88], |_| 1.0, 11);
    let mut cfg = config(InterpConfig::BasisPolynomial { order: 1 }, chisq_outliers(1.0));
    cfg.psf.max_iter = 2;

    let model = fit(&catalog, &[image], &cfg).unwrap();
    assert!(!model.converged);
    assert_eq!(model.iterations, 2);
    assert_eq!(rejected(&model).len(), 2);
    // The returned interpolation excludes every rejected star.
    assert_eq!(model.accepted().count(), 98);
}

#[test]
fn test_singular_interpolation_aborts() {
    let (catalog, image) = synthetic_field(&[], |_| 1.0, 1);
    // Keep a single column of stars: every u is nearly the same.
    let column: Vec<CatalogRow> = catalog
        .rows()
        .iter()
        .filter(|r| r.index % 10 == 0)
        .map(|r| CatalogRow { u: 30.0, ..r.clone() })
        .collect();
    let catalog = StarCatalog::from_rows(column);
    let mut cfg = config(InterpConfig::BasisPolynomial { order: 1 }, None);
    cfg.select.min_stars = 5;

    let err = fit(&catalog, &[image], &cfg).unwrap_err();
    assert!(matches!(err, PsfError::Interpolation(_)));
}

#[test]
fn test_too_few_stars_is_selection_error() {
    let (catalog, image) = synthetic_field(&[], |_| 1.0, 2);
    let mut cfg = config(InterpConfig::Mean, None);
    cfg.select.min_stars = 101;
    let err = fit(&catalog, &[image], &cfg).unwrap_err();
    assert!(matches!(err, PsfError::Selection(_)));
}

#[test]
fn test_mass_rejection_below_min_stars_aborts() {
    // Mean cannot follow the size gradient, so an uncapped pass rejects most of the field.
    let (catalog, image) = synthetic_field(&[], |_| 1.0, 6);
    let mut cfg = config(
        InterpConfig::Mean,
        Some(OutliersConfig::Chisq {
            nsigma: 1.0,
            max_remove: Some(100.0),
        }),
    );
    cfg.select.min_stars = 95;

    let err = fit(&catalog, &[image], &cfg).unwrap_err();
    assert!(matches!(err, PsfError::Selection(_)));
}

#[test]
fn test_model_json_round_trip() {
    let (catalog, image) = synthetic_field(&[5], |_| 1.0, 4);
    let cfg = config(InterpConfig::Knn { n_neighbors: 8 }, chisq_outliers(1.0));
    let model = fit(&catalog, &[image], &cfg).unwrap();

    let path = std::env::temp_dir().join(format!("psf_field_model_{}.json", std::process::id()));
    model.save(&path).unwrap();
    let loaded = FocalPlaneModel::load(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(loaded, model);
    assert_eq!(loaded.shape_at((123.0, 321.0)), model.shape_at((123.0, 321.0)));
}

#[test]
fn test_pixel_grid_pipeline() {
    // Constant PSF on integer positions so the grid samples it exactly.
    let mut rng = StdRng::seed_from_u64(21);
    let mut image = Image::filled(FIELD, FIELD, 0.0);
    let psf = GaussianPSF { pixel_area: 1.0 };
    let params = [FLUX, 0.0, 0.0, 0.0, 1.5, 0.0, 0.0];
    let mut rows = Vec::new();
    for k in 0..20 {
        let x = 30 + 80 * (k % 5);
        let y = 30 + 80 * (k / 5);
        for j in (y - 12)..=(y + 12) {
            for i in (x - 12)..=(x + 12) {
                image.data[j * FIELD + i] += psf.value(i as f64 - x as f64, j as f64 - y as f64, &params);
            }
        }
        rows.push(CatalogRow {
            index: k,
            image: 0,
            x: x as f64,
            y: y as f64,
            u: x as f64,
            v: y as f64,
            flag: 0,
            properties: HashMap::new(),
        });
    }
    let noise = Normal::new(0.0, 1.0).unwrap();
    for value in image.data.iter_mut() {
        *value += noise.sample(&mut rng);
    }

    let mut cfg = config(InterpConfig::Mean, None);
    cfg.psf.model = ModelConfig::PixelGrid {
        scale: 1.0,
        size: 15,
        interp: Interpolant::Lanczos(3),
        centered: true,
        init: PixelGridInit::Hsm,
    };
    let model = fit(&StarCatalog::from_rows(rows), &[image], &cfg).unwrap();
    assert!(model.converged);
    assert_eq!(model.accepted().count(), 20);

    let drawn = model.draw((200.0, 200.0), 21, 1.0, 1.0);
    let peak = 1.0 / (2.0 * std::f64::consts::PI * 1.5 * 1.5);
    assert!((drawn[10 * 21 + 10] - peak).abs() < 2e-3, "peak {}", drawn[10 * 21 + 10]);
    assert!((drawn.iter().sum::<f64>() - 1.0).abs() < 1e-6);
}
