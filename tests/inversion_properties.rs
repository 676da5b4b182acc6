use isoratio::sampler::{chain_seed, metropolis_accept};
use isoratio::{
    BlockId, ConfigError, Detector, Evaluator, FlatPriors, Interval, InversionConfig,
    InversionError, MeasurementRow, MeasurementTable, MeasurementTableBuilder, ModelState,
    ParameterLayout, PriorBounds, ProposalEngine, SamplerError, SplineConfig, run_inversion,
};
use ndarray::{Array1, Array2, array};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use rand_distr::{Distribution, Normal};

fn simulated_rows(seed: u64, cycles: u32) -> Vec<MeasurementRow> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 1.0).expect("unit normal");
    let mut rows = Vec::new();
    for cycle in 0..cycles {
        let t = cycle as f64;
        let intensity = 2.0e4 + 50.0 * t;
        let sd = (25.0 + intensity).sqrt();
        rows.push(MeasurementRow::baseline(
            t - 0.5,
            BlockId(3),
            cycle,
            0,
            100.0 + noise.sample(&mut rng),
        ));
        rows.push(MeasurementRow::on_peak(
            t,
            BlockId(3),
            cycle,
            0,
            0,
            intensity + 100.0 + sd * noise.sample(&mut rng),
        ));
        rows.push(MeasurementRow::on_peak(
            t + 0.25,
            BlockId(3),
            cycle,
            0,
            1,
            0.5 * intensity + 100.0 + sd * noise.sample(&mut rng),
        ));
        rows.push(MeasurementRow::on_peak(
            t + 0.5,
            BlockId(3),
            cycle,
            1,
            1,
            0.5 * intensity / 0.95 + (intensity / 1.9).sqrt() * noise.sample(&mut rng),
        ));
    }
    rows
}

fn build_table(rows: impl IntoIterator<Item = MeasurementRow>) -> MeasurementTable {
    let mut builder = MeasurementTableBuilder::new(2)
        .detector(Detector::faraday(0))
        .detector(Detector::ion_counter(1));
    builder.extend(rows);
    builder.build().expect("valid table")
}

fn quick_config() -> InversionConfig {
    let mut config = InversionConfig {
        trial_count: 2_000,
        thinning: 10,
        burn_in: 50,
        seed: 99,
        ..InversionConfig::default()
    };
    config.adaptation.start_after_saves = 40;
    config.adaptation.refresh_interval = 40;
    config
}

#[test]
fn saved_models_respect_priors() {
    let table = build_table(simulated_rows(1, 20));
    let mut config = quick_config();
    config.priors = PriorBounds {
        log_ratio: Interval::new(-0.8, -0.6),
        baseline: Interval::new(95.0, 105.0),
        gain: Interval::new(0.9, 1.0),
        detector_noise: Interval::new(0.0, 50.0),
        global_noise: Interval::new(0.0, 5.0),
        ..PriorBounds::default()
    };
    let output = run_inversion(&table, &config).expect("inversion runs");
    let chain = output.successful().next().expect("chain output");
    for record in chain.store.records() {
        assert!(config.priors.log_ratio.contains(record.log_ratios[0]));
        assert!(config.priors.baseline.contains(record.baselines[0]));
        assert!(config.priors.gain.contains(record.gain));
        assert!(config.priors.detector_noise.contains(record.noise[0]));
        assert!(config.priors.global_noise.contains(record.noise[1]));
        for knots in record.intensities.values() {
            assert!(knots.iter().all(|&k| k >= 0.0));
        }
    }
}

#[test]
fn point_priors_hold_groups_constant() {
    let table = build_table(simulated_rows(2, 20));
    let mut config = quick_config();
    config.priors.baseline = Interval::point(100.0);
    config.priors.gain = Interval::point(0.95);
    let output = run_inversion(&table, &config).expect("inversion runs");
    let chain = output.successful().next().expect("chain output");
    assert_eq!(chain.final_state.baselines[0], 100.0);
    for record in chain.store.records() {
        assert_eq!(record.baselines[0], 100.0);
        assert_eq!(record.gain, 0.95);
    }
    let gain_ops = chain
        .acceptance
        .operations()
        .into_iter()
        .find(|op| op.operation == "change-gain")
        .expect("gain operation");
    assert_eq!(gain_ops.accepted, 0);
}

#[test]
fn fixed_seed_replays_bit_identically() {
    let table = build_table(simulated_rows(3, 15));
    let mut config = quick_config();
    config.chain_count = 3;
    let first = run_inversion(&table, &config).expect("first run");
    let second = run_inversion(&table, &config).expect("second run");
    let a: Vec<_> = first.successful().collect();
    let b: Vec<_> = second.successful().collect();
    assert_eq!(a.len(), 3);
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(&b) {
        assert_eq!(x.seed, y.seed);
        assert_eq!(x.store.records(), y.store.records());
        assert_eq!(x.final_state, y.final_state);
    }
    assert_ne!(a[0].store.records(), a[1].store.records());
}

#[test]
fn burn_in_records_are_excluded_from_summary() {
    let table = build_table(simulated_rows(4, 15));
    let mut config = quick_config();
    config.chain_count = 2;
    config.burn_in = 30;
    let output = run_inversion(&table, &config).expect("inversion runs");
    let summary = output.summary.as_ref().expect("summary");
    assert_eq!(summary.record_count, 2 * (200 - 30));

    let kept: Vec<f64> = output
        .successful()
        .flat_map(|c| c.store.records()[30..].iter().map(|r| r.baselines[0]))
        .collect();
    let mean = kept.iter().sum::<f64>() / kept.len() as f64;
    assert!((summary.baselines[0].mean - mean).abs() < 1e-9 * mean.abs().max(1.0));

    let diagnostics = output.diagnostics.as_ref().expect("diagnostics");
    assert!(diagnostics.rhat.iter().all(|r| r.is_finite()));
}

fn two_faraday_table(rows: &[MeasurementRow], swap: bool) -> MeasurementTable {
    let relabel = |d: usize| if swap { 1 - d } else { d };
    let mut builder = MeasurementTableBuilder::new(2)
        .detector(Detector::faraday(relabel(0)).with_noise_floor(2.0))
        .detector(Detector::faraday(relabel(1)).with_noise_floor(5.0));
    builder.extend(rows.iter().map(|r| MeasurementRow {
        detector: relabel(r.detector),
        ..*r
    }));
    builder.build().expect("valid table")
}

fn two_faraday_rows() -> Vec<MeasurementRow> {
    let mut rows = Vec::new();
    for cycle in 0..8u32 {
        let t = cycle as f64;
        rows.push(MeasurementRow::baseline(t, BlockId(0), cycle, 0, 10.0 + t * 0.1));
        rows.push(MeasurementRow::baseline(t, BlockId(0), cycle, 1, 20.0 - t * 0.1));
        rows.push(MeasurementRow::on_peak(t + 0.3, BlockId(0), cycle, 0, 0, 1010.0 + t));
        rows.push(MeasurementRow::on_peak(t + 0.6, BlockId(0), cycle, 1, 1, 220.0 - t));
    }
    rows
}

fn fixed_state(layout: &ParameterLayout) -> ModelState {
    let mut state = layout.zero_state();
    state.log_ratios = array![0.2f64.ln()];
    state.intensities[0].fill(1000.0);
    state.baselines = array![10.5, 19.5];
    state.gain = 1.0;
    state.detector_noise = array![1.5, 3.0];
    state.global_noise = 0.8;
    state
}

#[test]
fn likelihood_ignores_row_order() {
    let rows = two_faraday_rows();
    let forward = two_faraday_table(&rows, false);
    let mut shuffled = rows.clone();
    let mut rng = StdRng::seed_from_u64(8);
    for i in (1..shuffled.len()).rev() {
        let j = rng.random_range(0..=i);
        shuffled.swap(i, j);
    }
    let permuted = two_faraday_table(&shuffled, false);

    let spline = SplineConfig::default();
    let layout_a = ParameterLayout::new(&forward, &spline).expect("layout");
    let layout_b = ParameterLayout::new(&permuted, &spline).expect("layout");
    let ll_a = Evaluator::new(&forward, &layout_a).log_likelihood(&fixed_state(&layout_a));
    let ll_b = Evaluator::new(&permuted, &layout_b).log_likelihood(&fixed_state(&layout_b));
    assert!((ll_a - ll_b).abs() <= 1e-9 * ll_a.abs());
}

#[test]
fn likelihood_ignores_faraday_relabelling() {
    let rows = two_faraday_rows();
    let original = two_faraday_table(&rows, false);
    let swapped = two_faraday_table(&rows, true);

    let spline = SplineConfig::default();
    let layout_a = ParameterLayout::new(&original, &spline).expect("layout");
    let layout_b = ParameterLayout::new(&swapped, &spline).expect("layout");
    let state_a = fixed_state(&layout_a);
    let mut state_b = fixed_state(&layout_b);
    state_b.baselines = array![state_a.baselines[1], state_a.baselines[0]];
    state_b.detector_noise = array![state_a.detector_noise[1], state_a.detector_noise[0]];

    let ll_a = Evaluator::new(&original, &layout_a).log_likelihood(&state_a);
    let ll_b = Evaluator::new(&swapped, &layout_b).log_likelihood(&state_b);
    assert!((ll_a - ll_b).abs() <= 1e-9 * ll_a.abs());
}

#[test]
fn uphill_moves_are_always_accepted() {
    let mut rng = StdRng::seed_from_u64(5);
    for _ in 0..1000 {
        let delta = rng.random_range(1e-12..100.0);
        let u = rng.random::<f64>();
        assert!(metropolis_accept(delta, u));
    }
}

#[test]
fn configuration_errors_surface_before_sampling() {
    let table = build_table(simulated_rows(6, 5));
    let mut config = quick_config();
    config.thinning = 0;
    assert!(matches!(
        run_inversion(&table, &config),
        Err(InversionError::Config(ConfigError::ZeroThinning))
    ));

    let mut config = quick_config();
    config.priors.global_noise = Interval::new(1.0, 0.0);
    assert!(matches!(
        run_inversion(&table, &config),
        Err(InversionError::Config(ConfigError::InvalidPrior { .. }))
    ));

    let mut config = quick_config();
    config.burn_in = config.saved_per_chain();
    assert!(matches!(
        run_inversion(&table, &config),
        Err(InversionError::Config(ConfigError::BurnInTooLarge { .. }))
    ));
}

#[test]
fn failing_chains_do_not_abort_siblings() {
    // Widely dispersed starts pin the gain to one of its bounds. A zero gain
    // makes the ion-counter prediction non-finite, so those chains fail at
    // their first evaluation while the others run to completion.
    let table = build_table(simulated_rows(7, 10));
    let mut config = quick_config();
    config.trial_count = 300;
    config.burn_in = 5;
    config.chain_count = 16;
    config.perturbation_scale = 1.0e6;
    config.priors.gain = Interval::new(0.0, 2.0);

    let output = run_inversion(&table, &config).expect("run completes");
    assert_eq!(output.chains.len(), 16);
    for (index, outcome) in output.chains.iter().enumerate() {
        match outcome {
            Ok(chain) => {
                assert_eq!(chain.chain, index);
                assert_eq!(chain.store.len(), 30);
            }
            Err(failure) => {
                assert_eq!(failure.chain, index);
                assert_eq!(failure.seed, chain_seed(config.seed, index));
                assert!(matches!(
                    failure.error,
                    SamplerError::NonFiniteLikelihood { iteration: 0, .. }
                ));
            }
        }
    }
    let failed = output.failures().count();
    let succeeded = output.successful().count();
    assert!(failed > 0 && succeeded > 0, "{failed} failed, {succeeded} succeeded");
    assert_eq!(
        output.summary.expect("summary of survivors").record_count,
        succeeded * 25
    );
}

#[test]
fn zero_blend_weight_is_rejected_before_sampling() {
    let table = build_table(simulated_rows(9, 20));
    let mut config = quick_config();
    config.adaptation.blend_weight = 0.0;
    config.priors.gain = Interval::point(0.9);
    assert!(matches!(
        run_inversion(&table, &config),
        Err(InversionError::Config(ConfigError::InvalidBlendWeight(w))) if w == 0.0
    ));
}

#[test]
fn point_priors_survive_adaptation_across_blend_weights() {
    let table = build_table(simulated_rows(10, 20));
    for blend_weight in [1.0e-3, 1.0] {
        let mut config = quick_config();
        config.chain_count = 2;
        config.adaptation.blend_weight = blend_weight;
        config.priors.gain = Interval::point(0.9);
        let output = run_inversion(&table, &config).expect("inversion runs");
        assert_eq!(output.failures().count(), 0, "blend weight {blend_weight}");
        for chain in output.successful() {
            // Refreshes after 40, 80, 120, 160 and 200 saves.
            assert_eq!(chain.adaptations, 5);
            assert!(chain.store.records().iter().all(|r| r.gain == 0.9));
        }
    }
}

#[test]
fn full_blend_weight_keeps_cold_start_proposal() {
    let table = build_table(simulated_rows(11, 20));
    let layout = ParameterLayout::new(&table, &SplineConfig::default()).expect("layout");
    let priors = FlatPriors::resolve(&layout, &table, &PriorBounds::default());
    let n = layout.len();
    let sd0 = Array1::from_shape_fn(n, |i| 0.01 + 0.002 * i as f64);
    let mut engine = ProposalEngine::new(&layout, priors, sd0.clone(), 0.5);

    let mut rng = StdRng::seed_from_u64(12);
    let noise = Normal::new(0.0, 3.0).expect("normal");
    let draws = Array2::from_shape_fn((60, n), |_| noise.sample(&mut rng));
    let covariance = isoratio::linalg::covariance::sample_covariance(draws.view())
        .expect("enough draws");
    engine.adapt(&covariance, 1.0).expect("diagonal blend factors");

    let factor = engine.joint_factor().expect("adapted");
    for i in 0..n {
        assert!((engine.step_sizes()[i] - sd0[i]).abs() < 1e-12);
        for j in 0..n {
            let expected = if i == j { sd0[i] } else { 0.0 };
            assert!((factor[[i, j]] - expected).abs() < 1e-12);
        }
    }
}

#[test]
fn best_fit_is_no_worse_than_any_saved_model() {
    let table = build_table(simulated_rows(13, 20));
    let mut config = quick_config();
    config.chain_count = 2;
    let output = run_inversion(&table, &config).expect("inversion runs");
    for chain in output.successful() {
        for record in chain.store.records() {
            assert!(chain.best_misfit <= record.weighted_misfit);
        }
        let layout = ParameterLayout::new(&table, &config.spline).expect("layout");
        let rescored = Evaluator::new(&table, &layout).evaluate(&chain.best_state);
        assert_eq!(rescored.score.weighted_misfit, chain.best_misfit);
    }
    let best = output.best_fit().expect("a successful chain");
    assert!(output.successful().all(|c| best.best_misfit <= c.best_misfit));
}
