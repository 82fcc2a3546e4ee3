//! End-to-end optimization over a small switched-light domain: two boolean
//! action fluents over three lights, at most two actions active per step.

use std::sync::Arc;

use gp_model::{Cpf, Expr, LiftedModel, Role, VarDecl, VarKind};
use gp_plan::{Config, OptimizeOptions, Planner, PlannerOptions, ProjectionKind};
use gp_runtime::{PrngKey, Tensor, TensorMap};

const HORIZON: usize = 5;
const LIGHTS: usize = 3;

/// Lights turn on when set, off when cleared; reward counts lit lights.
fn lights_model() -> Arc<LiftedModel> {
    let mut m = LiftedModel::default();
    m.insert_var(
        VarDecl::new("on", Role::State, VarKind::Bool, &[LIGHTS]),
        Tensor::zeros(&[LIGHTS]),
    );
    m.insert_var(
        VarDecl::new("clear", Role::Action, VarKind::Bool, &[LIGHTS]),
        Tensor::zeros(&[LIGHTS]),
    );
    m.insert_var(
        VarDecl::new("set", Role::Action, VarKind::Bool, &[LIGHTS]),
        Tensor::zeros(&[LIGHTS]),
    );
    m.levels = vec![vec![Cpf::next_state(
        "on",
        Expr::var("on")
            .or(Expr::var("set"))
            .and(Expr::var("clear").not()),
    )]];
    m.reward = Expr::var("on'").sum_over();
    m.discount = 0.9;
    m.horizon = HORIZON;
    m.max_concurrent_actions = Some(2);
    Arc::new(m)
}

fn small_planner() -> Planner {
    let opts = PlannerOptions {
        batch_size_train: 4,
        ..PlannerOptions::default()
    };
    Planner::new(lights_model(), opts).unwrap()
}

#[test]
fn optimization_runs_and_stays_feasible() {
    let planner = small_planner();
    assert_eq!(planner.plan().projection(), ProjectionKind::Sorting);

    let run_opts = OptimizeOptions {
        epochs: 5,
        step: 1,
        ..OptimizeOptions::default()
    };
    let callbacks: Vec<_> = planner
        .optimize(PrngKey::new(3), run_opts)
        .unwrap()
        .collect();
    assert_eq!(callbacks.len(), 5);

    let last = callbacks.last().unwrap();
    assert!(last.projection_converged);
    // Every reporting period stays inside the concurrency limit.
    for cb in &callbacks {
        let counts = planner
            .plan()
            .active_counts(&cb.params, &Default::default())
            .unwrap();
        assert_eq!(counts.len(), HORIZON);
        assert!(counts.iter().all(|&n| n <= 2), "counts {counts:?}");
    }
    // The best checkpoint is at least as good as the last test evaluation.
    assert!(last.best_return >= last.test_return - 1e-12);
}

#[test]
fn identical_keys_give_identical_runs() {
    let opts = OptimizeOptions {
        epochs: 3,
        step: 1,
        ..OptimizeOptions::default()
    };
    let a: Vec<_> = small_planner()
        .optimize(PrngKey::new(99), opts.clone())
        .unwrap()
        .collect();
    let b: Vec<_> = small_planner()
        .optimize(PrngKey::new(99), opts)
        .unwrap()
        .collect();
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(&b) {
        assert_eq!(x.train_return.to_bits(), y.train_return.to_bits());
        assert_eq!(x.test_return.to_bits(), y.test_return.to_bits());
        assert_eq!(x.params, y.params);
    }
}

#[test]
fn warm_start_guess_keeps_shapes_and_is_projected() {
    let planner = small_planner();
    let first: Vec<_> = planner
        .optimize(
            PrngKey::new(5),
            OptimizeOptions {
                epochs: 2,
                step: 1,
                ..OptimizeOptions::default()
            },
        )
        .unwrap()
        .collect();
    let params = &first.last().unwrap().params;
    let guess = planner.plan().next_epoch_guess(params).unwrap();
    for (name, t) in &guess {
        assert_eq!(t.shape(), params.get(name).unwrap().shape());
    }

    let warm: Vec<_> = planner
        .optimize(
            PrngKey::new(6),
            OptimizeOptions {
                epochs: 1,
                step: 1,
                guess: Some(guess),
                ..OptimizeOptions::default()
            },
        )
        .unwrap()
        .collect();
    assert_eq!(warm.len(), 1);
    assert_eq!(warm[0].params.get("set").unwrap().shape(), &[HORIZON, LIGHTS]);
}

#[test]
fn misshapen_guess_is_rejected_before_the_first_iteration() {
    let planner = small_planner();

    let mut guess = TensorMap::new();
    guess.insert("set".to_string(), Tensor::zeros(&[HORIZON, LIGHTS]));
    // Wrong trailing shape for "clear".
    guess.insert("clear".to_string(), Tensor::zeros(&[HORIZON, LIGHTS + 1]));

    let err = planner.optimize(
        PrngKey::new(1),
        OptimizeOptions {
            epochs: 3,
            step: 1,
            guess: Some(guess),
            ..OptimizeOptions::default()
        },
    );
    assert!(err.is_err());
}

#[test]
fn get_action_drops_noops_and_respects_limit() {
    let planner = small_planner();

    let mut params = TensorMap::new();
    let mut set = vec![-3.0; HORIZON * LIGHTS];
    set[0] = 3.0; // set___0 at step 0
    set[1] = 1.0; // set___1 at step 0
    params.insert(
        "set".to_string(),
        Tensor::from_vec(vec![HORIZON, LIGHTS], set).unwrap(),
    );
    params.insert(
        "clear".to_string(),
        Tensor::full(&[HORIZON, LIGHTS], -2.0),
    );

    let subs = TensorMap::new();
    let actions = planner
        .get_action(PrngKey::new(0), &params, 0, &subs)
        .unwrap();
    assert_eq!(actions.len(), 2);
    assert_eq!(actions.get("set___0"), Some(&1.0));
    assert_eq!(actions.get("set___1"), Some(&1.0));
    assert!(!actions.contains_key("set___2"));
    assert!(!actions.keys().any(|k| k.starts_with("clear")));

    // A later step has everything at no-op.
    let actions = planner
        .get_action(PrngKey::new(0), &params, 1, &subs)
        .unwrap();
    assert!(actions.is_empty());
}

#[test]
fn run_log_written_per_reporting_period() {
    let planner = small_planner();
    let dir = tempfile::tempdir().unwrap();
    let events_path = dir.path().join("events.ndjson");
    let manifest_path = dir.path().join("run.json");

    let mut writer = gp_logging::NdjsonWriter::open_append(&events_path).unwrap();
    let mut manifest = gp_logging::RunManifestV1 {
        run_manifest_version: gp_logging::RUN_MANIFEST_VERSION,
        run_id: "e2e".to_string(),
        created_ts_ms: gp_logging::now_ms(),
        git_hash: None,
        config_hash: Some(gp_logging::hash_config_bytes(
            serde_yaml_bytes(&Config::default()).as_slice(),
        )),
        seed: 17,
        logs_dir: dir.path().display().to_string(),
        epochs_completed: 0,
        best_return: None,
        best_iteration: None,
    };

    let run_opts = OptimizeOptions {
        epochs: 4,
        step: 2,
        ..OptimizeOptions::default()
    };
    let mut periods = 0u64;
    for cb in planner.optimize(PrngKey::new(17), run_opts).unwrap() {
        writer
            .write_event(&gp_logging::ProgressEventV1 {
                event: "progress",
                ts_ms: gp_logging::now_ms(),
                run_id: "e2e".to_string(),
                iteration: cb.iteration as u64,
                train_return: cb.train_return,
                test_return: cb.test_return,
                best_return: cb.best_return,
                projection_converged: cb.projection_converged,
                out_of_bounds: cb.train_log.out_of_bounds,
            })
            .unwrap();
        manifest.epochs_completed = cb.iteration as u64 + 1;
        manifest.best_return = Some(cb.best_return);
        periods += 1;
    }
    writer.flush().unwrap();
    gp_logging::write_manifest_atomic(&manifest_path, &manifest).unwrap();

    // Epochs 0 and 2 hit the period; epoch 3 is the final iteration.
    assert_eq!(periods, 3);
    let text = std::fs::read_to_string(&events_path).unwrap();
    assert_eq!(text.lines().count(), 3);
    let got = gp_logging::read_manifest(&manifest_path).unwrap();
    assert_eq!(got.epochs_completed, 4);
    assert!(got.best_return.is_some());
}

fn serde_yaml_bytes(config: &Config) -> Vec<u8> {
    serde_yaml::to_string(config).unwrap().into_bytes()
}
