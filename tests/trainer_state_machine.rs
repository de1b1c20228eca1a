//! Trainer scheduling: phases, control passes, opacity resets, SH degree,
//! hooks, failure policy and resume.

use approx::assert_relative_eq;
use densify_rs::core::{inverse_sigmoid, Camera, Gaussian, SH_COEFFS};
use densify_rs::io::{load_checkpoint, save_checkpoint, Checkpoint};
use densify_rs::optim::{
    EvalReport, EvalSet, LrSchedule, NoHooks, TrainConfig, TrainError, TrainPhase, TrainView, Trainer, TrainingHooks,
};
use densify_rs::render::{AdditiveRasterizer, BackwardOutput, Image, Rasterizer, RenderError, RenderOutput};
use densify_rs::store::{GaussianStore, ParamGrads};
use nalgebra::{Quaternion, Vector3};
use std::cell::RefCell;
use std::rc::Rc;

/// Renders the background everywhere and reports a fixed view-space gradient.
struct ScriptedRasterizer {
    grad_norm: f32,
    pixel: f32,
    bad_rows: bool,
    degrees: Rc<RefCell<Vec<usize>>>,
}

impl ScriptedRasterizer {
    fn new(grad_norm: f32) -> Self {
        Self {
            grad_norm,
            pixel: 0.0,
            bad_rows: false,
            degrees: Rc::default(),
        }
    }
}

impl Rasterizer for ScriptedRasterizer {
    fn forward(
        &mut self,
        camera: &Camera,
        store: &GaussianStore,
        active_sh_degree: usize,
        _background: Vector3<f32>,
    ) -> Result<RenderOutput, RenderError> {
        self.degrees.borrow_mut().push(active_sh_degree);
        let n = if self.bad_rows { store.len() + 1 } else { store.len() };
        Ok(RenderOutput {
            image: Image::filled(camera.width, camera.height, Vector3::repeat(self.pixel)),
            visibility: vec![true; n],
            radii: vec![1.0; n],
        })
    }

    fn backward(
        &mut self,
        _camera: &Camera,
        store: &GaussianStore,
        _active_sh_degree: usize,
        _background: Vector3<f32>,
        _forward: &RenderOutput,
        _d_image: &[Vector3<f32>],
    ) -> Result<BackwardOutput, RenderError> {
        Ok(BackwardOutput {
            grads: ParamGrads::zeros(store.len()),
            viewspace_grad_norms: vec![self.grad_norm; store.len()],
        })
    }
}

fn views(count: usize, size: u32) -> Vec<TrainView> {
    (0..count)
        .map(|i| {
            let angle = i as f32;
            let camera = Camera::look_at(
                Vector3::new(4.0 * angle.cos(), 0.0, 4.0 * angle.sin()),
                Vector3::zeros(),
                Vector3::new(0.0, -1.0, 0.0),
                size as f32,
                size,
                size,
            );
            TrainView {
                name: format!("v{i}"),
                camera,
                image: Image::filled(size, size, Vector3::zeros()),
            }
        })
        .collect()
}

fn gaussians(n: usize) -> Vec<Gaussian> {
    (0..n)
        .map(|i| {
            let x = i as f32 * 0.1 - 0.2;
            let mut sh = [[0.0; 3]; SH_COEFFS];
            sh[0] = [0.3, -0.2, 0.1];
            Gaussian::new(
                Vector3::new(x, 0.0, 0.0),
                Quaternion::identity(),
                Vector3::repeat(0.05f32.ln()),
                inverse_sigmoid(0.5),
                sh,
            )
        })
        .collect()
}

fn small_config() -> TrainConfig {
    TrainConfig {
        iterations: 40,
        densify_from_iter: 5,
        densify_until_iter: 30,
        densification_interval: 5,
        opacity_reset_interval: 20,
        sh_degree_interval: 10,
        save_iterations: Vec::new(),
        test_iterations: Vec::new(),
        scene_extent: Some(1.0),
        ..TrainConfig::default()
    }
}

#[test]
fn test_control_pass_and_reset_schedule() {
    let mut trainer = Trainer::new(
        small_config(),
        &gaussians(4),
        views(3, 4),
        Box::new(ScriptedRasterizer::new(0.0)),
    )
    .unwrap();

    let mut reports = Vec::new();
    while !trainer.is_finished() {
        reports.push(trainer.step(&mut NoHooks).unwrap());
    }
    assert_eq!(reports.len(), 40);

    let passes: Vec<usize> = reports.iter().filter(|r| r.densify.is_some()).map(|r| r.iteration).collect();
    assert_eq!(passes, vec![10, 15, 20, 25]);

    let resets: Vec<usize> = reports.iter().filter(|r| r.opacity_reset).map(|r| r.iteration).collect();
    assert_eq!(resets, vec![20]);

    assert_eq!(reports[0].phase, TrainPhase::Warmup);
    assert_eq!(reports[4].phase, TrainPhase::Warmup);
    assert_eq!(reports[5].phase, TrainPhase::ActiveDensify);
    assert_eq!(reports[29].phase, TrainPhase::PostDensify);
    assert_eq!(trainer.phase(), TrainPhase::Finished);

    // Zero gradients: nothing grows, nothing is transparent enough to prune.
    assert_eq!(trainer.store().len(), 4);
}

#[test]
fn test_white_background_resets_at_densify_start() {
    let config = TrainConfig {
        white_background: true,
        ..small_config()
    };
    let mut trainer = Trainer::new(config, &gaussians(2), views(2, 4), Box::new(ScriptedRasterizer::new(0.0))).unwrap();
    let mut resets = Vec::new();
    while !trainer.is_finished() {
        let report = trainer.step(&mut NoHooks).unwrap();
        if report.opacity_reset {
            resets.push(report.iteration);
        }
    }
    assert_eq!(resets, vec![5, 20]);
}

#[test]
fn test_sh_degree_reaches_max_after_3000_and_stays_clamped() {
    let config = TrainConfig {
        iterations: 10_000,
        densify_until_iter: 0,
        save_iterations: Vec::new(),
        test_iterations: Vec::new(),
        scene_extent: Some(1.0),
        log_interval: 0,
        ..TrainConfig::default()
    };
    let rasterizer = ScriptedRasterizer::new(0.0);
    let degrees = rasterizer.degrees.clone();
    let mut trainer = Trainer::new(config, &gaussians(1), views(1, 2), Box::new(rasterizer)).unwrap();

    for _ in 0..3000 {
        trainer.step(&mut NoHooks).unwrap();
    }
    assert_eq!(trainer.active_sh_degree(), 3);
    trainer.run(&mut NoHooks).unwrap();
    assert_eq!(trainer.active_sh_degree(), 3);

    let degrees = degrees.borrow();
    assert_eq!(degrees.len(), 10_000);
    assert_eq!(degrees[0], 0);
    assert_eq!(degrees[998], 0);
    assert_eq!(degrees[999], 1);
    assert_eq!(degrees[2999], 3);
    assert_eq!(degrees[9999], 3);
}

#[test]
fn test_high_gradients_grow_population_up_to_cap() {
    let mut config = small_config();
    config.densify.max_primitives = Some(12);
    let mut trainer = Trainer::new(config, &gaussians(4), views(2, 4), Box::new(ScriptedRasterizer::new(1.0))).unwrap();

    let first_pass = loop {
        let report = trainer.step(&mut NoHooks).unwrap();
        if let Some(pass) = report.densify {
            break pass;
        }
    };
    // Scale 0.05 is above percent_dense * extent, so every candidate splits.
    assert_eq!(first_pass.before, 4);
    assert_eq!(first_pass.split, 4);
    assert_eq!(first_pass.cloned, 0);
    assert_eq!(first_pass.after, 8);

    trainer.run(&mut NoHooks).unwrap();
    assert_eq!(trainer.store().len(), 12);
    trainer.store().check_invariants().unwrap();
}

#[test]
fn test_non_finite_loss_aborts_by_default() {
    let mut rasterizer = ScriptedRasterizer::new(0.0);
    rasterizer.pixel = f32::NAN;
    let mut trainer = Trainer::new(small_config(), &gaussians(2), views(1, 4), Box::new(rasterizer)).unwrap();
    assert!(matches!(
        trainer.step(&mut NoHooks),
        Err(TrainError::NonFiniteLoss { iteration: 1, .. })
    ));
}

#[test]
fn test_non_finite_loss_can_be_skipped() {
    let mut rasterizer = ScriptedRasterizer::new(0.0);
    rasterizer.pixel = f32::NAN;
    let config = TrainConfig {
        abort_on_non_finite: false,
        ..small_config()
    };
    let mut trainer = Trainer::new(config, &gaussians(2), views(1, 4), Box::new(rasterizer)).unwrap();
    let report = trainer.step(&mut NoHooks).unwrap();
    assert!(report.loss.is_nan());
    assert_eq!(trainer.iteration(), 1);
    assert!(trainer.store().all_finite());
}

#[test]
fn test_wrong_rasterizer_row_count_is_rejected() {
    let mut rasterizer = ScriptedRasterizer::new(0.0);
    rasterizer.bad_rows = true;
    let mut trainer = Trainer::new(small_config(), &gaussians(3), views(1, 4), Box::new(rasterizer)).unwrap();
    assert!(matches!(
        trainer.step(&mut NoHooks),
        Err(TrainError::Render(RenderError::LengthMismatch { .. }))
    ));
}

#[test]
fn test_no_views_rejected() {
    assert!(matches!(
        Trainer::new(small_config(), &gaussians(1), Vec::new(), Box::new(ScriptedRasterizer::new(0.0))),
        Err(TrainError::NoViews)
    ));
}

#[derive(Default)]
struct RecordingHooks {
    saves: Vec<usize>,
    tests: Vec<EvalReport>,
    checkpoints: Vec<Checkpoint>,
}

impl TrainingHooks for RecordingHooks {
    fn on_test(&mut self, report: &EvalReport) -> anyhow::Result<()> {
        self.tests.push(*report);
        Ok(())
    }

    fn on_save(&mut self, iteration: usize, _store: &GaussianStore) -> anyhow::Result<()> {
        self.saves.push(iteration);
        Ok(())
    }

    fn on_checkpoint(&mut self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        self.checkpoints.push(checkpoint.clone());
        Ok(())
    }
}

#[test]
fn test_hooks_fire_on_their_iterations() {
    let config = TrainConfig {
        save_iterations: vec![7],
        test_iterations: vec![12],
        checkpoint_iterations: vec![15],
        ..small_config()
    };
    let mut trainer = Trainer::new(config, &gaussians(2), views(2, 4), Box::new(ScriptedRasterizer::new(0.0))).unwrap();
    let mut hooks = RecordingHooks::default();
    trainer.run(&mut hooks).unwrap();

    assert_eq!(hooks.saves, vec![7, 40]);
    // Without held-out views only the fixed training subset is reported.
    assert_eq!(hooks.tests.len(), 1);
    assert_eq!(hooks.tests[0].set, EvalSet::Train);
    assert_eq!(hooks.tests[0].iteration, 12);
    assert_eq!(hooks.tests[0].views, 5);
    assert!(hooks.tests[0].psnr.is_infinite());
    assert_eq!(hooks.checkpoints.len(), 1);
    assert_eq!(hooks.checkpoints[0].iteration, 15);
    assert_eq!(hooks.checkpoints[0].adam_step, 15);
}

#[test]
fn test_evaluation_reports_test_and_train_sets() {
    let config = TrainConfig {
        test_iterations: vec![6, 12],
        ..small_config()
    };
    // Held-out targets are white while everything renders black.
    let mut test_views = views(3, 4);
    for view in &mut test_views {
        view.image = Image::filled(4, 4, Vector3::repeat(1.0));
    }
    let mut trainer = Trainer::new(config, &gaussians(2), views(2, 4), Box::new(ScriptedRasterizer::new(0.0)))
        .unwrap()
        .with_test_views(test_views);
    let mut hooks = RecordingHooks::default();
    trainer.run(&mut hooks).unwrap();

    let sets: Vec<(usize, EvalSet)> = hooks.tests.iter().map(|r| (r.iteration, r.set)).collect();
    assert_eq!(
        sets,
        vec![(6, EvalSet::Test), (6, EvalSet::Train), (12, EvalSet::Test), (12, EvalSet::Train)]
    );

    let test = hooks.tests[2];
    assert_eq!(test.views, 3);
    assert_relative_eq!(test.l1, 1.0);
    assert_relative_eq!(test.psnr, 0.0);

    let train = hooks.tests[3];
    assert_eq!(train.views, 5);
    assert_eq!(train.l1, 0.0);
    assert!(train.psnr.is_infinite());
}

#[test]
fn test_position_lr_follows_configured_delay() {
    let config = TrainConfig {
        position_lr_delay_steps: 20,
        ..small_config()
    };
    let expected = config.position_lr(1.0);
    let mut trainer =
        Trainer::new(config, &gaussians(2), views(2, 4), Box::new(ScriptedRasterizer::new(0.0))).unwrap();
    trainer.step(&mut NoHooks).unwrap();

    let undelayed = small_config().position_lr(1.0);
    assert_relative_eq!(trainer.adam().lrs.position, expected.lr_at(1));
    assert!(trainer.adam().lrs.position < 0.2 * undelayed.lr_at(1));
}

#[test]
fn test_resume_from_checkpoint_file_continues_schedule() {
    let config = TrainConfig {
        checkpoint_iterations: vec![12],
        ..small_config()
    };
    let mut trainer = Trainer::new(
        config.clone(),
        &gaussians(3),
        views(2, 4),
        Box::new(ScriptedRasterizer::new(1.0)),
    )
    .unwrap();
    let mut hooks = RecordingHooks::default();
    for _ in 0..12 {
        trainer.step(&mut hooks).unwrap();
    }
    let checkpoint = hooks.checkpoints.pop().unwrap();
    assert_eq!(checkpoint.active_sh_degree, 1);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chkpnt12.ckpt");
    save_checkpoint(&path, &checkpoint).unwrap();
    let loaded = load_checkpoint(&path).unwrap();
    assert_eq!(loaded, checkpoint);

    let mut resumed =
        Trainer::from_checkpoint(config, &loaded, views(2, 4), Box::new(ScriptedRasterizer::new(1.0))).unwrap();
    assert_eq!(resumed.iteration(), 12);
    assert_eq!(resumed.active_sh_degree(), 1);
    assert_eq!(resumed.adam().step_count(), 12);
    assert_eq!(resumed.store().snapshot(), trainer.store().snapshot());

    let report = resumed.step(&mut NoHooks).unwrap();
    assert_eq!(report.iteration, 13);
    assert_eq!(report.phase, TrainPhase::ActiveDensify);
}

#[test]
fn test_additive_rasterizer_end_to_end() {
    let mut scene_views = views(4, 16);
    // Targets: a gray disc in the middle of every view.
    for view in &mut scene_views {
        for y in 0..16u32 {
            for x in 0..16u32 {
                let d = ((x as f32 - 7.5).powi(2) + (y as f32 - 7.5).powi(2)).sqrt();
                if d < 4.0 {
                    view.image.pixels[(y * 16 + x) as usize] = Vector3::repeat(0.6);
                }
            }
        }
    }
    let mut config = small_config();
    config.densify_grad_threshold = 0.0;
    config.densify.max_primitives = Some(64);

    let initial = gaussians(5);
    let mut trainer = Trainer::new(config, &initial, scene_views, Box::new(AdditiveRasterizer::default())).unwrap();
    let first = trainer.step(&mut NoHooks).unwrap();
    trainer.run(&mut NoHooks).unwrap();

    assert!(first.loss.is_finite());
    assert!(trainer.store().len() > initial.len());
    assert!(trainer.store().len() <= 64);
    assert!(trainer.store().all_finite());
    trainer.store().check_invariants().unwrap();
}
