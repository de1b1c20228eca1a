//! Checkpoint files restore the store, its optimizer state and its statistics bit for bit.

use densify_rs::core::{inverse_sigmoid, Gaussian, SH_COEFFS};
use densify_rs::io::{load_checkpoint, save_checkpoint, Checkpoint, CheckpointError};
use densify_rs::optim::Adam;
use densify_rs::store::{GaussianStore, ParamGrads};
use nalgebra::{Quaternion, Vector3, Vector4};

fn trained_store() -> (GaussianStore, Adam) {
    let rows: Vec<Gaussian> = (0..6)
        .map(|i| {
            let x = i as f32 * 0.37;
            let mut sh = [[0.0; 3]; SH_COEFFS];
            for (k, coeff) in sh.iter_mut().enumerate() {
                *coeff = [x + k as f32, -x, 0.25 * k as f32];
            }
            Gaussian::new(
                Vector3::new(x, x * x, -x),
                Quaternion::new(1.0, 0.1 * x, 0.0, -0.2),
                Vector3::new(-2.0, -2.5, -3.0 + x),
                inverse_sigmoid(0.2 + 0.1 * i as f32),
                sh,
            )
        })
        .collect();
    let mut store = GaussianStore::from_gaussians(&rows);

    let mut grads = ParamGrads::zeros(6);
    for i in 0..6 {
        let g = i as f32 + 1.0;
        grads.position[i] = Vector3::new(g, -g, 0.5 * g);
        grads.rotation[i] = Vector4::new(0.1 * g, 0.0, -0.1, g);
        grads.log_scale[i] = Vector3::repeat(0.3 * g);
        grads.opacity[i] = -g;
        grads.sh[i][0] = [g, g, g];
        grads.sh[i][5] = [0.5, -0.5, g];
    }
    let mut adam = Adam::new(Default::default(), Default::default());
    for _ in 0..3 {
        store.accumulate_grads(&grads).unwrap();
        store.optimizer_step(&mut adam).unwrap();
        store.zero_grad();
    }

    store
        .record_render_stats(
            &[true, false, true, true, false, true],
            &[3.0, 0.0, 1.5, 7.25, 0.0, 2.0],
            &[0.1, 0.0, 0.02, 0.3, 0.0, 0.004],
        )
        .unwrap();
    (store, adam)
}

#[test]
fn test_checkpoint_file_roundtrip_is_exact() {
    let (store, adam) = trained_store();
    let checkpoint = Checkpoint {
        iteration: 3,
        active_sh_degree: 2,
        max_sh_degree: 3,
        adam_step: adam.step_count(),
        scene_extent: 4.4,
        store: store.snapshot(),
    };

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chkpnt3.ckpt");
    save_checkpoint(&path, &checkpoint).unwrap();
    let loaded = load_checkpoint(&path).unwrap();

    assert_eq!(loaded, checkpoint);
    let restored = loaded.restore_store().unwrap();
    assert_eq!(restored.len(), 6);
    assert_eq!(restored.snapshot(), store.snapshot());
    assert_eq!(restored.moments(), store.moments());
    assert_eq!(
        restored.accumulator().observation_counts(),
        store.accumulator().observation_counts()
    );
    for (a, b) in restored.positions().iter().zip(store.positions()) {
        assert_eq!(a.map(f32::to_bits), b.map(f32::to_bits));
    }
}

#[test]
fn test_ragged_checkpoint_is_rejected_on_restore() {
    let (store, _) = trained_store();
    let mut snapshot = store.snapshot();
    snapshot.max_screen_radius.pop();
    let checkpoint = Checkpoint {
        iteration: 1,
        active_sh_degree: 0,
        max_sh_degree: 3,
        adam_step: 1,
        scene_extent: 1.0,
        store: snapshot,
    };
    assert!(checkpoint.restore_store().is_err());
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        load_checkpoint(dir.path().join("missing.ckpt")),
        Err(CheckpointError::Io(_))
    ));
}
