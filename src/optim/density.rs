//! Adaptive density control: clone, split and prune.
//!
//! A control pass reads the accumulated view-space gradient statistics and
//! restructures the store:
//! - small primitives in high-error regions are cloned
//! - large primitives in high-error regions are split into two smaller ones
//! - transparent (and, after warm-up, oversized) primitives are pruned
//!
//! All row changes go through `GaussianStore::append` and
//! `GaussianStore::select_and_compact`, so Adam moments and statistics
//! follow the attributes without a separate resize step.

use crate::core::{quaternion_to_matrix, Gaussian};
use crate::store::{GaussianStore, StoreError};
use nalgebra::Vector3;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Children produced by one split.
pub const SPLIT_CHILDREN: usize = 2;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DensifyConfig {
    /// Fraction of the scene extent separating "small" (clone) from "large"
    /// (split) primitives.
    pub percent_dense: f32,

    /// Children scale = parent scale / divisor.
    pub split_scale_divisor: f32,

    /// World-space prune bound as a fraction of the scene extent; only
    /// applied together with screen-size pruning.
    pub max_world_scale_fraction: f32,

    /// Upper bound on N; growth candidates beyond it are skipped,
    /// lowest gradient first.
    pub max_primitives: Option<usize>,
}

impl Default for DensifyConfig {
    fn default() -> Self {
        Self {
            percent_dense: 0.01,
            split_scale_divisor: 0.8 * SPLIT_CHILDREN as f32,
            max_world_scale_fraction: 0.1,
            max_primitives: None,
        }
    }
}

/// Per-pass inputs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DensifyParams {
    pub grad_threshold: f32,
    pub min_opacity: f32,
    pub scene_extent: f32,
    /// Screen-radius prune bound in pixels; `None` until warm-up is over.
    pub max_screen_size: Option<f32>,
}

/// What one pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DensifyReport {
    pub before: usize,
    pub cloned: usize,
    pub split: usize,
    pub pruned: usize,
    pub skipped_by_cap: usize,
    pub after: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Growth {
    Clone,
    Split,
}

#[derive(Clone, Debug, Default)]
pub struct DensityController {
    pub config: DensifyConfig,
}

impl DensityController {
    pub fn new(config: DensifyConfig) -> Self {
        Self { config }
    }

    fn size_cutoff(&self, scene_extent: f32) -> f32 {
        self.config.percent_dense * scene_extent
    }

    /// Observed primitives whose mean gradient reaches the threshold and
    /// whose largest axis is at most the size cutoff.
    pub fn clone_candidates(&self, store: &GaussianStore, grad_threshold: f32, scene_extent: f32) -> Vec<usize> {
        self.candidates(store, grad_threshold, scene_extent, Growth::Clone)
    }

    /// Observed primitives whose mean gradient reaches the threshold and
    /// whose largest axis exceeds the size cutoff.
    pub fn split_candidates(&self, store: &GaussianStore, grad_threshold: f32, scene_extent: f32) -> Vec<usize> {
        self.candidates(store, grad_threshold, scene_extent, Growth::Split)
    }

    fn candidates(&self, store: &GaussianStore, grad_threshold: f32, scene_extent: f32, kind: Growth) -> Vec<usize> {
        let cutoff = self.size_cutoff(scene_extent);
        let accumulator = store.accumulator();
        let mean = accumulator.mean_gradient();

        (0..store.len())
            .filter(|&i| accumulator.is_observed(i) && mean[i] >= grad_threshold)
            .filter(|&i| {
                let small = store.max_scale(i) <= cutoff;
                match kind {
                    Growth::Clone => small,
                    Growth::Split => !small,
                }
            })
            .collect()
    }

    /// Two smaller children sampled around `parent` along its principal axes.
    pub fn split_children<R: Rng + ?Sized>(&self, parent: &Gaussian, rng: &mut R) -> [Gaussian; SPLIT_CHILDREN] {
        let rotation = quaternion_to_matrix(&parent.normalized_rotation());
        let scale = parent.actual_scale();
        let child_log_scale = (scale / self.config.split_scale_divisor).map(f32::ln);

        std::array::from_fn(|_| {
            let xi = Vector3::new(
                rng.sample::<f32, _>(StandardNormal),
                rng.sample::<f32, _>(StandardNormal),
                rng.sample::<f32, _>(StandardNormal),
            );
            let mut child = parent.clone();
            child.position = parent.position + rotation * scale.component_mul(&xi);
            child.log_scale = child_log_scale;
            child
        })
    }

    /// Clones of `clones` followed by two children per entry of `splits`.
    fn growth_rows<R: Rng + ?Sized>(
        &self,
        store: &GaussianStore,
        clones: &[usize],
        splits: &[usize],
        rng: &mut R,
    ) -> Vec<Gaussian> {
        let mut rows: Vec<Gaussian> = Vec::with_capacity(clones.len() + SPLIT_CHILDREN * splits.len());
        rows.extend(clones.iter().filter_map(|&i| store.gaussian(i)));
        for &i in splits {
            if let Some(parent) = store.gaussian(i) {
                rows.extend(self.split_children(&parent, rng));
            }
        }
        rows
    }

    /// Append `new_rows`, then drop `split_parents`: one append and one
    /// compaction, so every row-aligned buffer follows.
    fn append_growth(
        store: &mut GaussianStore,
        new_rows: &[Gaussian],
        split_parents: &[usize],
    ) -> Result<(), StoreError> {
        if new_rows.is_empty() && split_parents.is_empty() {
            return Ok(());
        }
        store.append(new_rows);

        let mut keep = vec![true; store.len()];
        for &i in split_parents {
            keep[i] = false;
        }
        store.select_and_compact(&keep)?;
        Ok(())
    }

    /// Clone every clone candidate. Statistics are left untouched.
    pub fn densify_and_clone(
        &self,
        store: &mut GaussianStore,
        grad_threshold: f32,
        scene_extent: f32,
    ) -> Result<usize, StoreError> {
        let clones = self.clone_candidates(store, grad_threshold, scene_extent);
        let rows: Vec<Gaussian> = clones.iter().filter_map(|&i| store.gaussian(i)).collect();
        Self::append_growth(store, &rows, &[])?;
        Ok(clones.len())
    }

    /// Split every split candidate. Statistics are left untouched.
    pub fn densify_and_split<R: Rng + ?Sized>(
        &self,
        store: &mut GaussianStore,
        grad_threshold: f32,
        scene_extent: f32,
        rng: &mut R,
    ) -> Result<usize, StoreError> {
        let splits = self.split_candidates(store, grad_threshold, scene_extent);
        let rows = self.growth_rows(store, &[], &splits, rng);
        Self::append_growth(store, &rows, &splits)?;
        Ok(splits.len())
    }

    /// Prune mask: `true` for primitives to remove.
    pub fn prune_mask(&self, store: &GaussianStore, params: &DensifyParams) -> Vec<bool> {
        let world_bound = self.config.max_world_scale_fraction * params.scene_extent;
        let radii = store.max_screen_radius();

        (0..store.len())
            .map(|i| {
                let transparent = store.opacity(i) < params.min_opacity;
                let oversized = params.max_screen_size.is_some_and(|max_screen| {
                    radii[i] > max_screen || store.max_scale(i) > world_bound
                });
                transparent || oversized
            })
            .collect()
    }

    /// Remove transparent (and, when enabled, oversized) primitives.
    pub fn prune(&self, store: &mut GaussianStore, params: &DensifyParams) -> Result<usize, StoreError> {
        let keep: Vec<bool> = self.prune_mask(store, params).into_iter().map(|p| !p).collect();
        store.select_and_compact(&keep)
    }

    /// Full control pass: clone, split, prune, then reset statistics.
    pub fn densify_and_prune<R: Rng + ?Sized>(
        &self,
        store: &mut GaussianStore,
        params: &DensifyParams,
        rng: &mut R,
    ) -> Result<DensifyReport, StoreError> {
        let before = store.len();
        let mut clones = self.clone_candidates(store, params.grad_threshold, params.scene_extent);
        let mut splits = self.split_candidates(store, params.grad_threshold, params.scene_extent);

        let skipped_by_cap = match self.config.max_primitives {
            Some(cap) => self.apply_cap(store, cap, &mut clones, &mut splits),
            None => 0,
        };
        if skipped_by_cap > 0 {
            tracing::warn!(skipped = skipped_by_cap, cap = ?self.config.max_primitives, "growth limited by primitive cap");
        }

        let rows = self.growth_rows(store, &clones, &splits, rng);
        Self::append_growth(store, &rows, &splits)?;
        let (cloned, split) = (clones.len(), splits.len());
        debug_assert_eq!(store.len(), before + cloned + split);
        let pruned = self.prune(store, params)?;
        store.reset_densification_stats();
        store.check_invariants()?;

        Ok(DensifyReport {
            before,
            cloned,
            split,
            pruned,
            skipped_by_cap,
            after: store.len(),
        })
    }

    /// Keep the highest-gradient candidates that fit under `cap`.
    /// Clone and split both add one row net. Returns how many were dropped.
    fn apply_cap(&self, store: &GaussianStore, cap: usize, clones: &mut Vec<usize>, splits: &mut Vec<usize>) -> usize {
        let budget = cap.saturating_sub(store.len());
        let total = clones.len() + splits.len();
        if total <= budget {
            return 0;
        }

        let mean = store.accumulator().mean_gradient();
        let mut ranked: Vec<(usize, Growth)> = clones
            .iter()
            .map(|&i| (i, Growth::Clone))
            .chain(splits.iter().map(|&i| (i, Growth::Split)))
            .collect();
        ranked.sort_by(|a, b| mean[b.0].total_cmp(&mean[a.0]).then(a.0.cmp(&b.0)));
        ranked.truncate(budget);

        clones.clear();
        splits.clear();
        for (i, kind) in ranked {
            match kind {
                Growth::Clone => clones.push(i),
                Growth::Split => splits.push(i),
            }
        }
        clones.sort_unstable();
        splits.sort_unstable();
        total - budget
    }
}
