//! Training checkpoints: store attributes, Adam moments, densification
//! statistics and scheduler state in one file.
//!
//! File format: `.ckpt`, little-endian.
//!
//! ```text
//! Header:
//!   - Magic: "GSCKPT\0\0" (8 bytes)
//!   - Version: u32
//!   - Iteration: u64
//!   - Active SH degree: u32
//!   - Max SH degree: u32
//!   - Adam step: u32
//!   - Scene extent: f32
//!   - Num Gaussians: u64
//!
//! Arrays (N rows each, in this order):
//!   - positions (3 × f32), rotations (4 × f32, w,x,y,z), log scales (3 × f32),
//!     opacity logits (f32), SH coefficients (16 × 3 × f32)
//!   - max screen radius (f32), accumulated gradient norm (f32),
//!     observation count (u32)
//!   - Adam first/second moments for position, rotation (x,y,z,w), log scale,
//!     opacity, SH
//! ```

use crate::core::{ShCoeffs, SH_COEFFS};
use crate::store::{GaussianStore, Moments, ParamMoments, StoreError, StoreSnapshot};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use nalgebra::{Quaternion, Vector3, Vector4};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

const MAGIC: &[u8; 8] = b"GSCKPT\0\0";
const VERSION: u32 = 1;

/// Rows preallocated before any data is read; larger files grow as they load.
const MAX_PREALLOC_ROWS: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file magic (not a checkpoint)")]
    InvalidMagic,

    #[error("Unsupported checkpoint version: {0}")]
    UnsupportedVersion(u32),

    #[error("Inconsistent checkpoint contents: {0}")]
    Store(#[from] StoreError),
}

/// Everything needed to resume training at `iteration + 1`.
#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub iteration: usize,
    pub active_sh_degree: usize,
    pub max_sh_degree: usize,
    pub adam_step: u32,
    pub scene_extent: f32,
    pub store: StoreSnapshot,
}

impl Checkpoint {
    /// Rebuild the store, validating every array length.
    pub fn restore_store(&self) -> Result<GaussianStore, StoreError> {
        GaussianStore::from_snapshot(self.store.clone())
    }
}

/// A fixed-size row that can be written to and read from a checkpoint.
trait Row: Sized {
    fn write_row<W: Write>(&self, w: &mut W) -> std::io::Result<()>;
    fn read_row<R: Read>(r: &mut R) -> std::io::Result<Self>;
}

impl Row for f32 {
    fn write_row<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_f32::<LittleEndian>(*self)
    }

    fn read_row<R: Read>(r: &mut R) -> std::io::Result<Self> {
        r.read_f32::<LittleEndian>()
    }
}

impl Row for u32 {
    fn write_row<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u32::<LittleEndian>(*self)
    }

    fn read_row<R: Read>(r: &mut R) -> std::io::Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Row for Vector3<f32> {
    fn write_row<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        self.iter().try_for_each(|x| x.write_row(w))
    }

    fn read_row<R: Read>(r: &mut R) -> std::io::Result<Self> {
        Ok(Vector3::new(f32::read_row(r)?, f32::read_row(r)?, f32::read_row(r)?))
    }
}

impl Row for Vector4<f32> {
    fn write_row<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        self.iter().try_for_each(|x| x.write_row(w))
    }

    fn read_row<R: Read>(r: &mut R) -> std::io::Result<Self> {
        Ok(Vector4::new(
            f32::read_row(r)?,
            f32::read_row(r)?,
            f32::read_row(r)?,
            f32::read_row(r)?,
        ))
    }
}

impl Row for Quaternion<f32> {
    fn write_row<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        [self.w, self.i, self.j, self.k].iter().try_for_each(|x| x.write_row(w))
    }

    fn read_row<R: Read>(r: &mut R) -> std::io::Result<Self> {
        let w = f32::read_row(r)?;
        let i = f32::read_row(r)?;
        let j = f32::read_row(r)?;
        let k = f32::read_row(r)?;
        Ok(Quaternion::new(w, i, j, k))
    }
}

impl Row for ShCoeffs {
    fn write_row<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        self.iter().flatten().try_for_each(|x| x.write_row(w))
    }

    fn read_row<R: Read>(r: &mut R) -> std::io::Result<Self> {
        let mut sh = [[0.0f32; 3]; SH_COEFFS];
        for coeff in sh.iter_mut() {
            for c in coeff.iter_mut() {
                *c = f32::read_row(r)?;
            }
        }
        Ok(sh)
    }
}

fn write_rows<W: Write, T: Row>(w: &mut W, rows: &[T]) -> std::io::Result<()> {
    rows.iter().try_for_each(|row| row.write_row(w))
}

fn read_rows<R: Read, T: Row>(r: &mut R, n: usize) -> std::io::Result<Vec<T>> {
    let mut rows = Vec::with_capacity(n.min(MAX_PREALLOC_ROWS));
    for _ in 0..n {
        rows.push(T::read_row(r)?);
    }
    Ok(rows)
}

fn write_moments<W: Write, T: Row + crate::optim::adam::AdamElement>(
    w: &mut W,
    moments: &Moments<T>,
) -> std::io::Result<()> {
    write_rows(w, moments.first())?;
    write_rows(w, moments.second())
}

fn read_moments<R: Read, T: Row + crate::optim::adam::AdamElement>(
    r: &mut R,
    name: &'static str,
    n: usize,
) -> Result<Moments<T>, CheckpointError> {
    let m = read_rows(r, n)?;
    let v = read_rows(r, n)?;
    Ok(Moments::from_parts(name, m, v)?)
}

/// Write a checkpoint bundle.
pub fn write_checkpoint<W: Write>(writer: &mut W, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
    let s = &checkpoint.store;

    writer.write_all(MAGIC)?;
    writer.write_u32::<LittleEndian>(VERSION)?;
    writer.write_u64::<LittleEndian>(checkpoint.iteration as u64)?;
    writer.write_u32::<LittleEndian>(checkpoint.active_sh_degree as u32)?;
    writer.write_u32::<LittleEndian>(checkpoint.max_sh_degree as u32)?;
    writer.write_u32::<LittleEndian>(checkpoint.adam_step)?;
    writer.write_f32::<LittleEndian>(checkpoint.scene_extent)?;
    writer.write_u64::<LittleEndian>(s.positions.len() as u64)?;

    write_rows(writer, &s.positions)?;
    write_rows(writer, &s.rotations)?;
    write_rows(writer, &s.log_scales)?;
    write_rows(writer, &s.opacity_logits)?;
    write_rows(writer, &s.sh_coeffs)?;
    write_rows(writer, &s.max_screen_radius)?;
    write_rows(writer, &s.grad_norm_sum)?;
    write_rows(writer, &s.observation_counts)?;

    write_moments(writer, &s.moments.position)?;
    write_moments(writer, &s.moments.rotation)?;
    write_moments(writer, &s.moments.log_scale)?;
    write_moments(writer, &s.moments.opacity)?;
    write_moments(writer, &s.moments.sh)?;
    writer.flush()?;
    Ok(())
}

/// Read a checkpoint bundle written by [`write_checkpoint`].
pub fn read_checkpoint<R: Read>(reader: &mut R) -> Result<Checkpoint, CheckpointError> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(CheckpointError::InvalidMagic);
    }
    let version = reader.read_u32::<LittleEndian>()?;
    if version != VERSION {
        return Err(CheckpointError::UnsupportedVersion(version));
    }

    let iteration = reader.read_u64::<LittleEndian>()? as usize;
    let active_sh_degree = reader.read_u32::<LittleEndian>()? as usize;
    let max_sh_degree = reader.read_u32::<LittleEndian>()? as usize;
    let adam_step = reader.read_u32::<LittleEndian>()?;
    let scene_extent = reader.read_f32::<LittleEndian>()?;
    let n = reader.read_u64::<LittleEndian>()? as usize;

    let positions = read_rows(reader, n)?;
    let rotations = read_rows(reader, n)?;
    let log_scales = read_rows(reader, n)?;
    let opacity_logits = read_rows(reader, n)?;
    let sh_coeffs = read_rows(reader, n)?;
    let max_screen_radius = read_rows(reader, n)?;
    let grad_norm_sum = read_rows(reader, n)?;
    let observation_counts = read_rows(reader, n)?;

    let moments = ParamMoments {
        position: read_moments(reader, "moments.position", n)?,
        rotation: read_moments(reader, "moments.rotation", n)?,
        log_scale: read_moments(reader, "moments.log_scale", n)?,
        opacity: read_moments(reader, "moments.opacity", n)?,
        sh: read_moments(reader, "moments.sh", n)?,
    };

    Ok(Checkpoint {
        iteration,
        active_sh_degree,
        max_sh_degree,
        adam_step,
        scene_extent,
        store: StoreSnapshot {
            positions,
            rotations,
            log_scales,
            opacity_logits,
            sh_coeffs,
            max_screen_radius,
            grad_norm_sum,
            observation_counts,
            moments,
        },
    })
}

/// Save a checkpoint to `path`.
pub fn save_checkpoint<P: AsRef<Path>>(path: P, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    write_checkpoint(&mut writer, checkpoint)
}

/// Load a checkpoint from `path`.
pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Checkpoint, CheckpointError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    read_checkpoint(&mut reader)
}
