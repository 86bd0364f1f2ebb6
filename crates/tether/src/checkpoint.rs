// Checkpoint — complete restorable trainer state
//
// TrainerCheckpoint is plain data (serde-serializable) so it can also be
// stored as JSON. The binary format below is the compact on-disk form.
//
// Binary checkpoint format (.tether):
//
//   Header:
//     magic:   [u8; 4]  = b"TTHR"
//     version: u32 LE   = 1
//
//   Section: Current parameters
//     tag: u8 = 0x01
//     count: u32 LE
//     [key_len: u32, key: [u8], ndim: u32, dims: [u32; ndim],
//      n: u64, [f64 LE] × n] × count
//
//   Section: Best parameters (same layout)
//     tag: u8 = 0x04
//
//   Section: Optimizer state
//     tag: u8 = 0x02
//     type_len: u32 LE, type_name: [u8]
//     n_scalars: u32 LE
//     [key_len: u32, key: [u8], value: f64] × n_scalars
//     n_buffers: u32 LE
//     [key_len: u32, key: [u8], buf_len: u64, [f64 LE] × buf_len] × n_buffers
//
//   Section: Metadata
//     tag: u8 = 0x03
//     epoch: u64 LE
//     bad_epochs: u64 LE
//     has_best_epoch: u8, best_epoch: u64 LE
//     has_best_metric: u8, best_metric: f64 LE
//     n_penalties: u32 LE
//     [key_len: u32, key: [u8], weight: f64] × n_penalties
//
//   EOF marker: u8 = 0xFF

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tether_core::{Error, Result};
use tether_optim::OptimizerState;

const MAGIC: &[u8; 4] = b"TTHR";
const VERSION: u32 = 1;
const TAG_PARAMS: u8 = 0x01;
const TAG_OPTIMIZER: u8 = 0x02;
const TAG_METADATA: u8 = 0x03;
const TAG_BEST_PARAMS: u8 = 0x04;
const TAG_EOF: u8 = 0xFF;

/// A named parameter's values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSnapshot {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

/// Everything needed to resume training where it stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerCheckpoint {
    /// The next epoch to run.
    pub epoch: usize,
    pub best_epoch: Option<usize>,
    pub best_metric: Option<f64>,
    /// Consecutive non-improving validations.
    pub bad_epochs: usize,
    /// Current constraint weights, by term name.
    pub penalty_weights: BTreeMap<String, f64>,
    pub params: Vec<ParamSnapshot>,
    pub best_params: Vec<ParamSnapshot>,
    pub optimizer: OptimizerState,
}

// Low-level IO helpers

fn write_u8(w: &mut impl Write, v: u8) -> std::io::Result<()> {
    w.write_all(&[v])
}

fn write_u32(w: &mut impl Write, v: u32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u64(w: &mut impl Write, v: u64) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_f64(w: &mut impl Write, v: f64) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_str(w: &mut impl Write, s: &str) -> std::io::Result<()> {
    write_u32(w, s.len() as u32)?;
    w.write_all(s.as_bytes())
}

fn read_u8(r: &mut impl Read) -> std::io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f64(r: &mut impl Read) -> std::io::Result<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

// Counts come from the file; never reserve more than this up front.
const MAX_PREALLOC: usize = 1 << 16;

fn read_str(r: &mut impl Read) -> std::io::Result<String> {
    let len = read_u32(r)? as u64;
    let mut buf = Vec::with_capacity((len as usize).min(MAX_PREALLOC));
    r.by_ref().take(len).read_to_end(&mut buf)?;
    if buf.len() as u64 != len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "truncated string",
        ));
    }
    String::from_utf8(buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn read_f64s(r: &mut impl Read) -> std::io::Result<Vec<f64>> {
    let n = read_u64(r)?;
    let mut data = Vec::with_capacity((n as usize).min(MAX_PREALLOC));
    for _ in 0..n {
        data.push(read_f64(r)?);
    }
    Ok(data)
}

fn write_f64s(w: &mut impl Write, data: &[f64]) -> std::io::Result<()> {
    write_u64(w, data.len() as u64)?;
    for &v in data {
        write_f64(w, v)?;
    }
    Ok(())
}

// Sections

fn write_params(w: &mut impl Write, tag: u8, params: &[ParamSnapshot]) -> std::io::Result<()> {
    write_u8(w, tag)?;
    write_u32(w, params.len() as u32)?;
    for p in params {
        write_str(w, &p.name)?;
        write_u32(w, p.shape.len() as u32)?;
        for &d in &p.shape {
            write_u32(w, d as u32)?;
        }
        write_f64s(w, &p.data)?;
    }
    Ok(())
}

fn read_params(r: &mut impl Read) -> std::io::Result<Vec<ParamSnapshot>> {
    let count = read_u32(r)? as usize;
    let mut params = Vec::with_capacity(count.min(MAX_PREALLOC));
    for _ in 0..count {
        let name = read_str(r)?;
        let ndim = read_u32(r)? as usize;
        let mut shape = Vec::with_capacity(ndim.min(MAX_PREALLOC));
        for _ in 0..ndim {
            shape.push(read_u32(r)? as usize);
        }
        let data = read_f64s(r)?;
        params.push(ParamSnapshot { name, shape, data });
    }
    Ok(params)
}

fn write_optimizer_state(w: &mut impl Write, state: &OptimizerState) -> std::io::Result<()> {
    write_u8(w, TAG_OPTIMIZER)?;
    write_str(w, &state.optimizer_type)?;

    write_u32(w, state.scalars.len() as u32)?;
    for (key, &value) in &state.scalars {
        write_str(w, key)?;
        write_f64(w, value)?;
    }

    write_u32(w, state.buffers.len() as u32)?;
    for (key, data) in &state.buffers {
        write_str(w, key)?;
        write_f64s(w, data)?;
    }
    Ok(())
}

/// Read an optimizer section (tag already consumed).
fn read_optimizer_state(r: &mut impl Read) -> std::io::Result<OptimizerState> {
    let mut state = OptimizerState::new(read_str(r)?);

    let n_scalars = read_u32(r)? as usize;
    for _ in 0..n_scalars {
        let key = read_str(r)?;
        state.set_scalar(key, read_f64(r)?);
    }

    let n_buffers = read_u32(r)? as usize;
    for _ in 0..n_buffers {
        let key = read_str(r)?;
        state.set_buffer(key, read_f64s(r)?);
    }
    Ok(state)
}

fn write_metadata(w: &mut impl Write, ckpt: &TrainerCheckpoint) -> std::io::Result<()> {
    write_u8(w, TAG_METADATA)?;
    write_u64(w, ckpt.epoch as u64)?;
    write_u64(w, ckpt.bad_epochs as u64)?;
    write_u8(w, ckpt.best_epoch.is_some() as u8)?;
    write_u64(w, ckpt.best_epoch.unwrap_or(0) as u64)?;
    write_u8(w, ckpt.best_metric.is_some() as u8)?;
    write_f64(w, ckpt.best_metric.unwrap_or(0.0))?;
    write_u32(w, ckpt.penalty_weights.len() as u32)?;
    for (name, &weight) in &ckpt.penalty_weights {
        write_str(w, name)?;
        write_f64(w, weight)?;
    }
    Ok(())
}

fn io_err(e: std::io::Error) -> Error {
    Error::msg(format!("checkpoint io error: {e}"))
}

/// Write a checkpoint to `writer`.
pub fn write_checkpoint(writer: &mut impl Write, ckpt: &TrainerCheckpoint) -> Result<()> {
    writer.write_all(MAGIC).map_err(io_err)?;
    write_u32(writer, VERSION).map_err(io_err)?;
    write_params(writer, TAG_PARAMS, &ckpt.params).map_err(io_err)?;
    write_params(writer, TAG_BEST_PARAMS, &ckpt.best_params).map_err(io_err)?;
    write_optimizer_state(writer, &ckpt.optimizer).map_err(io_err)?;
    write_metadata(writer, ckpt).map_err(io_err)?;
    write_u8(writer, TAG_EOF).map_err(io_err)?;
    Ok(())
}

/// Read a checkpoint from `reader`.
pub fn read_checkpoint(reader: &mut impl Read) -> Result<TrainerCheckpoint> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).map_err(io_err)?;
    if &magic != MAGIC {
        return Err(Error::msg(format!(
            "invalid checkpoint: expected magic {MAGIC:?}, got {magic:?}"
        )));
    }
    let version = read_u32(reader).map_err(io_err)?;
    if version != VERSION {
        return Err(Error::msg(format!(
            "unsupported checkpoint version {version} (expected {VERSION})"
        )));
    }

    let mut params = Vec::new();
    let mut best_params = Vec::new();
    let mut optimizer = None;
    let mut epoch = 0;
    let mut bad_epochs = 0;
    let mut best_epoch = None;
    let mut best_metric = None;
    let mut penalty_weights = BTreeMap::new();

    loop {
        let tag = read_u8(reader).map_err(io_err)?;
        match tag {
            TAG_PARAMS => params = read_params(reader).map_err(io_err)?,
            TAG_BEST_PARAMS => best_params = read_params(reader).map_err(io_err)?,
            TAG_OPTIMIZER => optimizer = Some(read_optimizer_state(reader).map_err(io_err)?),
            TAG_METADATA => {
                epoch = read_u64(reader).map_err(io_err)? as usize;
                bad_epochs = read_u64(reader).map_err(io_err)? as usize;
                let has_best_epoch = read_u8(reader).map_err(io_err)? != 0;
                let be = read_u64(reader).map_err(io_err)? as usize;
                best_epoch = has_best_epoch.then_some(be);
                let has_best_metric = read_u8(reader).map_err(io_err)? != 0;
                let bm = read_f64(reader).map_err(io_err)?;
                best_metric = has_best_metric.then_some(bm);
                let n = read_u32(reader).map_err(io_err)? as usize;
                for _ in 0..n {
                    let name = read_str(reader).map_err(io_err)?;
                    penalty_weights.insert(name, read_f64(reader).map_err(io_err)?);
                }
            }
            TAG_EOF => break,
            other => {
                return Err(Error::msg(format!(
                    "invalid checkpoint: unknown section tag 0x{other:02X}"
                )))
            }
        }
    }

    let optimizer =
        optimizer.ok_or_else(|| Error::msg("invalid checkpoint: missing optimizer section"))?;
    Ok(TrainerCheckpoint {
        epoch,
        best_epoch,
        best_metric,
        bad_epochs,
        penalty_weights,
        params,
        best_params,
        optimizer,
    })
}

/// Save a checkpoint to a file.
pub fn save(path: impl AsRef<Path>, ckpt: &TrainerCheckpoint) -> Result<()> {
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    write_checkpoint(&mut writer, ckpt)?;
    writer.flush()?;
    Ok(())
}

/// Load a checkpoint from a file.
pub fn load(path: impl AsRef<Path>) -> Result<TrainerCheckpoint> {
    let file = File::open(path.as_ref())?;
    read_checkpoint(&mut BufReader::new(file))
}

// In-memory checkpoint

pub fn to_bytes(ckpt: &TrainerCheckpoint) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_checkpoint(&mut buf, ckpt)?;
    Ok(buf)
}

pub fn from_bytes(data: &[u8]) -> Result<TrainerCheckpoint> {
    let mut cursor = std::io::Cursor::new(data);
    read_checkpoint(&mut cursor)
}
