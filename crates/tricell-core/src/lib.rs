//! Core types and the deterministic simulation engine for tricell.
//!
//! Three species (fire, water, grass) live on a rectangular grid and interact
//! along a fixed rock-paper-scissors cycle: water beats fire, fire beats
//! grass, grass beats water. Every magnitude is an integer in tenths; the
//! tick transition never touches floating point, so two processes running the
//! same seed and config produce bit-identical states. The 24-bit `digest` of
//! a state is the parity oracle alternate compiled backends are checked
//! against.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use thiserror::Error;

/// Cell type id for an empty cell.
pub const EMPTY: u8 = 0;
/// Cell type id for fire.
pub const FIRE: u8 = 1;
/// Cell type id for water.
pub const WATER: u8 = 2;
/// Cell type id for grass.
pub const GRASS: u8 = 3;
/// Number of live species.
pub const TYPE_COUNT: usize = 3;
/// Moore neighborhood size; fixed by design, not configurable.
pub const NEIGHBOR_COUNT: usize = 8;

/// Returns whether type `a` beats type `b` under the fixed cycle
/// water→fire→grass→water.
#[must_use]
pub const fn beats(a: u8, b: u8) -> bool {
    matches!((a, b), (WATER, FIRE) | (FIRE, GRASS) | (GRASS, WATER))
}

// ---------------------------------------------------------------------------
// Hashing primitive
//
// Every randomized decision in the system (initial layout, birth tie-breaks,
// placement jitter) and the whole-state digest flow through this one mixing
// function. The constants below are frozen: cross-backend digest parity
// depends on reproducing them exactly.
// ---------------------------------------------------------------------------

/// All hash outputs are masked to 24 bits.
pub const HASH_MASK: u32 = 0x00FF_FFFF;

const HASH_PRIME: u32 = 0x0100_0193;
const HASH_BIAS: u32 = 0x009E_3779;
const SALT_A: u32 = 0x9E37;
const SALT_B: u32 = 0x85EB;
const SALT_C: u32 = 0xC2B2;
/// FNV offset basis folded into 24 bits; seeds the state digest.
const DIGEST_BASIS: u32 = 0x811C_9DC5 & HASH_MASK;

// Lane discriminators for the initializer's independent hash streams.
const STREAM_CELL_TYPE: u32 = 1;
const STREAM_CELL_ROLL: u32 = 2;
const STREAM_BLOCK_TYPE: u32 = 3;
const STREAM_BLOCK_BIAS: u32 = 4;
const STREAM_JITTER_X: u32 = 5;
const STREAM_JITTER_Y: u32 = 6;
const STREAM_TRIAD_TIE: u32 = 7;
const STREAM_BLOCK_X: u32 = 8;
const STREAM_BLOCK_Y: u32 = 9;
const STREAM_ROLE_ROT: u32 = 10;
const STREAM_FALLBACK: u32 = 11;

/// Salt for the birth tie-break stream (fixed by the wire contract).
const BIRTH_TIE_SALT: u32 = 17;

/// One avalanche step: XOR in the input, multiply by an odd prime, add the
/// bias, mask to 24 bits.
#[inline]
const fn mix24(h: u32, x: u32) -> u32 {
    ((h ^ x).wrapping_mul(HASH_PRIME)).wrapping_add(HASH_BIAS) & HASH_MASK
}

/// Deterministic seed-keyed hash of three lanes into a 24-bit value.
///
/// The seed's high bits are folded in first so that seeds differing only
/// above bit 23 still diverge.
#[inline]
#[must_use]
pub const fn hash24(seed: u32, a: u32, b: u32, c: u32) -> u32 {
    let mut h = seed & HASH_MASK;
    h = mix24(h, seed >> 16);
    h = mix24(h, a.wrapping_add(SALT_A));
    h = mix24(h, b.wrapping_add(SALT_B));
    h = mix24(h, c.wrapping_add(SALT_C));
    h
}

/// Selects one of `n` options deterministically. `n` must be non-zero.
#[inline]
#[must_use]
pub const fn hash_choice(seed: u32, a: u32, b: u32, c: u32, n: u32) -> u32 {
    hash24(seed, a, b, c) % n
}

/// Placement-code spelling of [`hash_choice`]; same operation, kept under
/// both names because callers grew up with both.
#[inline]
#[must_use]
pub const fn hash_u24_mod(seed: u32, a: u32, b: u32, c: u32, n: u32) -> u32 {
    hash_choice(seed, a, b, c, n)
}

/// 24-bit fingerprint of a full state: every type, then every energy value,
/// then every age, folded through [`mix24`] in array order.
#[must_use]
pub fn digest24(state: &SimState) -> u32 {
    let mut h = DIGEST_BASIS;
    for &t in &state.types {
        h = mix24(h, t as u32);
    }
    for &e in &state.energy10 {
        h = mix24(h, e);
    }
    for &a in &state.age {
        h = mix24(h, a);
    }
    h
}

/// Renders a digest as 6 lowercase hex characters.
#[must_use]
pub fn digest_hex(digest: u32) -> String {
    format!("{:06x}", digest & HASH_MASK)
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Placement strategy for the initial grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InitMode {
    /// Independent per-cell type pick and alive roll.
    #[default]
    Random,
    /// 8×8 blocks, each with a dominant type and an alive-ratio bias.
    Clustered,
    /// One compact cluster per type around three fixed anchor points.
    Triad,
    /// Three non-overlapping 3×3 debug blocks, one per type.
    SingleBlock,
}

/// Integer tuning constants, all in tenths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimConstants {
    /// Energy ceiling per cell.
    pub max_energy10: u32,
    /// Energy assigned to cells placed by the initializer.
    pub start_energy10: u32,
    /// Energy assigned to cells born during a tick.
    pub spawn_energy10: u32,
    /// Energy lost per threatening neighbor.
    pub threat_penalty10: u32,
    /// Energy gained per same-type neighbor.
    pub ally_bonus10: u32,
    /// Energy gained per neighbor this cell's type beats.
    pub prey_bonus10: u32,
    /// Informational only. The engine always drains exactly 1 per tick;
    /// this field never enters the transition.
    pub aging_drain10: u32,
}

impl Default for SimConstants {
    fn default() -> Self {
        Self {
            max_energy10: 100,
            start_energy10: 60,
            spawn_energy10: 50,
            threat_penalty10: 4,
            ally_bonus10: 2,
            prey_bonus10: 3,
            aging_drain10: 1,
        }
    }
}

/// Partial constants override accepted on the wire.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SimConstantsInput {
    pub max_energy10: Option<u32>,
    pub start_energy10: Option<u32>,
    pub spawn_energy10: Option<u32>,
    pub threat_penalty10: Option<u32>,
    pub ally_bonus10: Option<u32>,
    pub prey_bonus10: Option<u32>,
    pub aging_drain10: Option<u32>,
}

/// Partial configuration accepted on the wire. Every field is optional;
/// [`SimConfig::from_input`] fills the rest with validated defaults and
/// [`SimConfig::merged`] overlays a patch onto an existing config.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SimConfigInput {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub wrap_world: Option<bool>,
    pub tick_rate_ui: Option<u32>,
    pub chunk_ticks: Option<u32>,
    pub seed: Option<u64>,
    pub init_mode: Option<InitMode>,
    pub alive_ratio: Option<f64>,
    pub repro_threshold: Option<u32>,
    pub constants: Option<SimConstantsInput>,
}

/// Immutable per-run parameters. Produced once by normalization; downstream
/// code never re-validates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimConfig {
    pub width: u32,
    pub height: u32,
    pub wrap_world: bool,
    /// UI frame rate for autoplay, clamped to 1–5.
    pub tick_rate_ui: u32,
    /// Batch size for external chunked drivers, clamped to 1–16. Not read
    /// by the engine or the orchestrator.
    pub chunk_ticks: u32,
    pub seed: u32,
    pub init_mode: InitMode,
    /// Target alive fraction for the initializer, clamped to [0, 1].
    pub alive_ratio: f64,
    /// Same-type neighbor count required for a birth, clamped to 1–8.
    pub repro_threshold: u32,
    pub constants: SimConstants,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::from_input(&SimConfigInput::default())
    }
}

impl SimConfig {
    /// Normalizes a partial input into a complete config, clamping every
    /// field into its documented range.
    #[must_use]
    pub fn from_input(input: &SimConfigInput) -> Self {
        let defaults = Defaults::BASE;
        Self::normalize(&defaults, input)
    }

    /// Re-normalizes this config with a partial override applied on top.
    /// Used by `reset{config?}`: untouched fields keep their current values.
    #[must_use]
    pub fn merged(&self, patch: &SimConfigInput) -> Self {
        let base = Defaults {
            width: self.width,
            height: self.height,
            wrap_world: self.wrap_world,
            tick_rate_ui: self.tick_rate_ui,
            chunk_ticks: self.chunk_ticks,
            seed: self.seed,
            init_mode: self.init_mode,
            alive_ratio: self.alive_ratio,
            repro_threshold: self.repro_threshold,
            constants: self.constants,
        };
        Self::normalize(&base, patch)
    }

    fn normalize(base: &Defaults, input: &SimConfigInput) -> Self {
        let constants_in = input.constants.unwrap_or_default();
        let max_energy10 = constants_in
            .max_energy10
            .unwrap_or(base.constants.max_energy10)
            .clamp(1, 10_000);
        let constants = SimConstants {
            max_energy10,
            // Start/spawn are clamped into [0, max] after the merge so a
            // lowered ceiling drags them down with it.
            start_energy10: constants_in
                .start_energy10
                .unwrap_or(base.constants.start_energy10)
                .min(max_energy10),
            spawn_energy10: constants_in
                .spawn_energy10
                .unwrap_or(base.constants.spawn_energy10)
                .min(max_energy10),
            threat_penalty10: constants_in
                .threat_penalty10
                .unwrap_or(base.constants.threat_penalty10)
                .min(1_000),
            ally_bonus10: constants_in
                .ally_bonus10
                .unwrap_or(base.constants.ally_bonus10)
                .min(1_000),
            prey_bonus10: constants_in
                .prey_bonus10
                .unwrap_or(base.constants.prey_bonus10)
                .min(1_000),
            // Always forced to the fixed system value regardless of input.
            aging_drain10: 1,
        };
        Self {
            width: input.width.unwrap_or(base.width).clamp(1, 1_024),
            height: input.height.unwrap_or(base.height).clamp(1, 1_024),
            wrap_world: input.wrap_world.unwrap_or(base.wrap_world),
            tick_rate_ui: input.tick_rate_ui.unwrap_or(base.tick_rate_ui).clamp(1, 5),
            chunk_ticks: input.chunk_ticks.unwrap_or(base.chunk_ticks).clamp(1, 16),
            seed: input
                .seed
                .unwrap_or(base.seed as u64)
                .clamp(1, u32::MAX as u64) as u32,
            init_mode: input.init_mode.unwrap_or(base.init_mode),
            alive_ratio: input.alive_ratio.unwrap_or(base.alive_ratio).clamp(0.0, 1.0),
            repro_threshold: input
                .repro_threshold
                .unwrap_or(base.repro_threshold)
                .clamp(1, 8),
            constants,
        }
    }

    /// Number of cells in the grid.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Target alive-cell fraction in basis points (0–10_000). This is the
    /// only place the ratio leaves floating point; everything downstream is
    /// integer math.
    #[must_use]
    pub fn alive_ratio_10k(&self) -> u32 {
        (self.alive_ratio * 10_000.0).round() as u32
    }

    /// Autoplay interval in milliseconds: `max(16, round(1000 / rate))`.
    #[must_use]
    pub const fn autoplay_interval_ms(&self) -> u64 {
        let raw = (1_000 + self.tick_rate_ui as u64 / 2) / self.tick_rate_ui as u64;
        if raw < 16 { 16 } else { raw }
    }
}

/// Default values shared by `from_input` and `merged`.
struct Defaults {
    width: u32,
    height: u32,
    wrap_world: bool,
    tick_rate_ui: u32,
    chunk_ticks: u32,
    seed: u32,
    init_mode: InitMode,
    alive_ratio: f64,
    repro_threshold: u32,
    constants: SimConstants,
}

impl Defaults {
    const BASE: Defaults = Defaults {
        width: 64,
        height: 64,
        wrap_world: true,
        tick_rate_ui: 2,
        chunk_ticks: 4,
        seed: 1,
        init_mode: InitMode::Random,
        alive_ratio: 0.18,
        repro_threshold: 3,
        constants: SimConstants {
            max_energy10: 100,
            start_energy10: 60,
            spawn_energy10: 50,
            threat_penalty10: 4,
            ally_bonus10: 2,
            prey_bonus10: 3,
            aging_drain10: 1,
        },
    };
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// A violated state invariant. These indicate a logic bug in the engine,
/// never a recoverable condition; tests fail loudly on them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("state arrays disagree on length")]
    LengthMismatch,
    #[error("cell {idx}: unknown type id {ty}")]
    UnknownType { idx: usize, ty: u8 },
    #[error("cell {idx}: empty cell carries energy or age")]
    EmptyCellResidue { idx: usize },
    #[error("cell {idx}: energy {energy10} exceeds ceiling {max_energy10}")]
    EnergyOverflow { idx: usize, energy10: u32, max_energy10: u32 },
}

/// Structure-of-arrays grid state. Invariant: `types[i] == EMPTY` implies
/// `energy10[i] == 0` and `age[i] == 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimState {
    pub width: u32,
    pub height: u32,
    /// 0 = empty, 1 = fire, 2 = water, 3 = grass.
    pub types: Vec<u8>,
    /// Non-negative integer tenths, ≤ `max_energy10`.
    pub energy10: Vec<u32>,
    /// Ticks survived since birth or placement.
    pub age: Vec<u32>,
}

impl SimState {
    /// An all-empty grid of the configured dimensions.
    #[must_use]
    pub fn empty(width: u32, height: u32) -> Self {
        let size = width as usize * height as usize;
        Self {
            width,
            height,
            types: vec![EMPTY; size],
            energy10: vec![0; size],
            age: vec![0; size],
        }
    }

    /// Number of cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether the grid has zero cells (never true for valid configs).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Number of alive (non-empty) cells.
    #[must_use]
    pub fn alive_count(&self) -> usize {
        self.types.iter().filter(|&&t| t != EMPTY).count()
    }

    /// Verifies the structural invariants against a config's constants.
    pub fn check(&self, constants: &SimConstants) -> Result<(), StateError> {
        let size = self.width as usize * self.height as usize;
        if self.types.len() != size || self.energy10.len() != size || self.age.len() != size {
            return Err(StateError::LengthMismatch);
        }
        for idx in 0..size {
            let ty = self.types[idx];
            if ty > GRASS {
                return Err(StateError::UnknownType { idx, ty });
            }
            if ty == EMPTY && (self.energy10[idx] != 0 || self.age[idx] != 0) {
                return Err(StateError::EmptyCellResidue { idx });
            }
            if self.energy10[idx] > constants.max_energy10 {
                return Err(StateError::EnergyOverflow {
                    idx,
                    energy10: self.energy10[idx],
                    max_energy10: constants.max_energy10,
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Neighbor topology
// ---------------------------------------------------------------------------

/// Moore-neighborhood offsets in the fixed enumeration order
/// NW, N, NE, W, E, SW, S, SE.
const NEIGHBOR_DELTAS: [(i64, i64); NEIGHBOR_COUNT] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// Precomputed neighbor indices, `NEIGHBOR_COUNT` per cell. Lifetime is one
/// config; rebuild whenever width, height, or wrapping change.
#[derive(Debug, Clone)]
pub struct NeighborTable {
    size: usize,
    offsets: Vec<u32>,
}

impl NeighborTable {
    /// Builds the table for a config. With `wrap_world` the grid is toroidal;
    /// without it, out-of-bounds slots fold back to the cell's own index, so
    /// an edge cell counts itself in those directions. That inflation is part
    /// of the parity contract — do not "fix" it.
    #[must_use]
    pub fn build(config: &SimConfig) -> Self {
        let (w, h) = (config.width as i64, config.height as i64);
        let size = config.size();
        let mut offsets = Vec::with_capacity(size * NEIGHBOR_COUNT);
        for y in 0..h {
            for x in 0..w {
                let own = (y * w + x) as u32;
                for (dx, dy) in NEIGHBOR_DELTAS {
                    let (nx, ny) = (x + dx, y + dy);
                    let idx = if config.wrap_world {
                        let wx = nx.rem_euclid(w);
                        let wy = ny.rem_euclid(h);
                        (wy * w + wx) as u32
                    } else if nx >= 0 && nx < w && ny >= 0 && ny < h {
                        (ny * w + nx) as u32
                    } else {
                        own
                    };
                    offsets.push(idx);
                }
            }
        }
        Self { size, offsets }
    }

    /// Neighbor indices of cell `idx` in enumeration order.
    #[inline]
    #[must_use]
    pub fn of(&self, idx: usize) -> &[u32] {
        &self.offsets[idx * NEIGHBOR_COUNT..(idx + 1) * NEIGHBOR_COUNT]
    }

    /// Number of cells covered by this table.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.size
    }

    /// Whether the table covers zero cells.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }
}

// ---------------------------------------------------------------------------
// State initializer
// ---------------------------------------------------------------------------

/// Builds the initial grid for a config. Identical `(seed, width, height,
/// init_mode, alive_ratio, repro_threshold)` always yield byte-identical
/// arrays.
#[must_use]
pub fn initial_state(config: &SimConfig) -> SimState {
    let mut state = SimState::empty(config.width, config.height);
    match config.init_mode {
        InitMode::Random => init_random(config, &mut state),
        InitMode::Clustered => init_clustered(config, &mut state),
        InitMode::Triad => init_triad(config, &mut state),
        InitMode::SingleBlock => init_single_block(config, &mut state),
    }
    state
}

fn place(state: &mut SimState, idx: usize, ty: u8, config: &SimConfig) {
    state.types[idx] = ty;
    state.energy10[idx] = config.constants.start_energy10;
    state.age[idx] = 0;
}

fn init_random(config: &SimConfig, state: &mut SimState) {
    let threshold = config.alive_ratio_10k();
    for idx in 0..config.size() {
        let i = idx as u32;
        let roll = hash_u24_mod(config.seed, i, 0, STREAM_CELL_ROLL, 10_000);
        if roll < threshold {
            let ty = hash_u24_mod(config.seed, i, 0, STREAM_CELL_TYPE, 3) as u8 + 1;
            place(state, idx, ty, config);
        }
    }
}

fn init_clustered(config: &SimConfig, state: &mut SimState) {
    const BLOCK: u32 = 8;
    let base = config.alive_ratio_10k() as u64;
    for y in 0..config.height {
        for x in 0..config.width {
            let (bx, by) = (x / BLOCK, y / BLOCK);
            let dominant =
                hash_u24_mod(config.seed, bx, by, STREAM_BLOCK_TYPE, 3) as u8 + 1;
            // Per-block bias in [6000, 14000] basis points of the base ratio.
            let bias =
                6_000 + hash_u24_mod(config.seed, bx, by, STREAM_BLOCK_BIAS, 8_001) as u64;
            let effective = ((base * bias) / 10_000).min(10_000) as u32;
            let idx = (y * config.width + x) as usize;
            let roll = hash_u24_mod(config.seed, idx as u32, 0, STREAM_CELL_ROLL, 10_000);
            if roll < effective {
                place(state, idx, dominant, config);
            }
        }
    }
}

/// Anchor points for the triad clusters in integer percent of (width, height).
const TRIAD_ANCHORS: [(u32, u32); TYPE_COUNT] = [(22, 24), (78, 24), (50, 76)];

fn init_triad(config: &SimConfig, state: &mut SimState) {
    let (w, h) = (config.width as i64, config.height as i64);
    let size = config.size();
    let total = ((size as u64 * config.alive_ratio_10k() as u64 + 5_000) / 10_000)
        .min(size as u64) as usize;
    let share = total / TYPE_COUNT;
    let remainder = total % TYPE_COUNT;
    let amp = (config.width.min(config.height) / 16) as i64;

    for t in 1..=TYPE_COUNT as u8 {
        let (px, py) = TRIAD_ANCHORS[t as usize - 1];
        let jx = hash_u24_mod(config.seed, t as u32, 0, STREAM_JITTER_X, 2 * amp as u32 + 1)
            as i64
            - amp;
        let jy = hash_u24_mod(config.seed, t as u32, 0, STREAM_JITTER_Y, 2 * amp as u32 + 1)
            as i64
            - amp;
        let cx = ((w * px as i64) / 100 + jx).clamp(0, w - 1);
        let cy = ((h * py as i64) / 100 + jy).clamp(0, h - 1);

        // Earliest types absorb the remainder.
        let budget = share + usize::from((t as usize) <= remainder);

        // Rank every cell by squared distance to the cluster center with a
        // seeded tie-break, then claim the closest unclaimed cells.
        let mut ranked: Vec<(u64, u32, usize)> = (0..size)
            .map(|idx| {
                let x = (idx as i64) % w;
                let y = (idx as i64) / w;
                let (dx, dy) = (x - cx, y - cy);
                let d2 = (dx * dx + dy * dy) as u64;
                let tie = hash24(config.seed, idx as u32, t as u32, STREAM_TRIAD_TIE);
                (d2, tie, idx)
            })
            .collect();
        ranked.sort_unstable();

        let mut claimed = 0;
        for (_, _, idx) in ranked {
            if claimed == budget {
                break;
            }
            if state.types[idx] == EMPTY {
                place(state, idx, t, config);
                claimed += 1;
            }
        }
    }
}

fn init_single_block(config: &SimConfig, state: &mut SimState) {
    const ATTEMPTS_PER_LEVEL: u32 = 12;
    let (w, h) = (config.width, config.height);
    let rot = hash_u24_mod(config.seed, 0, 0, STREAM_ROLE_ROT, 3) as u8;
    let type_for_role = |role: u8| (role + rot) % 3 + 1;

    let mut centers: Option<[(u32, u32); TYPE_COUNT]> = None;
    if w >= 3 && h >= 3 {
        // Seeded candidate centers, retried with progressively smaller
        // minimum-separation thresholds down to zero. Non-overlap of the 3×3
        // blocks (Chebyshev ≥ 3 between centers) is always required.
        let mut sep = w.min(h) / 2;
        'search: loop {
            for attempt in 0..ATTEMPTS_PER_LEVEL {
                let lane = sep * 64 + attempt;
                let mut candidate = [(0u32, 0u32); TYPE_COUNT];
                for role in 0..TYPE_COUNT as u32 {
                    let cx = 1 + hash_u24_mod(config.seed, role, lane, STREAM_BLOCK_X, w - 2);
                    let cy = 1 + hash_u24_mod(config.seed, role, lane, STREAM_BLOCK_Y, h - 2);
                    candidate[role as usize] = (cx, cy);
                }
                if separated(&candidate, 3.max(sep)) {
                    centers = Some(candidate);
                    break 'search;
                }
            }
            if sep == 0 {
                break;
            }
            sep -= 1;
        }

        // Every seeded candidate set failed: deterministic first-fit sweep.
        // Any grid that can hold three disjoint 3×3 blocks gets all of them.
        if centers.is_none() {
            let mut found: Vec<(u32, u32)> = Vec::with_capacity(TYPE_COUNT);
            'sweep: for cy in 1..h - 1 {
                for cx in 1..w - 1 {
                    if found
                        .iter()
                        .all(|&(px, py)| cx.abs_diff(px) >= 3 || cy.abs_diff(py) >= 3)
                    {
                        found.push((cx, cy));
                        if found.len() == TYPE_COUNT {
                            break 'sweep;
                        }
                    }
                }
            }
            if found.len() == TYPE_COUNT {
                centers = Some([found[0], found[1], found[2]]);
            }
        }
    }

    if let Some(centers) = centers {
        for role in 0..TYPE_COUNT as u8 {
            let ty = type_for_role(role);
            let (cx, cy) = centers[role as usize];
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let x = (cx as i64 + dx) as u32;
                    let y = (cy as i64 + dy) as u32;
                    place(state, (y * w + x) as usize, ty, config);
                }
            }
        }
    }

    // Degenerate grids: guarantee at least one cell of each type still
    // missing, claiming hash-chosen empty cells while any remain.
    let size = config.size();
    for t in 1..=TYPE_COUNT as u8 {
        if state.types.iter().any(|&cell| cell == t) {
            continue;
        }
        let start = hash_u24_mod(config.seed, t as u32, 0, STREAM_FALLBACK, size as u32) as usize;
        for step in 0..size {
            let idx = (start + step) % size;
            if state.types[idx] == EMPTY {
                place(state, idx, t, config);
                break;
            }
        }
    }
}

fn separated(centers: &[(u32, u32); TYPE_COUNT], min_chebyshev: u32) -> bool {
    for i in 0..TYPE_COUNT {
        for j in i + 1..TYPE_COUNT {
            let (ax, ay) = centers[i];
            let (bx, by) = centers[j];
            if ax.abs_diff(bx).max(ay.abs_diff(by)) < min_chebyshev {
                return false;
            }
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Tick engine
// ---------------------------------------------------------------------------

/// Alive-cell census after a tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Census {
    pub empty: u32,
    pub fire: u32,
    pub water: u32,
    pub grass: u32,
}

/// Raw result of one application of the transition function.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    /// The resulting state.
    pub state: SimState,
    /// 24-bit digest of the resulting state.
    pub digest: u32,
    /// Cells born this tick.
    pub births: u64,
    /// Cells that died this tick.
    pub deaths: u64,
    pub census: Census,
    /// Mean energy over alive cells, rounded to the nearest integer tenth.
    pub mean_energy10: u32,
    /// Mean age over alive cells, rounded to 2 decimals.
    pub mean_age: f64,
}

#[derive(Clone, Copy)]
struct CellNext {
    ty: u8,
    energy10: u32,
    age: u32,
    born: bool,
    died: bool,
}

/// Applies the transition function once. Pure: output for cell `i` depends
/// only on current-state reads, so the per-cell pass is order-independent
/// and runs in parallel.
#[must_use]
pub fn tick(
    state: &SimState,
    config: &SimConfig,
    topology: &NeighborTable,
    tick_number: u64,
) -> TickOutcome {
    debug_assert_eq!(state.len(), topology.len());
    let size = state.len();
    let consts = &config.constants;

    let cells: Vec<CellNext> = (0..size)
        .into_par_iter()
        .map(|idx| {
            let neighbors = topology.of(idx);
            let own = state.types[idx];
            if own == EMPTY {
                let mut counts = [0u32; TYPE_COUNT];
                for &n in neighbors {
                    let t = state.types[n as usize];
                    if t != EMPTY {
                        counts[t as usize - 1] += 1;
                    }
                }
                let mut best = 0u32;
                let mut leaders: SmallVec<[u8; TYPE_COUNT]> = SmallVec::new();
                for (slot, &count) in counts.iter().enumerate() {
                    if count < config.repro_threshold {
                        continue;
                    }
                    if count > best {
                        best = count;
                        leaders.clear();
                    }
                    if count == best {
                        leaders.push(slot as u8 + 1);
                    }
                }
                match leaders.len() {
                    0 => CellNext { ty: EMPTY, energy10: 0, age: 0, born: false, died: false },
                    1 => CellNext {
                        ty: leaders[0],
                        energy10: consts.spawn_energy10,
                        age: 0,
                        born: true,
                        died: false,
                    },
                    n => {
                        let pick = hash_choice(
                            config.seed,
                            tick_number as u32,
                            idx as u32,
                            BIRTH_TIE_SALT,
                            n as u32,
                        ) as usize;
                        CellNext {
                            ty: leaders[pick],
                            energy10: consts.spawn_energy10,
                            age: 0,
                            born: true,
                            died: false,
                        }
                    }
                }
            } else {
                let mut allies = 0i64;
                let mut threats = 0i64;
                let mut prey = 0i64;
                for &n in neighbors {
                    let t = state.types[n as usize];
                    if t == EMPTY {
                        continue;
                    }
                    if t == own {
                        allies += 1;
                    } else if beats(t, own) {
                        threats += 1;
                    } else if beats(own, t) {
                        prey += 1;
                    }
                }
                // Trailing -1 is the fixed aging drain; the config's nominal
                // aging_drain10 field never enters this expression.
                let delta10 = -(threats * consts.threat_penalty10 as i64)
                    + allies * consts.ally_bonus10 as i64
                    + prey * consts.prey_bonus10 as i64
                    - 1;
                let next = (state.energy10[idx] as i64 + delta10)
                    .clamp(0, consts.max_energy10 as i64);
                if next <= 0 {
                    CellNext { ty: EMPTY, energy10: 0, age: 0, born: false, died: true }
                } else {
                    CellNext {
                        ty: own,
                        energy10: next as u32,
                        age: state.age[idx] + 1,
                        born: false,
                        died: false,
                    }
                }
            }
        })
        .collect();

    let mut next = SimState::empty(state.width, state.height);
    let mut births = 0u64;
    let mut deaths = 0u64;
    let mut counts = [0u32; 4];
    let mut energy_sum = 0u64;
    let mut age_sum = 0u64;
    for (idx, cell) in cells.iter().enumerate() {
        next.types[idx] = cell.ty;
        next.energy10[idx] = cell.energy10;
        next.age[idx] = cell.age;
        births += u64::from(cell.born);
        deaths += u64::from(cell.died);
        counts[cell.ty as usize] += 1;
        if cell.ty != EMPTY {
            energy_sum += cell.energy10 as u64;
            age_sum += cell.age as u64;
        }
    }

    let digest = digest24(&next);
    let census = Census {
        empty: counts[EMPTY as usize],
        fire: counts[FIRE as usize],
        water: counts[WATER as usize],
        grass: counts[GRASS as usize],
    };
    let alive = (census.fire + census.water + census.grass) as u64;
    let (mean_energy10, mean_age) = summarize_means(alive, energy_sum, age_sum);

    TickOutcome {
        state: next,
        digest,
        births,
        deaths,
        census,
        mean_energy10,
        mean_age,
    }
}

/// Integer means over alive cells: energy rounded to the nearest tenth, age
/// computed in hundredths and exposed with exactly 2 decimals.
fn summarize_means(alive: u64, energy_sum: u64, age_sum: u64) -> (u32, f64) {
    if alive == 0 {
        return (0, 0.0);
    }
    let mean_energy10 = ((energy_sum + alive / 2) / alive) as u32;
    let mean_age_100 = (age_sum * 100 + alive / 2) / alive;
    (mean_energy10, mean_age_100 as f64 / 100.0)
}

/// Census + means of an arbitrary state (used for the initial frame, which
/// no tick produced).
#[must_use]
pub fn summarize(state: &SimState) -> (Census, u32, f64) {
    let mut counts = [0u32; 4];
    let mut energy_sum = 0u64;
    let mut age_sum = 0u64;
    for (idx, &ty) in state.types.iter().enumerate() {
        counts[ty as usize] += 1;
        if ty != EMPTY {
            energy_sum += state.energy10[idx] as u64;
            age_sum += state.age[idx] as u64;
        }
    }
    let census = Census {
        empty: counts[EMPTY as usize],
        fire: counts[FIRE as usize],
        water: counts[WATER as usize],
        grass: counts[GRASS as usize],
    };
    let alive = (census.fire + census.water + census.grass) as u64;
    let (mean_energy10, mean_age) = summarize_means(alive, energy_sum, age_sum);
    (census, mean_energy10, mean_age)
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// Per-tick metrics carried on frames. Birth/death counts are cumulative
/// over the run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickMetrics {
    #[serde(flatten)]
    pub census: Census,
    pub births: u64,
    pub deaths: u64,
    pub mean_energy10: u32,
    pub mean_age: f64,
}

/// Digest + metrics for one tick of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    pub digest: String,
    pub metrics: TickMetrics,
}

/// Maximum ticks accepted by a single [`Simulator::step_many`] call.
pub const MAX_STEP_BATCH: u64 = 1_000_000;

/// Stateful holder of one run: current state, a monotonically increasing
/// tick counter, and the neighbor table cached for its fixed config.
pub struct Simulator {
    config: SimConfig,
    topology: NeighborTable,
    state: SimState,
    tick: u64,
    total_births: u64,
    total_deaths: u64,
}

impl fmt::Debug for Simulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulator")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("alive", &self.state.alive_count())
            .finish()
    }
}

impl Simulator {
    /// Builds a simulator at tick 0. Construction with the same config
    /// always starts from the same initial state.
    #[must_use]
    pub fn new(config: SimConfig) -> Self {
        let topology = NeighborTable::build(&config);
        let state = initial_state(&config);
        Self {
            config,
            topology,
            state,
            tick: 0,
            total_births: 0,
            total_deaths: 0,
        }
    }

    /// Applies the transition once and returns the resulting tick report.
    pub fn step(&mut self) -> TickReport {
        let next_tick = self.tick + 1;
        let outcome = tick(&self.state, &self.config, &self.topology, next_tick);
        self.state = outcome.state;
        self.tick = next_tick;
        self.total_births += outcome.births;
        self.total_deaths += outcome.deaths;
        TickReport {
            tick: self.tick,
            digest: digest_hex(outcome.digest),
            metrics: TickMetrics {
                census: outcome.census,
                births: self.total_births,
                deaths: self.total_deaths,
                mean_energy10: outcome.mean_energy10,
                mean_age: outcome.mean_age,
            },
        }
    }

    /// Applies [`step`](Self::step) `n` times sequentially (`n` clamped to
    /// `[1, MAX_STEP_BATCH]`), returning every intermediate report in order.
    pub fn step_many(&mut self, n: u64) -> Vec<TickReport> {
        let n = n.clamp(1, MAX_STEP_BATCH);
        let mut reports = Vec::with_capacity(n.min(4_096) as usize);
        for _ in 0..n {
            reports.push(self.step());
        }
        reports
    }

    /// Report for the current state without advancing. Used for the initial
    /// frame of a run (tick 0) and after resets.
    #[must_use]
    pub fn report(&self) -> TickReport {
        let (census, mean_energy10, mean_age) = summarize(&self.state);
        TickReport {
            tick: self.tick,
            digest: digest_hex(digest24(&self.state)),
            metrics: TickMetrics {
                census,
                births: self.total_births,
                deaths: self.total_deaths,
                mean_energy10,
                mean_age,
            },
        }
    }

    /// Deep copy of the current state; callers may retain or mutate it
    /// freely.
    #[must_use]
    pub fn state(&self) -> SimState {
        self.state.clone()
    }

    /// The run's immutable configuration.
    #[must_use]
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Current tick counter (0 before the first step).
    #[must_use]
    pub const fn tick(&self) -> u64 {
        self.tick
    }
}

// ---------------------------------------------------------------------------
// Session control state machine
// ---------------------------------------------------------------------------

/// Session lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Running,
    Paused,
}

/// The slice of session state the control decision depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub has_run: bool,
    pub phase: Phase,
}

/// A control message, reduced to what the decision table reads.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlVerb {
    Start,
    Pause,
    Resume,
    Reset,
    Step { ticks: Option<f64> },
    Stop,
}

/// The action the orchestrator must take for a control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAction {
    StartNew,
    Resume,
    Pause,
    Reset,
    Step { ticks: u32 },
    Stop,
    Noop,
    Reject { reason: &'static str },
}

/// `max(1, floor(ticks))` with absent or non-finite input normalizing to 1.
#[must_use]
pub fn normalize_ticks(ticks: Option<f64>) -> u32 {
    let Some(raw) = ticks else { return 1 };
    if !raw.is_finite() {
        return 1;
    }
    let floored = raw.floor();
    if floored < 1.0 {
        1
    } else if floored >= u32::MAX as f64 {
        u32::MAX
    } else {
        floored as u32
    }
}

/// Pure decision function over the control table. No side effects; the
/// orchestrator executes whatever this returns.
#[must_use]
pub fn decide(snapshot: SessionSnapshot, verb: &ControlVerb) -> ControlAction {
    if !snapshot.has_run {
        // Phase is meaningless without a run; every phase collapses here.
        return match verb {
            ControlVerb::Start => ControlAction::StartNew,
            ControlVerb::Pause | ControlVerb::Resume | ControlVerb::Stop => ControlAction::Noop,
            ControlVerb::Reset | ControlVerb::Step { .. } => {
                ControlAction::Reject { reason: "no active run" }
            }
        };
    }
    match verb {
        ControlVerb::Start | ControlVerb::Resume => match snapshot.phase {
            Phase::Paused => ControlAction::Resume,
            _ => ControlAction::Noop,
        },
        ControlVerb::Pause => match snapshot.phase {
            Phase::Running => ControlAction::Pause,
            _ => ControlAction::Noop,
        },
        ControlVerb::Reset => ControlAction::Reset,
        ControlVerb::Step { ticks } => ControlAction::Step { ticks: normalize_ticks(*ticks) },
        ControlVerb::Stop => ControlAction::Stop,
    }
}
