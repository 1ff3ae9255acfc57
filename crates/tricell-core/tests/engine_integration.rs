use tricell_core::{
    EMPTY, FIRE, GRASS, InitMode, SimConfig, SimConfigInput, SimConstantsInput, SimState,
    Simulator, WATER, initial_state,
};

fn config(input: SimConfigInput) -> SimConfig {
    SimConfig::from_input(&input)
}

fn digest_sequence(config: &SimConfig, steps: u64) -> Vec<String> {
    let mut sim = Simulator::new(config.clone());
    let mut digests = vec![sim.report().digest];
    for _ in 0..steps {
        digests.push(sim.step().digest);
    }
    digests
}

#[test]
fn independent_simulators_share_every_digest() {
    for mode in [
        InitMode::Random,
        InitMode::Clustered,
        InitMode::Triad,
        InitMode::SingleBlock,
    ] {
        let cfg = config(SimConfigInput {
            width: Some(48),
            height: Some(36),
            seed: Some(0xC0FFEE),
            init_mode: Some(mode),
            alive_ratio: Some(0.25),
            ..SimConfigInput::default()
        });
        assert_eq!(
            digest_sequence(&cfg, 40),
            digest_sequence(&cfg, 40),
            "{mode:?} drifted between instances"
        );
    }
}

#[test]
fn declared_aging_drain_never_reaches_the_digest() {
    let base = SimConfigInput {
        width: Some(40),
        height: Some(40),
        seed: Some(2_024),
        alive_ratio: Some(0.3),
        ..SimConfigInput::default()
    };
    let declared_one = config(SimConfigInput {
        constants: Some(SimConstantsInput {
            aging_drain10: Some(1),
            ..SimConstantsInput::default()
        }),
        ..base.clone()
    });
    let declared_nine = config(SimConfigInput {
        constants: Some(SimConstantsInput {
            aging_drain10: Some(9),
            ..SimConstantsInput::default()
        }),
        ..base
    });
    assert_eq!(
        digest_sequence(&declared_one, 30),
        digest_sequence(&declared_nine, 30)
    );
}

#[test]
fn step_many_equals_repeated_step() {
    let cfg = config(SimConfigInput {
        width: Some(32),
        height: Some(32),
        seed: Some(55),
        ..SimConfigInput::default()
    });

    let mut chunked = Simulator::new(cfg.clone());
    let reports = chunked.step_many(25);

    let mut stepped = Simulator::new(cfg);
    for expected in &reports {
        let got = stepped.step();
        assert_eq!(got.tick, expected.tick);
        assert_eq!(got.digest, expected.digest);
        assert_eq!(got.metrics, expected.metrics);
    }
}

fn bounding_box(state: &SimState, ty: u8) -> Option<(u32, u32, u32, u32)> {
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (idx, &cell) in state.types.iter().enumerate() {
        if cell != ty {
            continue;
        }
        let x = idx as u32 % state.width;
        let y = idx as u32 / state.width;
        bounds = Some(match bounds {
            None => (x, x, y, y),
            Some((x0, x1, y0, y1)) => (x0.min(x), x1.max(x), y0.min(y), y1.max(y)),
        });
    }
    bounds
}

#[test]
fn single_block_places_three_exact_blocks_on_11x11() {
    for seed in [1u64, 77, 4_242] {
        let cfg = config(SimConfigInput {
            width: Some(11),
            height: Some(11),
            seed: Some(seed),
            init_mode: Some(InitMode::SingleBlock),
            ..SimConfigInput::default()
        });
        let state = initial_state(&cfg);

        assert_eq!(state.alive_count(), 27, "seed {seed}");
        for ty in [FIRE, WATER, GRASS] {
            let count = state.types.iter().filter(|&&t| t == ty).count();
            assert_eq!(count, 9, "seed {seed} type {ty}");
            let (x0, x1, y0, y1) = bounding_box(&state, ty).expect("placed type");
            assert_eq!((x1 - x0, y1 - y0), (2, 2), "seed {seed} type {ty}");
        }
        for idx in 0..state.len() {
            if state.types[idx] != EMPTY {
                assert_eq!(state.energy10[idx], cfg.constants.start_energy10);
                assert_eq!(state.age[idx], 0);
            }
        }
    }
}

/// Number of 8-connected components among cells of `ty`.
fn component_count(state: &SimState, ty: u8) -> usize {
    let (w, h) = (state.width as i64, state.height as i64);
    let mut seen = vec![false; state.len()];
    let mut components = 0;
    for start in 0..state.len() {
        if state.types[start] != ty || seen[start] {
            continue;
        }
        components += 1;
        let mut stack = vec![start];
        seen[start] = true;
        while let Some(idx) = stack.pop() {
            let (x, y) = (idx as i64 % w, idx as i64 / w);
            for dy in -1..=1i64 {
                for dx in -1..=1i64 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let (nx, ny) = (x + dx, y + dy);
                    if nx < 0 || nx >= w || ny < 0 || ny >= h {
                        continue;
                    }
                    let n = (ny * w + nx) as usize;
                    if state.types[n] == ty && !seen[n] {
                        seen[n] = true;
                        stack.push(n);
                    }
                }
            }
        }
    }
    components
}

#[test]
fn triad_forms_one_component_per_type() {
    for seed in [3u64, 900, 31_337] {
        let cfg = config(SimConfigInput {
            width: Some(128),
            height: Some(128),
            seed: Some(seed),
            init_mode: Some(InitMode::Triad),
            alive_ratio: Some(0.05),
            ..SimConfigInput::default()
        });
        let state = initial_state(&cfg);

        for ty in [FIRE, WATER, GRASS] {
            assert_eq!(component_count(&state, ty), 1, "seed {seed} type {ty}");
        }
        let alive = state.alive_count();
        assert!(alive > 0);
        assert!(
            state.len() - alive > alive,
            "empty cells must outnumber alive cells"
        );
    }
}

#[test]
fn triad_layout_varies_with_seed() {
    let mk = |seed| {
        config(SimConfigInput {
            width: Some(128),
            height: Some(128),
            seed: Some(seed),
            init_mode: Some(InitMode::Triad),
            alive_ratio: Some(0.05),
            ..SimConfigInput::default()
        })
    };
    let layouts: Vec<SimState> = [5u64, 6, 7, 8].iter().map(|&s| initial_state(&mk(s))).collect();
    // At least one pair must differ; in practice all of them do.
    assert!(
        layouts.windows(2).any(|pair| pair[0] != pair[1]),
        "four consecutive seeds produced identical triad layouts"
    );
}

#[test]
fn invariants_hold_over_a_long_run() {
    let cfg = config(SimConfigInput {
        width: Some(48),
        height: Some(48),
        seed: Some(12_345),
        init_mode: Some(InitMode::Clustered),
        alive_ratio: Some(0.35),
        ..SimConfigInput::default()
    });
    let mut sim = Simulator::new(cfg.clone());
    sim.state().check(&cfg.constants).expect("initial invariants");
    for _ in 0..60 {
        sim.step();
    }
    sim.state().check(&cfg.constants).expect("post-run invariants");
}

#[test]
fn empty_world_stays_empty() {
    let cfg = config(SimConfigInput {
        width: Some(16),
        height: Some(16),
        alive_ratio: Some(0.0),
        ..SimConfigInput::default()
    });
    let mut sim = Simulator::new(cfg);
    assert_eq!(sim.state().alive_count(), 0);
    let report = sim.step();
    assert_eq!(report.metrics.census.empty, 256);
    assert_eq!(report.metrics.births, 0);
    assert_eq!(report.metrics.mean_energy10, 0);
    assert_eq!(report.metrics.mean_age, 0.0);
}
