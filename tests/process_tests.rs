use approx::assert_relative_eq;
use rand::Rng;
use trove_sim::config::{CollateralPriceConfig, RewardTokenConfig, StabilityConfig, TroveConfig};
use trove_sim::processes::{self, SeedStreams, Stream, TroveModel};

// ─── Test 1: Seed streams ───────────────────────────────────────────────

#[test]
fn test_streams_reproducible() {
    let a = SeedStreams::new(42);
    let b = SeedStreams::new(42);
    let mut ra = a.rng(Stream::OpenCount, 3, 0);
    let mut rb = b.rng(Stream::OpenCount, 3, 0);
    let x: Vec<f64> = (0..5).map(|_| ra.gen()).collect();
    let y: Vec<f64> = (0..5).map(|_| rb.gen()).collect();
    assert_eq!(x, y);
}

#[test]
fn test_streams_independent_by_key() {
    let s = SeedStreams::new(42);
    let base: f64 = s.rng(Stream::OpenCount, 3, 0).gen();
    assert_ne!(base, s.rng(Stream::CloseCount, 3, 0).gen::<f64>());
    assert_ne!(base, s.rng(Stream::OpenCount, 4, 0).gen::<f64>());
    assert_ne!(base, s.rng(Stream::OpenCount, 3, 1).gen::<f64>());
    assert_ne!(base, SeedStreams::new(43).rng(Stream::OpenCount, 3, 0).gen::<f64>());
}

// ─── Test 2: Collateral price path ──────────────────────────────────────

#[test]
fn test_price_path_shape() {
    let config = CollateralPriceConfig::default();
    let path = processes::collateral_price_path(&config, 500, &SeedStreams::new(7));
    assert_eq!(path.len(), 501);
    assert_relative_eq!(path[0], config.initial);
    assert!(path.iter().all(|p| *p > 0.0 && p.is_finite()));
    // Volatile path actually moves
    assert!(path.windows(2).any(|w| w[0] != w[1]));
}

#[test]
fn test_price_path_deterministic_drift() {
    let config = CollateralPriceConfig {
        initial: 1000.0,
        drift: 0.01,
        volatility: 0.0,
    };
    let path = processes::collateral_price_path(&config, 10, &SeedStreams::new(1));
    for (i, p) in path.iter().enumerate() {
        assert_relative_eq!(*p, 1000.0 * 1.01_f64.powi(i as i32), max_relative = 1e-12);
    }
}

#[test]
fn test_price_path_same_seed_same_path() {
    let config = CollateralPriceConfig::default();
    let a = processes::collateral_price_path(&config, 100, &SeedStreams::new(9));
    let b = processes::collateral_price_path(&config, 100, &SeedStreams::new(9));
    let c = processes::collateral_price_path(&config, 100, &SeedStreams::new(10));
    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn test_natural_rate_non_negative() {
    let config = StabilityConfig {
        natural_rate_sd: 0.5,
        ..StabilityConfig::default()
    };
    let path = processes::natural_rate_path(&config, 200, &SeedStreams::new(3));
    assert_eq!(path.len(), 201);
    assert!(path.iter().all(|r| *r >= 0.0));

    let flat = StabilityConfig {
        natural_rate_sd: 0.0,
        ..StabilityConfig::default()
    };
    let path = processes::natural_rate_path(&flat, 20, &SeedStreams::new(3));
    assert!(path.iter().all(|r| *r == flat.natural_rate_initial));
}

// ─── Test 3: Trove model ────────────────────────────────────────────────

#[test]
fn test_trove_model_respects_minimum_ratio() {
    let config = TroveConfig {
        target_cr_a: 0.5,
        ..TroveConfig::default()
    };
    let model = TroveModel::new(&config, 1.1).unwrap();
    let streams = SeedStreams::new(5);
    for i in 0..200 {
        let draw = model.draw(&streams, 1, i);
        assert!(draw.target_cr >= 1.1);
        assert!(draw.collateral > 0.0);
        assert!(draw.inattention > 0.0);
    }
}

#[test]
fn test_trove_model_draw_keyed_by_account() {
    let model = TroveModel::new(&TroveConfig::default(), 1.1).unwrap();
    let streams = SeedStreams::new(5);
    assert_eq!(model.draw(&streams, 4, 17), model.draw(&streams, 4, 17));
    assert_ne!(model.draw(&streams, 4, 17), model.draw(&streams, 4, 18));
}

#[test]
fn test_trove_model_invalid_parameters() {
    let config = TroveConfig {
        collateral_gamma_k: -1.0,
        ..TroveConfig::default()
    };
    assert!(TroveModel::new(&config, 1.1).is_none());
}

#[test]
fn test_trove_moments() {
    let config = TroveConfig::default();
    let m = processes::trove_moments(&config);
    assert_relative_eq!(m.collateral.mean, 50.0);
    assert_relative_eq!(m.collateral.sd, 10f64.sqrt() * 5.0);
    assert_relative_eq!(m.target_cr.mean, 2.7, max_relative = 1e-12);
    assert_relative_eq!(m.target_cr.sd, 0.1 * 32f64.sqrt(), max_relative = 1e-12);
    assert_relative_eq!(m.inattention.mean, 0.32, max_relative = 1e-12);
    assert_relative_eq!(m.inattention.sd, 0.16, max_relative = 1e-12);

    // Sample means sit close to the analytic ones
    let model = TroveModel::new(&config, 1.1).unwrap();
    let streams = SeedStreams::new(9);
    let n = 4000;
    let draws: Vec<_> = (0..n).map(|i| model.draw(&streams, 1, i)).collect();
    let mean = |f: fn(&processes::TroveDraw) -> f64| draws.iter().map(f).sum::<f64>() / n as f64;
    assert_relative_eq!(mean(|d| d.collateral), m.collateral.mean, max_relative = 0.05);
    assert_relative_eq!(mean(|d| d.target_cr), m.target_cr.mean, max_relative = 0.05);
    assert_relative_eq!(mean(|d| d.inattention), m.inattention.mean, max_relative = 0.05);
}

// ─── Test 4: Arrival and exit counts ────────────────────────────────────

#[test]
fn test_open_count_first_period_uses_initial() {
    let config = TroveConfig::default();
    let streams = SeedStreams::new(1);
    assert_eq!(processes::open_count(&config, &streams, 1, 1.0, 0.005, 100), 10);
    // Capped by the accounts available
    assert_eq!(processes::open_count(&config, &streams, 1, 1.0, 0.005, 4), 4);
}

#[test]
fn test_open_count_rises_with_premium() {
    let config = TroveConfig {
        open_sd: 0.0,
        ..TroveConfig::default()
    };
    let streams = SeedStreams::new(1);
    let at_peg = processes::open_count(&config, &streams, 50, 1.0, 0.005, 1000);
    let premium = processes::open_count(&config, &streams, 50, 1.05, 0.005, 1000);
    assert_eq!(at_peg, 1);
    // 4.5 points above 1 + fee adds 4.5 troves
    assert_eq!(premium, 6);
}

#[test]
fn test_close_count_during_warmup_is_small() {
    let config = TroveConfig::default();
    let streams = SeedStreams::new(1);
    for period in 1..=100 {
        assert!(processes::close_count(&config, &streams, period, 1.0, 50) <= 1);
    }
}

#[test]
fn test_close_count_rises_below_peg() {
    let config = TroveConfig {
        close_sd: 0.0,
        close_warmup_periods: 0,
        close_base: 1.0,
        ..TroveConfig::default()
    };
    let streams = SeedStreams::new(1);
    assert_eq!(processes::close_count(&config, &streams, 10, 1.0, 100), 1);
    assert_eq!(processes::close_count(&config, &streams, 10, 0.97, 100), 4);
    assert_eq!(processes::close_count(&config, &streams, 10, 0.97, 2), 2);
}

// ─── Test 5: Selection and coin flips ───────────────────────────────────

#[test]
fn test_choose_distinct_subset() {
    let items: Vec<u32> = (0..50).collect();
    let streams = SeedStreams::new(11);
    let picked = processes::choose(&items, 10, &streams, Stream::OpenSelection, 3);
    assert_eq!(picked.len(), 10);
    let mut unique = picked.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 10);
    assert!(picked.iter().all(|p| items.contains(p)));

    assert_eq!(picked, processes::choose(&items, 10, &streams, Stream::OpenSelection, 3));
    assert_eq!(processes::choose(&items, 80, &streams, Stream::OpenSelection, 3).len(), 50);
    assert!(processes::choose(&items, 0, &streams, Stream::OpenSelection, 3).is_empty());
}

#[test]
fn test_attention_extremes() {
    let streams = SeedStreams::new(2);
    for account in 0..50 {
        assert!(!processes::is_attentive(0.0, &streams, 1, account));
        assert!(processes::is_attentive(1.0, &streams, 1, account));
    }
}

#[test]
fn test_coin_flip_mixes() {
    let streams = SeedStreams::new(2);
    let heads = (0..200).filter(|a| processes::coin_flip(&streams, 1, *a)).count();
    assert!(heads > 50 && heads < 150, "heads = {}", heads);
}

#[test]
fn test_zero_sd_shock_is_zero() {
    let streams = SeedStreams::new(2);
    assert_eq!(processes::normal_shock(0.0, &streams, Stream::LiquidityShock, 5), 0.0);
}

// ─── Test 6: Reward-token walk ──────────────────────────────────────────

#[test]
fn test_reward_walk_drift_only() {
    let config = RewardTokenConfig {
        volatility: 0.0,
        drift: 0.01,
        ..RewardTokenConfig::default()
    };
    let next = processes::reward_walk_step(&config, 2.0, &SeedStreams::new(1), 1);
    assert_relative_eq!(next, 2.02);
}

#[test]
fn test_reward_walk_stays_positive() {
    let config = RewardTokenConfig {
        volatility: 2.0,
        ..RewardTokenConfig::default()
    };
    let streams = SeedStreams::new(1);
    let mut price = 1.0;
    for period in 1..500 {
        price = processes::reward_walk_step(&config, price, &streams, period);
        assert!(price > 0.0);
    }
}
