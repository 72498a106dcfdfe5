use aevolite_core::{NullStats, World, WorldConfig};
use aevolite_storage::{FileCheckpoints, FileStats};
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

fn scratch_dir(label: &str) -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time")
        .as_nanos();
    std::env::temp_dir().join(format!(
        "aevolite-persistence-{label}-{}-{stamp}",
        std::process::id()
    ))
}

#[test]
fn interrupted_run_matches_the_uninterrupted_one() {
    let dir = scratch_dir("resume");
    let config = WorldConfig {
        grid_width: 5,
        grid_height: 4,
        seed: 0xC0FFEE,
        mutation_rate: 2e-4,
        init_length_dna: 400,
        backup_step: 5,
    };

    let checkpoints = FileCheckpoints::new(&dir).expect("checkpoint dir");
    let mut uninterrupted = World::with_sinks(
        config,
        Box::new(checkpoints.clone()),
        Box::new(NullStats),
    )
    .expect("world");
    for _ in 0..10 {
        uninterrupted.step().expect("step");
    }

    let snapshot = checkpoints.load(5).expect("checkpoint at generation 5");
    let mut resumed = World::from_checkpoint(
        snapshot,
        Box::new(checkpoints),
        Box::new(NullStats),
    )
    .expect("resumed world");
    assert_eq!(resumed.generation(), 5);
    for _ in 0..5 {
        resumed.step().expect("step");
    }

    let final_a: Vec<f64> = uninterrupted
        .organisms()
        .iter()
        .map(|o| o.fitness())
        .collect();
    let final_b: Vec<f64> = resumed.organisms().iter().map(|o| o.fitness()).collect();
    assert_eq!(final_a, final_b);
    assert_eq!(uninterrupted.best().fitness(), resumed.best().fitness());

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn full_sinks_drive_a_run_end_to_end() {
    let backup_dir = scratch_dir("e2e-backup");
    let stats_dir = scratch_dir("e2e-stats");
    let config = WorldConfig {
        grid_width: 4,
        grid_height: 4,
        seed: 7,
        mutation_rate: 1e-3,
        init_length_dna: 300,
        backup_step: 3,
    };

    let checkpoints = FileCheckpoints::new(&backup_dir).expect("checkpoint dir");
    let stats = FileStats::create(&stats_dir).expect("stats dir");
    let mut world =
        World::with_sinks(config, Box::new(checkpoints.clone()), Box::new(stats)).expect("world");
    let summary = world.run(6).expect("run");
    assert_eq!(summary.generation, 6);
    drop(world);

    assert!(backup_dir.join("backup_3.az").exists());
    assert!(backup_dir.join("backup_6.az").exists());
    let reloaded = checkpoints.load(6).expect("final checkpoint");
    assert_eq!(reloaded.generation, 6);
    assert_eq!(reloaded.genomes.len(), 16);

    let best = fs::read_to_string(stats_dir.join("stats_best.txt")).expect("best file");
    assert_eq!(best.lines().count(), 7, "header plus six generations");

    let _ = fs::remove_dir_all(backup_dir);
    let _ = fs::remove_dir_all(stats_dir);
}
