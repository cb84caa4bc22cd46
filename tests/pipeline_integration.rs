//! Integration tests for the demodulation pipeline
//!
//! These tests drive the engine, the save sink and the topology together
//! without any radio:
//! - Ordered, loss-free delivery to the save sink
//! - Phase continuity across buffers
//! - Window and short-buffer edge cases
//! - Source enumeration across devices

mod common;

use bioview_rs::backend::{
    BlockSink, DemodulationEngine, DemodulationWorker, Reporter, SaveWorker,
};
use bioview_rs::persistence::CsvBlockSink;
use bioview_rs::ChannelTopology;
use common::builders::ExperimentBuilder;
use common::sim_helpers::tone_buffer;
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

const FS: f64 = 1e6;
const IFS: [f64; 2] = [100e3, 125e3];

/// Parsed data rows of a saved CSV file
fn read_rows(path: &std::path::Path) -> Vec<Vec<f64>> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .skip(2)
        .map(|line| line.split(',').map(|v| v.parse::<f64>().unwrap()).collect())
        .collect()
}

#[test]
fn test_error_free_buffers_reach_sink_in_order() {
    let config = ExperimentBuilder::new().device("usrp0", IFS).save_ds(100).build();
    config.validate().unwrap();
    let topology = config.topology();

    let dir = tempdir().unwrap();
    let path = dir.path().join("run.csv");
    let sink = CsvBlockSink::create(&path, &topology, config.output_mode).unwrap();

    let engine = DemodulationEngine::from_experiment(&config, Reporter::detached()).unwrap();
    let (raw_tx, raw_rx) = bounded(8);
    let (save_tx, save_rx) = bounded(256);

    let save = SaveWorker::new(
        Box::new(sink) as Box<dyn BlockSink>,
        save_rx,
        Arc::new(AtomicBool::new(true)),
        Reporter::detached(),
    );
    let save_handle = thread::spawn(move || save.run());

    let demod = DemodulationWorker::new(
        engine,
        vec![raw_rx],
        Arc::new(AtomicBool::new(true)),
        Reporter::detached(),
    )
    .with_save(save_tx);
    let demod_handle = thread::spawn(move || demod.run());

    for i in 0..100 {
        raw_tx
            .send(tone_buffer(0, 2, i * 1000, 1000, &IFS, FS))
            .unwrap();
    }
    // Closing the raw queue ends the engine, which closes the save queue
    drop(raw_tx);

    let engine_stats = demod_handle.join().unwrap();
    let save_stats = save_handle.join().unwrap();

    assert_eq!(engine_stats.blocks_emitted, 100);
    assert_eq!(engine_stats.cycles_skipped, 0);
    assert_eq!(engine_stats.save_dropped, 0);
    assert_eq!(engine_stats.discontinuities, 0);
    assert_eq!(save_stats.written, 100);
    assert_eq!(save_stats.failed, 0);

    let rows = read_rows(&path);
    assert_eq!(rows.len(), 100 * 10);
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row.len(), 2 + topology.len() * 2);
        assert_eq!(row[0] as usize, i / 10, "sequence out of order at row {}", i);
        assert_eq!(row[1] as usize, i % 10);
    }

    // After the filters settle every source sees its own unit tone
    let last = rows.last().unwrap();
    for source in 0..topology.len() {
        let magnitude = last[2 + source * 2];
        assert!(
            (magnitude - 1.0).abs() < 0.1,
            "source {} magnitude {}",
            source,
            magnitude
        );
    }
}

#[test]
fn test_phase_is_continuous_across_buffers() {
    let config = ExperimentBuilder::new().device("usrp0", IFS).save_ds(100).build();
    let mut engine = DemodulationEngine::from_experiment(&config, Reporter::detached()).unwrap();

    // 777 samples per buffer: the trailing 77 are dropped but still advance the oscillator
    let mut phases = Vec::new();
    for i in 0..60 {
        let block = engine
            .process_cycle(&[tone_buffer(0, 2, i * 777, 777, &IFS, FS)])
            .unwrap();
        assert_eq!(block.num_windows(), 7);
        if i >= 20 {
            phases.extend(block.component(0, 1));
        }
    }

    let min = phases.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = phases.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    assert!(max - min < 2.0, "phase drifted by {} degrees", max - min);
    assert_eq!(engine.stats().discontinuities, 0);
}

#[test]
fn test_short_and_partial_buffers() {
    let config = ExperimentBuilder::new().device("usrp0", IFS).save_ds(100).build();
    let mut engine = DemodulationEngine::from_experiment(&config, Reporter::detached()).unwrap();

    let short = engine
        .process_cycle(&[tone_buffer(0, 2, 0, 50, &IFS, FS)])
        .unwrap();
    assert_eq!(short.num_windows(), 0);
    assert_eq!(short.num_sources(), 4);

    let partial = engine
        .process_cycle(&[tone_buffer(0, 2, 50, 250, &IFS, FS)])
        .unwrap();
    assert_eq!(partial.num_windows(), 2);
    assert_eq!(partial.sequence, short.sequence + 1);
}

#[test]
fn test_two_devices_process_in_lock_step() {
    let config = ExperimentBuilder::new()
        .device("usrp0", [100e3, 125e3])
        .device("usrp1", [150e3, 175e3])
        .save_ds(100)
        .build();
    config.validate().unwrap();
    let engine = DemodulationEngine::from_experiment(&config, Reporter::detached()).unwrap();
    assert_eq!(engine.topology().len(), 16);

    let (tx0, rx0) = bounded(8);
    let (tx1, rx1) = bounded(8);
    let (save_tx, save_rx) = bounded(64);
    let running = Arc::new(AtomicBool::new(true));
    let demod = DemodulationWorker::new(engine, vec![rx0, rx1], running.clone(), Reporter::detached())
        .with_save(save_tx);
    let handle = thread::spawn(move || demod.run());

    let all = [100e3, 125e3, 150e3, 175e3];
    // Device 1 runs ahead; the engine still pairs buffers cycle by cycle
    for i in 0..3 {
        tx1.send(tone_buffer(1, 2, i * 500, 500, &all, FS)).unwrap();
    }
    for i in 0..3 {
        tx0.send(tone_buffer(0, 2, i * 500, 500, &all, FS)).unwrap();
    }

    let blocks: Vec<_> = (0..3)
        .map(|_| save_rx.recv_timeout(common::test_timeout()).unwrap())
        .collect();
    running.store(false, Ordering::SeqCst);
    let stats = handle.join().unwrap();

    assert_eq!(blocks.iter().map(|b| b.sequence).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert!(blocks.iter().all(|b| b.num_sources() == 16 && b.num_windows() == 5));
    assert_eq!(stats.blocks_emitted, 3);
}

#[test]
fn test_source_enumeration() {
    // One 2x2 device, every pair kept
    let single = ExperimentBuilder::new().device("usrp0", IFS).build().topology();
    let labels: Vec<&str> = single.iter().map(|s| s.label.as_str()).collect();
    assert_eq!(labels, vec!["Tx1Rx1", "Tx2Rx1", "Tx1Rx2", "Tx2Rx2"]);

    // Two 2x2 devices, balanced, cross pairs allowed between 0 and 1
    let config = ExperimentBuilder::new()
        .device("usrp0", [100e3, 125e3])
        .device("usrp1", [150e3, 175e3])
        .balance(true)
        .pairs(vec![(0, 1)])
        .build();
    let balanced: ChannelTopology = config.topology();
    assert_eq!(balanced.len(), 4);

    let unbalanced = ExperimentBuilder::new()
        .device("usrp0", [100e3, 125e3])
        .device("usrp1", [150e3, 175e3])
        .pairs(vec![(0, 1)])
        .build()
        .topology();
    assert_eq!(unbalanced.len(), 16);
}
