// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used)]

use batchkit_core::SinkMessage;
use batchkit_runner::config::Config;
use batchkit_runner::sim;
use std::time::Duration;

fn small_config(streams: usize, max_parallel_streams: usize) -> Config {
    let mut config = Config::default();
    config.engine.max_parallel_streams = max_parallel_streams;
    config.engine.gate_poll_interval_ms = 10;
    config.engine.slot_backoff_ms = 10;
    config.simulation.streams = streams;
    config.simulation.frames_per_stream = 3;
    config.simulation.objects_per_frame = 2;
    config.simulation.rounds = 1;
    config.simulation.batch_interval_ms = 1;
    config
}

fn parse_lines(out: &[u8]) -> Vec<SinkMessage> {
    std::str::from_utf8(out)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn test_simulation_runs_more_streams_than_slots() {
    let config = small_config(3, 2);
    let mut out = Vec::new();
    let summary = tokio::time::timeout(
        Duration::from_secs(10),
        sim::run(&config, std::future::pending(), &mut out),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(summary.streams_admitted, 3);
    assert_eq!(summary.records, 9);
    assert_eq!(summary.end_of_streams, 3);
    assert_eq!(summary.stats.orphan_frames, 0);

    let messages = parse_lines(&out);
    assert_eq!(messages.len(), 12);
    let objects: usize = messages
        .iter()
        .filter_map(|m| match m {
            SinkMessage::Frame(record) => Some(record.objects.len()),
            SinkMessage::EndOfStream { .. } => None,
        })
        .sum();
    assert_eq!(objects, 18);
}

#[tokio::test]
async fn test_simulation_reattaches_stream_ids() {
    let mut config = small_config(2, 2);
    config.simulation.rounds = 2;
    let mut out = Vec::new();
    let summary = tokio::time::timeout(
        Duration::from_secs(10),
        sim::run(&config, std::future::pending(), &mut out),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(summary.streams_admitted, 4);
    assert_eq!(summary.records, 12);
    assert_eq!(summary.end_of_streams, 4);
    let ended: Vec<String> = parse_lines(&out)
        .into_iter()
        .filter_map(|m| match m {
            SinkMessage::EndOfStream { stream_id } => Some(stream_id.to_string()),
            SinkMessage::Frame(_) => None,
        })
        .collect();
    assert_eq!(ended.iter().filter(|id| *id == "stream-0").count(), 2);
}

#[tokio::test]
async fn test_simulation_stops_on_shutdown() {
    let mut config = small_config(2, 2);
    config.simulation.frames_per_stream = u64::MAX;
    let mut out = Vec::new();
    let summary = sim::run(&config, tokio::time::sleep(Duration::from_millis(50)), &mut out)
        .await
        .unwrap();
    assert_eq!(summary.streams_admitted, 2);
    assert!(summary.records > 0);
    // Streams cut short by shutdown are drained without an end-of-stream record.
    assert_eq!(summary.end_of_streams, 0);
    assert_eq!(parse_lines(&out).len() as u64, summary.records);
}
