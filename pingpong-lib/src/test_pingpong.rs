use std::{thread, time::Duration};

use crate::{
    BenchConfig, ChannelSummary, Direction, ExecutionModel, LoopbackFabric, LoopbackOptions,
    LoopbackProvider, Measurement, Phase, PingpongError, Reporter, TestMode,
    api::{EndpointAddress, KeyMode},
    repeat_for, run,
};

struct Side {
    address: EndpointAddress,
    summaries: Vec<ChannelSummary>,
    measurements: Vec<Measurement>,
}

impl Side {
    fn phases(&self) -> Vec<Phase> {
        let mut phases: Vec<Phase> = Vec::new();
        for m in &self.measurements {
            if phases.last() != Some(&m.phase) {
                phases.push(m.phase);
            }
        }
        phases
    }

    fn units(&self, phase: Phase) -> Vec<usize> {
        self.measurements.iter().filter(|m| m.phase == phase).map(|m| m.units).collect()
    }
}

struct Pair {
    fabric: LoopbackFabric,
    server: Side,
    client: Side,
    _providers: [LoopbackProvider; 2],
}

fn run_side(provider: &mut LoopbackProvider, config: &BenchConfig) -> Side {
    let mut reporter = Reporter::sink();
    let summaries = run(provider, config, &mut reporter).unwrap();
    Side { address: provider.address(), summaries, measurements: reporter.into_measurements() }
}

/// Opens both endpoints up front, then runs server and client concurrently.
fn run_pair(config: &BenchConfig, options: LoopbackOptions) -> Pair {
    run_pair_staggered(config, options, Duration::ZERO)
}

/// Like [`run_pair`], but the server starts `server_delay` after the client.
fn run_pair_staggered(
    config: &BenchConfig,
    options: LoopbackOptions,
    server_delay: Duration,
) -> Pair {
    let fabric = LoopbackFabric::new();
    let mut server = fabric.open("server", options, None).unwrap();
    let mut client = fabric.open("client", options, Some("server")).unwrap();
    let server_config = BenchConfig { server_name: None, ..config.clone() };
    let client_config = BenchConfig { server_name: Some("server".into()), ..config.clone() };

    let (server_side, client_side) = thread::scope(|s| {
        let client_run = s.spawn(|| run_side(&mut client, &client_config));
        thread::sleep(server_delay);
        let server_run = s.spawn(|| run_side(&mut server, &server_config));
        (server_run.join().unwrap(), client_run.join().unwrap())
    });
    Pair { fabric, server: server_side, client: client_side, _providers: [server, client] }
}

fn config(mode: TestMode, num_channels: usize, min_size: usize, max_size: usize) -> BenchConfig {
    BenchConfig {
        mode,
        num_channels,
        min_size,
        max_size,
        pin_threads: false,
        ..BenchConfig::default()
    }
}

#[test]
fn msg_one_way_reports_every_size() {
    let config = BenchConfig {
        direction: Some(Direction::OneWay),
        ..config(TestMode::Msg, 1, 1, 4)
    };
    let pair = run_pair(&config, LoopbackOptions::default());

    for side in [&pair.client, &pair.server] {
        assert_eq!(side.units(Phase::SendRecv), [1, 2, 4]);
        for m in &side.measurements {
            assert_eq!(m.repeat, 1000);
            assert!(m.latency_us > 0.0, "{m}");
            assert!(m.bandwidth_mbps > 0.0, "{m}");
            assert_eq!(m.aggregate_mbps, m.bandwidth_mbps);
        }
    }
}

#[test]
fn handshake_addresses_are_symmetric() {
    let config = BenchConfig { execution: ExecutionModel::Single, ..config(TestMode::Msg, 4, 1, 8) };
    let pair = run_pair(&config, LoopbackOptions::default());

    assert_eq!(pair.client.summaries.len(), 4);
    assert_eq!(pair.server.summaries.len(), 4);
    for (i, summary) in pair.client.summaries.iter().enumerate() {
        assert_eq!(summary.index, i);
        let peer = summary.peer_addr.unwrap();
        assert_eq!(
            pair.fabric.resolve(&pair.client.address, peer).unwrap(),
            (pair.server.address.clone(), i)
        );
    }
    for (i, summary) in pair.server.summaries.iter().enumerate() {
        let peer = summary.peer_addr.unwrap();
        assert_eq!(
            pair.fabric.resolve(&pair.server.address, peer).unwrap(),
            (pair.client.address.clone(), i)
        );
    }
}

#[test]
fn rma_descriptors_match_peer_registrations() {
    for key_mode in [KeyMode::PerRegistration, KeyMode::Pooled] {
        let config = BenchConfig {
            direction: Some(Direction::Bidirectional),
            execution: ExecutionModel::Single,
            ..config(TestMode::Rma, 4, 1, 64)
        };
        let options = LoopbackOptions { key_mode, ..Default::default() };
        let pair = run_pair(&config, options);

        for (client, server) in pair.client.summaries.iter().zip(&pair.server.summaries) {
            assert_eq!(client.index, server.index);
            assert!(client.local_rma.is_some());
            assert_eq!(client.peer_rma, server.local_rma, "{key_mode:?}");
            assert_eq!(server.peer_rma, client.local_rma, "{key_mode:?}");
        }
        assert_eq!(pair.client.phases(), [Phase::Write, Phase::Read]);
        assert_eq!(pair.server.phases(), [Phase::Write, Phase::Read]);
        assert_eq!(pair.client.units(Phase::Write), [1, 2, 4, 8, 16, 32, 64]);
    }
}

#[test]
fn rma_one_way_server_only_writes() {
    let config = config(TestMode::Rma, 2, 1 << 19, 1 << 20);
    let pair = run_pair(&config, LoopbackOptions::default());

    assert_eq!(pair.client.phases(), [Phase::Write, Phase::Read]);
    assert_eq!(pair.server.phases(), [Phase::Write]);
    let repeats: Vec<_> = pair.client.measurements.iter().map(|m| m.repeat).collect();
    let (small, large) = (repeat_for(1 << 19), repeat_for(1 << 20));
    assert_eq!((small, large), (62, 31));
    assert_eq!(repeats, [small, large, small, large]);
    for m in &pair.client.measurements {
        assert!((m.aggregate_mbps - 2.0 * m.bandwidth_mbps).abs() < 1e-6);
    }
}

#[test]
fn single_context_tagged_bidirectional() {
    let config = BenchConfig {
        execution: ExecutionModel::Single,
        ..config(TestMode::Tagged, 3, 1, 16)
    };
    let pair = run_pair(&config, LoopbackOptions::default());

    assert_eq!(pair.client.units(Phase::SendRecv), [1, 2, 4, 8, 16]);
    assert_eq!(pair.server.units(Phase::SendRecv), [1, 2, 4, 8, 16]);
    assert!(pair.client.summaries.iter().all(|s| s.local_rma.is_none()));
}

#[test]
fn atomic_sweeps_up_to_the_provider_limit() {
    let config = config(TestMode::Atomic, 1, 1, 64);
    let options = LoopbackOptions {
        atomic_write_max: Some(8),
        atomic_read_max: Some(4),
        ..Default::default()
    };
    let pair = run_pair(&config, options);

    assert_eq!(pair.client.units(Phase::AtomicWrite), [1, 2, 4, 8]);
    assert_eq!(pair.client.units(Phase::AtomicRead), [1, 2, 4]);
    assert_eq!(pair.server.phases(), [Phase::AtomicWrite]);
    let eight = pair.client.measurements.iter().find(|m| m.units == 8).unwrap();
    assert_eq!(eight.bytes, 64);
}

#[test]
fn atomic_without_fetch_support_skips_reads() {
    let config = BenchConfig {
        direction: Some(Direction::Bidirectional),
        ..config(TestMode::Atomic, 2, 1, 64)
    };
    let options = LoopbackOptions { atomic_read_max: None, ..Default::default() };
    let pair = run_pair(&config, options);

    assert_eq!(pair.client.phases(), [Phase::AtomicWrite]);
    assert_eq!(pair.server.phases(), [Phase::AtomicWrite]);
}

#[test]
fn backpressure_is_retried() {
    let config = config(TestMode::Msg, 2, 1 << 20, 1 << 20);
    let options = LoopbackOptions { busy_every: Some(3), ..Default::default() };
    let pair = run_pair(&config, options);

    assert_eq!(pair.client.units(Phase::SendRecv), [1 << 20]);
    assert_eq!(pair.client.measurements[0].repeat, repeat_for(1 << 20));
}

#[test]
fn client_may_start_before_server_opens_channels() {
    for execution in [ExecutionModel::Single, ExecutionModel::Multi] {
        let config = BenchConfig { execution, ..config(TestMode::Msg, 2, 1, 4) };
        let delay = Duration::from_millis(200);
        let pair = run_pair_staggered(&config, LoopbackOptions::default(), delay);

        assert_eq!(pair.client.units(Phase::SendRecv), [1, 2, 4]);
        assert_eq!(pair.server.units(Phase::SendRecv), [1, 2, 4]);
        assert_eq!(pair.server.summaries.len(), 2);
    }
}

#[test]
fn missing_server_fails_before_any_wait() {
    let fabric = LoopbackFabric::new();
    let mut client = fabric.open("client", LoopbackOptions::default(), Some("server")).unwrap();
    let config = BenchConfig { server_name: Some("server".into()), ..config(TestMode::Msg, 1, 1, 4) };
    let err = run(&mut client, &config, &mut Reporter::sink()).unwrap_err();
    assert!(matches!(err, PingpongError::Transport { op: "server_address", .. }), "{err}");
}

#[test]
fn invalid_channel_count_is_rejected() {
    let fabric = LoopbackFabric::new();
    let mut server = fabric.open("server", LoopbackOptions::default(), None).unwrap();
    for num_channels in [0, 81] {
        let config = config(TestMode::Msg, num_channels, 1, 4);
        assert!(matches!(
            run(&mut server, &config, &mut Reporter::sink()),
            Err(PingpongError::Config(_))
        ));
    }
}
