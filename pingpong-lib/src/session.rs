use std::thread;

use tracing::{debug, error, info, warn};

use crate::{
    abort::AbortSignal,
    api::{AtomicOp, KeyMode, MSG_TAG, PeerAddr, RmaInfo},
    barrier::{Barrier, BarrierHandle},
    buffer::ChannelBuffers,
    channel::{ATOMIC_ELEM_SIZE, Channel},
    config::{BenchConfig, ExecutionModel, TestMode},
    driver::{AtomicLimits, Driver, Step, test_plan},
    error::{PingpongError, Result},
    handshake::exchange_addresses,
    progress::{ChannelGroup, Dedicated, ProgressDiscipline, SharedProgress},
    provider::{ChannelTransport, Provider},
    report::Reporter,
};

/// What a channel ended up with after the run, for inspection by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSummary {
    pub index: usize,
    pub peer_addr: Option<PeerAddr>,
    pub local_rma: Option<RmaInfo>,
    pub peer_rma: Option<RmaInfo>,
}

impl<T: ChannelTransport> From<&Channel<T>> for ChannelSummary {
    fn from(channel: &Channel<T>) -> Self {
        Self {
            index: channel.index(),
            peer_addr: channel.peer_addr(),
            local_rma: channel.local_rma(),
            peer_rma: channel.peer_rma(),
        }
    }
}

/// Runs one side of the benchmark over `provider`: opens the channels,
/// performs the handshake and executes the test plan in the configured
/// execution model. Measurements go to `reporter`.
pub fn run<Pr: Provider>(
    provider: &mut Pr,
    config: &BenchConfig,
    reporter: &mut Reporter,
) -> Result<Vec<ChannelSummary>> {
    config.validate()?;
    let role = config.role();
    let abort = AbortSignal::new();
    info!(
        provider = %provider.name(),
        mode = ?config.mode,
        ?role,
        channels = config.num_channels,
        bidirectional = config.bidirectional(),
        execution = ?config.execution,
        "starting"
    );

    let channels = open_channels(provider, config, &abort)?;
    let mut setup = ChannelGroup::new(channels, SharedProgress);
    exchange_addresses(provider, &mut setup, role)?;

    let limits = atomic_limits(setup.channel(0), config);
    let plan = test_plan(config, limits);
    let key_mode = provider.key_mode();

    match config.execution {
        ExecutionModel::Single => {
            let mut barrier = Barrier::new(1, abort.clone())?;
            let Some(barrier) = barrier.pop() else {
                return Err(PingpongError::Custom("barrier without handles"));
            };
            let mut driver = Driver::new(barrier, Some(reporter), config.num_channels, key_mode);
            run_context(&mut driver, &mut setup, &plan)?;
            Ok(setup.channels().iter().map(ChannelSummary::from).collect())
        }
        ExecutionModel::Multi => {
            let channels = setup.into_channels();
            let barriers = Barrier::new(channels.len(), abort.clone())?;
            run_threads(channels, barriers, reporter, config, key_mode, &plan, &abort)
        }
    }
}

fn open_channels<Pr: Provider>(
    provider: &mut Pr,
    config: &BenchConfig,
    abort: &AbortSignal,
) -> Result<Vec<Channel<Pr::Transport>>> {
    let capacity = config.buffer_capacity();
    let tag = config.mode.tagged().then_some(MSG_TAG);
    let mut channels = Vec::with_capacity(config.num_channels);
    for index in 0..config.num_channels {
        let buffers = ChannelBuffers::new(index, capacity)?;
        let transport = provider.open_channel(index, &buffers, config.mode.one_sided())?;
        debug!(channel = index, capacity, "channel open");
        channels.push(Channel::new(index, transport, buffers, tag, abort.clone()));
    }
    Ok(channels)
}

/// Atomic sweep bounds from channel 0, clamped to what the buffers hold.
fn atomic_limits<T: ChannelTransport>(channel: &Channel<T>, config: &BenchConfig) -> AtomicLimits {
    if config.mode != TestMode::Atomic {
        return AtomicLimits::default();
    }
    let fits = config.buffer_capacity() / ATOMIC_ELEM_SIZE;
    let limits = AtomicLimits {
        write: channel.atomic_max_count(AtomicOp::Write).map(|n| n.min(fits)),
        fetch_read: channel.atomic_max_count(AtomicOp::Read).map(|n| n.min(fits)),
    };
    debug!(?limits, "atomic limits");
    limits
}

fn run_context<T, P>(
    driver: &mut Driver<'_>,
    group: &mut ChannelGroup<T, P>,
    plan: &[Step],
) -> Result<()>
where
    T: ChannelTransport,
    P: ProgressDiscipline,
{
    driver.run(group, plan)?;
    group.ensure_quiescent()
}

/// Raises the abort signal when the worker holding it unwinds.
struct RaiseOnPanic<'a>(&'a AbortSignal);

impl Drop for RaiseOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.raise();
        }
    }
}

fn run_threads<T: ChannelTransport>(
    channels: Vec<Channel<T>>,
    barriers: Vec<BarrierHandle>,
    reporter: &mut Reporter,
    config: &BenchConfig,
    key_mode: KeyMode,
    plan: &[Step],
    abort: &AbortSignal,
) -> Result<Vec<ChannelSummary>> {
    let num_channels = channels.len();
    let cpus = if config.pin_threads {
        thread_lib::allowed_cpus().unwrap_or_else(|e| {
            warn!(error = %e, "cannot read cpu affinity, not pinning");
            Vec::new()
        })
    } else {
        Vec::new()
    };

    let mut reporter = Some(reporter);
    let results = thread::scope(|s| {
        let mut handles = Vec::with_capacity(num_channels);
        for (channel, barrier) in channels.into_iter().zip(barriers) {
            let index = channel.index();
            let reporter = if index == 0 { reporter.take() } else { None };
            let cpu = thread_lib::cpu_for_slot(&cpus, index);
            let worker_abort = abort.clone();
            let spawned = thread::Builder::new()
                .name(format!("pingpong-ch{index}"))
                .spawn_scoped(s, move || {
                    let _raise_on_panic = RaiseOnPanic(&worker_abort);
                    if let Some(cpu) = cpu {
                        if let Err(e) = thread_lib::pin_cpu(cpu) {
                            warn!(channel = index, cpu, error = %e, "failed to pin thread");
                        }
                    }
                    let mut group = ChannelGroup::new(vec![channel], Dedicated);
                    let mut driver = Driver::new(barrier, reporter, num_channels, key_mode);
                    let result = run_context(&mut driver, &mut group, plan);
                    if let Err(e) = &result {
                        if !matches!(e, PingpongError::Aborted) {
                            error!(channel = index, error = %e, "channel failed");
                        }
                        worker_abort.raise();
                    }
                    result.map(|()| ChannelSummary::from(group.channel(0)))
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!(channel = index, error = %e, "failed to spawn channel thread");
                    abort.raise();
                    break;
                }
            }
        }
        let spawned_all = handles.len() == num_channels;
        let results: Vec<Result<ChannelSummary>> = handles
            .into_iter()
            .map(|h| {
                h.join().unwrap_or_else(|panic| {
                    abort.raise();
                    std::panic::resume_unwind(panic)
                })
            })
            .collect();
        (spawned_all, results)
    });

    let (spawned_all, results) = results;
    let mut summaries = Vec::with_capacity(num_channels);
    let mut first_error = None;
    for result in results {
        match result {
            Ok(summary) => summaries.push(summary),
            Err(PingpongError::Aborted) => {
                first_error.get_or_insert(PingpongError::Aborted);
            }
            Err(e) => {
                if matches!(first_error, None | Some(PingpongError::Aborted)) {
                    first_error = Some(e);
                }
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    if !spawned_all {
        return Err(PingpongError::Custom("failed to spawn channel thread"));
    }
    Ok(summaries)
}
