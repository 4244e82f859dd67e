use std::time::Instant;

use tracing::debug;

use crate::{
    api::KeyMode,
    barrier::BarrierHandle,
    channel::ATOMIC_ELEM_SIZE,
    config::{BenchConfig, Role, TestMode},
    error::Result,
    handshake::exchange_rma,
    policy::{
        AtomicKind, AtomicPolicy, MessagePolicy, RmaOp, RmaPolicy, UnitOfWork, Workload,
    },
    progress::{ChannelGroup, ProgressDiscipline},
    provider::ChannelTransport,
    report::{Measurement, Reporter},
    sweep::SizeSweep,
};

/// Largest atomic element counts both sides sweep up to; `None` skips the
/// phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AtomicLimits {
    pub write: Option<usize>,
    pub fetch_read: Option<usize>,
}

#[derive(Debug, Clone)]
pub enum Step {
    /// Per-channel exchange of remote buffer descriptors.
    ExchangeRma,
    Synchronize,
    Sweep { workload: Workload, sweep: SizeSweep },
}

/// Ordered steps every execution context runs for `config`.
pub fn test_plan(config: &BenchConfig, limits: AtomicLimits) -> Vec<Step> {
    let role = config.role();
    let bidirectional = config.bidirectional();
    let bytes = || SizeSweep::bytes(config.min_size, config.max_size);
    let reads = role == Role::Client || bidirectional;

    match config.mode {
        TestMode::Msg | TestMode::Tagged => vec![Step::Sweep {
            workload: Workload::Message(MessagePolicy { role, bidirectional }),
            sweep: bytes(),
        }],
        TestMode::Rma => {
            let mut plan = vec![
                Step::ExchangeRma,
                Step::Synchronize,
                Step::Sweep {
                    workload: Workload::Rma(RmaPolicy { op: RmaOp::Write, role, bidirectional }),
                    sweep: bytes(),
                },
                Step::Synchronize,
            ];
            if reads {
                plan.push(Step::Sweep {
                    workload: Workload::Rma(RmaPolicy { op: RmaOp::Read, role, bidirectional }),
                    sweep: bytes(),
                });
            }
            plan.push(Step::Synchronize);
            plan
        }
        TestMode::Atomic => {
            let mut plan = vec![Step::ExchangeRma, Step::Synchronize];
            if let Some(max_count) = limits.write {
                plan.push(Step::Sweep {
                    workload: Workload::Atomic(AtomicPolicy {
                        kind: AtomicKind::Write,
                        role,
                        bidirectional,
                    }),
                    sweep: SizeSweep::elements(max_count, ATOMIC_ELEM_SIZE),
                });
            }
            plan.push(Step::Synchronize);
            if let Some(max_count) = limits.fetch_read.filter(|_| reads) {
                plan.push(Step::Sweep {
                    workload: Workload::Atomic(AtomicPolicy {
                        kind: AtomicKind::FetchRead,
                        role,
                        bidirectional,
                    }),
                    sweep: SizeSweep::elements(max_count, ATOMIC_ELEM_SIZE),
                });
            }
            plan.push(Step::Synchronize);
            plan
        }
    }
}

/// Runs the plan for one execution context. The context owning channel 0
/// holds the reporter and takes the timestamps.
pub struct Driver<'r> {
    barrier: BarrierHandle,
    reporter: Option<&'r mut Reporter>,
    num_channels: usize,
    key_mode: KeyMode,
}

impl<'r> Driver<'r> {
    pub fn new(
        barrier: BarrierHandle,
        reporter: Option<&'r mut Reporter>,
        num_channels: usize,
        key_mode: KeyMode,
    ) -> Self {
        Self { barrier, reporter, num_channels, key_mode }
    }

    pub fn run<T, P>(&mut self, group: &mut ChannelGroup<T, P>, plan: &[Step]) -> Result<()>
    where
        T: ChannelTransport,
        P: ProgressDiscipline,
    {
        for step in plan {
            match step {
                Step::ExchangeRma => {
                    for pos in 0..group.len() {
                        exchange_rma(group, pos, self.key_mode)?;
                    }
                }
                Step::Synchronize => group.synchronize()?,
                Step::Sweep { workload, sweep } => self.sweep(group, workload, sweep.clone())?,
            }
        }
        Ok(())
    }

    pub fn sweep<T, P, W>(
        &mut self,
        group: &mut ChannelGroup<T, P>,
        policy: &W,
        sweep: SizeSweep,
    ) -> Result<()>
    where
        T: ChannelTransport,
        P: ProgressDiscipline,
        W: UnitOfWork,
    {
        for point in sweep {
            let start = self.reporter.is_some().then(Instant::now);
            self.barrier.wait()?;
            for _ in 0..point.repeat {
                policy.iterate(group, point.units)?;
            }
            policy.finish(group, point.units)?;
            self.barrier.wait()?;

            if let (Some(start), Some(reporter)) = (start, self.reporter.as_deref_mut()) {
                let measurement = Measurement::new(
                    policy.phase(),
                    point,
                    start.elapsed(),
                    policy.direction_factor(),
                    self.num_channels,
                );
                reporter.record(measurement)?;
            } else {
                debug!(phase = ?policy.phase(), units = point.units, "sweep point done");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Direction;

    fn phases(plan: &[Step]) -> Vec<String> {
        plan.iter()
            .map(|step| match step {
                Step::ExchangeRma => "exchange".to_string(),
                Step::Synchronize => "sync".to_string(),
                Step::Sweep { workload, .. } => workload.phase().label().trim().to_string(),
            })
            .collect()
    }

    #[test]
    fn rma_server_skips_reads_one_way() {
        let mut config = BenchConfig { mode: TestMode::Rma, ..BenchConfig::default() };
        assert_eq!(
            phases(&test_plan(&config, AtomicLimits::default())),
            ["exchange", "sync", "write", "sync", "sync"]
        );
        config.direction = Some(Direction::Bidirectional);
        assert_eq!(
            phases(&test_plan(&config, AtomicLimits::default())),
            ["exchange", "sync", "write", "sync", "read", "sync"]
        );
    }

    #[test]
    fn atomic_plan_respects_limits() {
        let config = BenchConfig {
            mode: TestMode::Atomic,
            server_name: Some("peer".into()),
            ..BenchConfig::default()
        };
        let limits = AtomicLimits { write: Some(64), fetch_read: None };
        assert_eq!(
            phases(&test_plan(&config, limits)),
            ["exchange", "sync", "atomic write u64x", "sync", "sync"]
        );
    }

    #[test]
    fn message_plan_is_single_sweep() {
        let config = BenchConfig { mode: TestMode::Tagged, ..BenchConfig::default() };
        let plan = test_plan(&config, AtomicLimits::default());
        assert_eq!(phases(&plan), ["send/recv"]);
    }
}
