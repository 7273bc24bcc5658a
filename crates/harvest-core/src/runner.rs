use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::{CircuitBreakerStats, EndpointCircuitBreaker};
use crate::error::AppError;
use crate::models::SchedulerStatus;
use crate::scheduler::{RateLimitedScheduler, TickOutcome, TriggerOutcome};
use crate::traits::{ComputePipeline, MarketDataFetcher, RecordStore, StateStore};

/// Events emitted by the runner for monitoring/logging.
#[derive(Debug, Clone)]
pub enum SchedulerEvent<'a> {
    Started,
    Recovered {
        status: &'a SchedulerStatus,
    },
    Ticked {
        outcome: &'a TickOutcome,
    },
    TickFailed {
        error: &'a AppError,
    },
    Triggered {
        outcome: &'a Result<TriggerOutcome, AppError>,
    },
    Reset {
        status: &'a SchedulerStatus,
    },
    /// Shutdown arrived while a step was running.
    StepAbandoned,
    ShuttingDown {
        status: &'a SchedulerStatus,
    },
    Stopped,
}

/// Trait for receiving scheduler events (decoupled logging).
pub trait SchedulerReporter: Send + Sync {
    fn report(&self, event: SchedulerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSchedulerReporter;

impl SchedulerReporter for TracingSchedulerReporter {
    fn report(&self, event: SchedulerEvent<'_>) {
        match event {
            SchedulerEvent::Started => {
                tracing::info!("Scheduler runner started");
            }
            SchedulerEvent::Recovered { status } => {
                tracing::info!(
                    state = %status.current_state,
                    consecutive_failures = status.consecutive_failures,
                    "Scheduler ready"
                );
            }
            SchedulerEvent::Ticked { outcome } => match outcome {
                TickOutcome::NotDue { next_collection_ts } => {
                    tracing::trace!(%next_collection_ts, "Not due");
                }
                TickOutcome::BackingOff { until } => {
                    tracing::debug!(%until, "Backing off");
                }
                TickOutcome::Deferred { reason, until } => {
                    tracing::info!(%reason, %until, "Collection deferred");
                }
                TickOutcome::Collected(report) => {
                    tracing::debug!(
                        tickers_ok = report.tickers_ok,
                        api_calls = report.api_calls,
                        "Tick collected"
                    );
                }
                TickOutcome::Failed { error, state } => {
                    tracing::warn!(%error, %state, "Tick failed");
                }
                TickOutcome::Halted => {
                    tracing::debug!("Scheduler halted in ERROR");
                }
            },
            SchedulerEvent::TickFailed { error } => {
                tracing::error!(%error, "Tick could not persist scheduler state");
            }
            SchedulerEvent::Triggered { outcome } => match outcome {
                Ok(outcome) => tracing::info!(?outcome, "Manual trigger handled"),
                Err(error) => tracing::error!(%error, "Manual trigger failed"),
            },
            SchedulerEvent::Reset { status } => {
                tracing::info!(state = %status.current_state, "Scheduler reset");
            }
            SchedulerEvent::StepAbandoned => {
                tracing::warn!("Shutdown requested mid-step, abandoning current step");
            }
            SchedulerEvent::ShuttingDown { status } => {
                tracing::info!(state = %status.current_state, "Scheduler shutting down");
            }
            SchedulerEvent::Stopped => {
                tracing::info!("Scheduler runner stopped");
            }
        }
    }
}

enum Command {
    Trigger(oneshot::Sender<Result<TriggerOutcome, AppError>>),
    Reset(oneshot::Sender<Result<SchedulerStatus, AppError>>),
}

/// Cloneable handle used by operator surfaces to talk to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SchedulerStatus>,
    breaker: EndpointCircuitBreaker,
}

impl SchedulerHandle {
    /// Latest published status. Never blocks on the running cycle.
    pub fn status(&self) -> SchedulerStatus {
        self.status.borrow().clone()
    }

    /// Request an immediate collection and wait for its outcome.
    pub async fn trigger(&self) -> Result<TriggerOutcome, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Trigger(reply)).await?;
        rx.await.map_err(|_| not_running())?
    }

    /// Clear ERROR/WAITING and schedule a collection now.
    pub async fn reset(&self) -> Result<SchedulerStatus, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reset(reply)).await?;
        rx.await.map_err(|_| not_running())?
    }

    pub fn breakers(&self) -> Vec<CircuitBreakerStats> {
        self.breaker.all_stats()
    }

    pub fn breaker(&self, endpoint: &str) -> Option<CircuitBreakerStats> {
        self.breaker.stats(endpoint)
    }

    /// Manually close an endpoint circuit. Returns false for unknown endpoints.
    pub fn reset_breaker(&self, endpoint: &str) -> bool {
        self.breaker.reset(endpoint)
    }

    async fn send(&self, command: Command) -> Result<(), AppError> {
        self.commands.send(command).await.map_err(|_| not_running())
    }
}

fn not_running() -> AppError {
    AppError::InvalidState("scheduler is not running".to_string())
}

/// Owns the scheduler and drives it from ticks, operator commands and
/// cancellation. The only task that ever mutates scheduler state.
pub struct SchedulerRunner<F, P, R, S>
where
    F: MarketDataFetcher,
    P: ComputePipeline,
    R: RecordStore,
    S: StateStore,
{
    scheduler: RateLimitedScheduler<F, P, R, S>,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<SchedulerStatus>,
    tick_interval: Duration,
}

impl<F, P, R, S> SchedulerRunner<F, P, R, S>
where
    F: MarketDataFetcher,
    P: ComputePipeline,
    R: RecordStore,
    S: StateStore,
{
    pub fn new(scheduler: RateLimitedScheduler<F, P, R, S>) -> (Self, SchedulerHandle) {
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(scheduler.status());
        let handle = SchedulerHandle {
            commands: commands_tx,
            status: status_rx,
            breaker: scheduler.breaker().clone(),
        };
        let runner = Self {
            tick_interval: scheduler.config().tick_interval,
            scheduler,
            commands: commands_rx,
            status: status_tx,
        };
        (runner, handle)
    }

    /// Run until cancellation. Recovery failures are fatal; tick failures
    /// are reported and retried on the next tick.
    pub async fn run<RP: SchedulerReporter>(
        mut self,
        cancel_token: CancellationToken,
        reporter: &RP,
    ) -> Result<(), AppError> {
        reporter.report(SchedulerEvent::Started);

        let status = self.scheduler.recover().await?;
        self.publish();
        reporter.report(SchedulerEvent::Recovered { status: &status });

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    let step = tokio::select! {
                        result = self.scheduler.tick() => Some(result),
                        () = cancel_token.cancelled() => None,
                    };
                    match step {
                        Some(Ok(outcome)) => reporter.report(SchedulerEvent::Ticked { outcome: &outcome }),
                        Some(Err(error)) => reporter.report(SchedulerEvent::TickFailed { error: &error }),
                        None => {
                            reporter.report(SchedulerEvent::StepAbandoned);
                            break;
                        }
                    }
                    self.publish();
                }
                Some(command) = self.commands.recv() => {
                    if !self.handle_command(command, &cancel_token, reporter).await {
                        reporter.report(SchedulerEvent::StepAbandoned);
                        break;
                    }
                }
            }
        }

        let status = self.scheduler.status();
        reporter.report(SchedulerEvent::ShuttingDown { status: &status });
        if let Err(e) = self.scheduler.checkpoint().await {
            tracing::error!(error = %e, "Failed to persist scheduler state on shutdown");
        }
        self.publish();
        reporter.report(SchedulerEvent::Stopped);

        Ok(())
    }

    /// Returns false when cancellation interrupted the command. Status is
    /// published before replying so callers read their own write.
    async fn handle_command<RP: SchedulerReporter>(
        &mut self,
        command: Command,
        cancel_token: &CancellationToken,
        reporter: &RP,
    ) -> bool {
        match command {
            Command::Trigger(reply) => {
                let result = tokio::select! {
                    result = self.scheduler.trigger() => result,
                    () = cancel_token.cancelled() => return false,
                };
                reporter.report(SchedulerEvent::Triggered { outcome: &result });
                self.publish();
                let _ = reply.send(result);
            }
            Command::Reset(reply) => {
                let result = self.scheduler.reset().await;
                if let Ok(status) = &result {
                    reporter.report(SchedulerEvent::Reset { status });
                }
                self.publish();
                let _ = reply.send(result);
            }
        }
        true
    }

    fn publish(&self) {
        self.status.send_replace(self.scheduler.status());
    }
}
