//! Dependency-aware task scheduling onto a scored pool of agents.
//!
//! Tasks wait until their dependencies complete, then fan out to the idle
//! agents whose skills, tools and track record score above a threshold.
//! Every agent runs under its own deadline; failures are isolated per agent
//! and failed tasks are retried with backoff.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Facade over agents, tasks, resources and discovery.
//! - [`TaskScheduler`] — Queue, dependency resolution, dispatch and retry.
//! - [`AgentSelector`] — Weighted capability scoring of idle agents.
//! - [`Dispatcher`] — Concurrent per-agent execution with deadlines.
//! - [`AgentExecutor`] — Trait implemented by whatever does the agents' work.
//! - [`AgentRegistry`] — Agent table with atomic reservation.

/// Scheduler and selection settings.
pub mod config;
/// Concurrent execution of one task on its selected agents.
pub mod dispatcher;
/// Orchestration facade.
pub mod engine;
/// Pluggable agent execution.
pub mod executor;
/// Skill and tool matching strategies.
pub mod matcher;
/// Scheduler metrics.
pub mod monitor;
/// Registered agents and their availability.
pub mod registry;
/// Retry decisions and backoff.
pub mod retry;
/// Task submission, dependency resolution and dispatch.
pub mod scheduler;
/// Agent scoring and selection.
pub mod selector;
/// Pending queue and finished-task history.
pub mod task_queue;
/// Shared types (Agent, Task, TaskRequirements, etc.).
pub mod types;

pub use config::{OrchestratorConfig, ResourceAllocationStrategy};
pub use dispatcher::Dispatcher;
pub use engine::{Orchestrator, SyncReport, SystemStatus};
pub use executor::{AgentExecutor, SimulatedExecutor};
pub use matcher::{CapabilityMatcher, ExactMatcher, SubstringMatcher};
pub use monitor::{SchedulerMetrics, SchedulerMonitor};
pub use registry::AgentRegistry;
pub use retry::RetryPolicy;
pub use scheduler::{QueueSnapshot, TaskScheduler};
pub use selector::{AgentSelector, ScoredAgent};
pub use task_queue::TaskQueue;
pub use types::{
    Agent, AgentOrigin, AgentOutcome, AgentPerformance, AgentProfile, AgentStatus, Task,
    TaskRequirements, TaskResult, TaskStatus,
};
