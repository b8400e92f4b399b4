//! # agentcoord-core
//!
//! The coordination core of a multi-agent orchestration system: a
//! distributed substrate that lets many independent worker processes
//! cooperate on a shared workload by claiming tasks, serializing access to
//! shared files, communicating via threads and direct messages, logging
//! decisions, and requesting human-style approvals — all backed by a
//! shared in-memory key/value store with a transparent single-process
//! fallback for local use.
//!
//! ## Architecture
//!
//! The crate is a library, not a service. Multiple OS processes
//! (coordinators, workers, CLI tools) each link it and connect to a shared
//! KV; when none is reachable it transparently degrades to a single-process
//! file-backed implementation behind the same [`kv::KvBackend`] trait.
//!
//! - **Task Queue** ([`queue`]) — priority ordering, atomic claiming,
//! dependency-gated readiness, lifecycle transitions, retry/escalation.
//! - **File Lock Manager** ([`locks`]) — atomic exclusive file locks with
//! TTL auto-expiry and scoped, guaranteed release.
//! - **Agent Registry** ([`registry`]) — registration, heartbeating,
//! liveness/hung detection.
//! - **Approval Workflow** ([`approval`]) — blocking multi-approver
//! requests with timeout and poll-for-decision.
//! - **Worker Spawner & Auto-Scaler** ([`spawner`], [`autoscaler`]) —
//! process-level worker lifecycle driven by queue depth.
//! - **Board / Channels** ([`board`]) — threaded messages and broadcasts.
//! - **Audit Log** ([`audit`]) — append-only ordered record of decisions.
//! - **LLM budget** ([`llm_budget`]) — a process-wide concurrency and spend
//! gate adjacent to the core.
//! - **Coordination Client** ([`session`]) — the scoped façade combining
//! agent registration, heartbeat, and access to every subsystem above.
//!
//! ## Usage
//!
//! A process typically opens a KV connection with
//! [`session::connect_kv()`], enters a [`session::CoordinationSession`], and
//! then uses [`session::CoordinationSession::queue`] /
//! [`session::CoordinationSession::locks`] / etc. for the duration of the
//! scope.

/// Auto-scaler: observes queue depth and adjusts worker count
pub mod autoscaler;
/// Approval Workflow: blocking multi-approver requests
pub mod approval;
/// Audit Log: append-only record of decisions and events
pub mod audit;
/// Board / Channels: threaded messages and broadcast adapters
pub mod board;
/// System-wide constants and defaults
pub mod constants;
/// Typed, environment-driven configuration
pub mod config;
/// Error types and handling
pub mod error;
/// Newtype identifiers (`TaskId`, `AgentId`, `LockId`,...)
pub mod ids;
/// KV Backend Abstraction: networked and file-backed implementations
pub mod kv;
/// LLM budget: concurrency semaphore and spend tracking
pub mod llm_budget;
/// File Lock Manager: exclusive, TTL-bounded file locks
pub mod locks;
/// Core data records shared by every subsystem
pub mod models;
/// Task Queue: the central component
pub mod queue;
/// Agent Registry: registration, heartbeat, liveness
pub mod registry;
/// Coordination Client façade: scoped session over the whole core
pub mod session;
/// Worker Spawner: process-level worker lifecycle
pub mod spawner;

pub use error::{CoordError, Result};
