//! Core library for the workbench daemon.
//!
//! Orchestrates services, tasks and one-shot jobs across a multi-repository
//! workspace. Every record lives in the [`store::EntityStore`] behind a
//! per-ID lock; every state change is published on the [`bus::EventBus`],
//! where waiters subscribe from a sequence checkpoint taken before acting.
//!
//! Quick start:
//! - Build everything from a project root with `workbench_core::daemon::Runtime::open`.
//! - Call `Runtime::start` to run the worker pool and `DaemonHandle::shutdown` to stop.
//! - Submit jobs with `queue::WorkQueue::submit`, start services with
//!   `service::ServiceOrchestrator::start`, run tasks with `task::TaskRunner::run`.

pub mod bus;
pub mod catalog;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod logging;
pub mod metrics;
pub mod process;
pub mod queue;
pub mod service;
pub mod store;
pub mod sync;
pub mod task;
