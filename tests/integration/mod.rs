//! Integration test suite for cadence.
//!
//! These tests drive the engine end to end with scripted collaborators
//! (planner, executor, gate runner, responder) over an in-memory version
//! control store, plus a few runs against a real git repository.
//!
//! # Test Categories
//!
//! - `properties`: Scheduling, claim, remediation and checkpoint guarantees
//! - `scenarios`: End-to-end sessions
//! - `recovery`: Worker retries, cancellation, resume and rollback
//! - `git_checkpoints`: Checkpoints and rollback on a git work tree
//!
//! # CI Compatibility
//!
//! No agent or gate command is ever spawned; every external call goes
//! through a fixture.

#[allow(dead_code)]
mod fixtures;

mod git_checkpoints;
mod recovery;
mod scenarios;
