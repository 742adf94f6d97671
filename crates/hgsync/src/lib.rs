//! Core library for mirroring git push events into Mercurial destinations.
//!
//! A single-process, single-worker pipeline: the Pulse consumer pulls one
//! push event at a time from the broker, the mapping engine expands it into
//! per-destination sync operations, and the repository synchronizer drives
//! a local git-cinnabar clone through fetch, metadata annotation, tagging,
//! and per-ref pushes before the message is acknowledged. Failures before
//! the handler reject the message; handler failures requeue it and the
//! whole pipeline re-runs idempotently on re-delivery.

pub mod app;
pub mod consumer;
pub mod events;
pub mod git;
pub mod mapping;
pub mod sync;
