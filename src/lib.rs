//! Cached query core for archetype ECS worlds.
//!
//! This crate maintains, for each persistent query, a materialized index of
//! all archetype tables whose contents satisfy the query's term expression,
//! together with the per-table evaluation results. Re-evaluating a query
//! against every table on every iteration is the dominant cost of an ECS;
//! the cache shifts that cost to structural-change events (table creation,
//! table deletion, component add/remove on a matched signature).
//!
//! # Architecture
//!
//! - [`world::World`] owns the [`storage::Storage`] table registry, the
//!   component-monitor registry, the table event bus, and the world-wide
//!   monitor generation counter.
//! - [`query::Filter`] is the validated, uncached query; [`query::QueryIter`]
//!   evaluates it against storage, expanding wildcards and resolving
//!   up-traversal sources.
//! - [`cache::QueryCache`] is the materialized index: per-table match
//!   buckets, a doubly-linked iteration list, and an optional group overlay
//!   that partitions the list into contiguous key-ordered runs.
//!
//! Cache updates are single-writer: the embedding runtime serializes
//! construction, event handling, rematching, and teardown. Iteration is
//! read-only and may be freely interleaved with other reads.

pub mod cache;
pub mod entity;
pub mod error;
pub mod id;
pub mod monitor;
pub mod observer;
pub mod query;
pub mod storage;
pub mod world;
