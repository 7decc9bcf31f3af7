//! Tollgate - Distributed Fixed-Window Rate Limiting
//!
//! This crate gates request throughput per client across stateless service
//! replicas. Counters live in a shared Redis store; when the store is down,
//! development deployments fall back to an in-process table while production
//! deployments fail closed.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
