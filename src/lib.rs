//! Ratewarden - Distributed Sliding-Window Rate Limiting
//!
//! This crate implements a sliding window rate limiter whose counters live in
//! an external ordered-set store (Redis in production, an in-memory map in
//! tests), together with an axum middleware adapter and a small HTTP service.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod web;
