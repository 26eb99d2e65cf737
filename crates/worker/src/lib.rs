//! `mediaforge-worker`: wires configuration into a running orchestration engine.

pub mod app;
