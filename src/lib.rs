// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// Each module represents a well-defined responsibility:
//
// - config:      Configuration structs loaded from JSON
// - schema:      Strongly typed accounts, links and inbound messages
// - error:       Error taxonomy shared across layers
// - util:        Shared helper utilities (time, attachment types)
// - classifier:  Link extraction, normalization and tagging
// - store:       SQLite persistence (accounts, links, runs)
// - transport:   Platform transports and transport registry
// - pool:        Live sessions, one per registered account
// - collector:   Per-session workers (events → links → store)
// - controller:  Run lifecycle and status
// - metrics:     Process-wide counters
//
pub mod classifier;
pub mod collector;
pub mod config;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod schema;
pub mod store;
pub mod transport;
pub mod util;
