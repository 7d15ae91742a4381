//! `flotilla-deploy`: a concurrent schema-migration and content-seeding engine for
//! SQL Server / Azure SQL Database.
//!
//! The engine applies two kinds of artifacts to one or more target databases in
//! parallel: phase-aware schema migrations (`Pre`/`Core`/`Post`, for zero-downtime
//! deploys) and dependency-ordered content seeds. A [`session::Session`] fans work
//! out across a [`target::TargetGroup`] under layered [`limiter::Limiter`]s, while
//! [`plan`]/[`migration_applicator`] and [`seed_graph`]/[`seed_applicator`] handle
//! the two artifact kinds respectively, both talking to a target through the
//! [`connection::TargetConnection`] contract.

pub mod connection;
pub mod console;
pub mod deployment;
pub mod discovery;
pub mod error;
pub mod limiter;
pub mod migration;
pub mod migration_applicator;
pub mod migration_loader;
pub mod plan;
pub mod preprocess;
pub mod seed;
pub mod seed_applicator;
pub mod seed_graph;
pub mod seed_parser;
pub mod session;
pub mod target;

pub use crate::connection::{ConnectionFactory, RunId, TargetConnection, WhatIfConnectionFactory};
pub use crate::console::{ApplyKind, Console, Disposition, FileConsole, NullConsole};
pub use crate::deployment::DeploymentApplicator;
pub use crate::error::{ArgumentError, ConnectionError, MigrationError, SeedError, SessionError, SessionFailure, TaggedError};
pub use crate::limiter::{CompositeLimiter, Limiter, LimiterError, LimiterScope, NullLimiter, SemaphoreLimiter};
pub use crate::migration::{Migration, MigrationState, Phase};
pub use crate::plan::MigrationPlan;
pub use crate::seed::{LoadedSeed, Seed, SeedModule};
pub use crate::seed_graph::SeedGraph;
pub use crate::session::{Session, SessionOptions, TargetApplicator};
pub use crate::target::{Credential, Target, TargetGroup, TargetSource};

#[cfg(feature = "tiberius-driver")]
pub use crate::connection::tiberius_driver::SqlTargetConnection;
