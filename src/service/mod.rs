//! Service layer for business logic orchestration
//!
//! This module contains the service layer that orchestrates building and
//! verifying images, separating concerns from the CLI layer in main.rs.

pub mod build;
pub mod verify;

pub use build::{BuildRequest, BuildResult, BuildService};
pub use verify::{CheckOutcome, CheckResult, VerifyReport, VerifyRequest, VerifyService};
