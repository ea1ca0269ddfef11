//! # libdra — dynamic resource allocation controller for RK8s
//!
//! `libdra` is the controller engine a resource driver embeds to serve
//! `ResourceClaim` objects. The driver implements the [`DraDriver`] trait
//! (parameters, allocate, deallocate, unsuitable nodes); this crate supplies
//! everything around it: the object cache fed by registry watches, the typed
//! work queue with per-key single-flight and exponential backoff, and the two
//! reconcilers that drive claims through their allocation lifecycle.
//!
//! | Module | Purpose |
//! |---|---|
//! | [`api`] | [`ResourceStore`] contract and the Xline-backed implementation. |
//! | [`cache`] | Local object cache with claim/class reverse indexes. |
//! | [`driver`] | [`DraDriver`] trait and [`ClaimAllocation`]. |
//! | [`controllers`] | Key router, reconcilers, work-queue manager. |
//!
//! [`ResourceStore`]: api::ResourceStore
//! [`DraDriver`]: driver::DraDriver
//! [`ClaimAllocation`]: driver::ClaimAllocation

pub mod api;
pub mod cache;
pub mod controllers;
pub mod driver;

pub use controllers::{ControllerConfig, DraController, ReconcileOutcome, ResourceEvent};
pub use driver::{ClaimAllocation, DraDriver};
