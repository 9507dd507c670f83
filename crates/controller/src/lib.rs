//! Regent controller runtime.
//!
//! A [`Controller`] names a managed type, the types whose mutations should
//! trigger it (through a [`DependencyMapper`]), and a [`Reconciler`]. The
//! [`Manager`] watches those types through a [`regent_service::ResourceClient`],
//! coalesces triggers per resource id and runs reconciles on a worker pool
//! while this process holds leadership. Failed reconciles are retried with
//! exponential backoff.

#![forbid(unsafe_code)]

mod controller;
mod manager;
mod queue;

pub use controller::{
    map_owner, map_owner_filter_by_type, Controller, ControllerOptions, DependencyMapper, Reconciler, Request,
    Runtime,
};
pub use manager::{Leadership, Manager, ManagerError};
