//! Docker Gateway (C1): the sole layer that speaks to the Docker daemon.
//!
//! Every other component depends on [`traits::ContainerRuntime`], never on
//! `bollard` directly, so the runtime behind it can be swapped (or mocked)
//! without churn elsewhere.

pub mod traits;

mod client;
mod container;
mod exec;
mod lifecycle;
mod stats;

pub use client::DockerGateway;
pub use traits::{
    ContainerRuntime, ContainerSpec, DockerError, DockerResult, ExecHandle, InspectResult,
    MountConfig, ResourceLimits, ResourceSample, RuntimeState, SecurityOptions,
};
