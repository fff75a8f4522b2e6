//! Clients for remote hypervisor APIs.

pub mod error;
pub mod pve;

pub use error::{ApiError, ErrorKind, classify};
pub use pve::{
    GuestSummary, Method, Params, PveApi, PveClient, RunAction, StatusReport, TemplateEntry,
};
