//! Execution backends.
//!
//! The graph never computes values itself: it hands each operation and its
//! input tensors to a [`Kernel`](backend::Kernel) implementation.

pub mod backend;
pub mod cpu_backend;

pub use backend::{Kernel, KernelError};
pub use cpu_backend::CpuBackend;
