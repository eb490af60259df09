//! Eager operation queue, JIT fusion compiler, command stream, heap
//! allocator and constant folder for a GPU-backed tensor execution device.
//!
//! The public surface is deliberately small: construct a [`Device`] over a
//! [`Backend`], create tensors on it, and run named ops against them through
//! [`Device::execute_operation`]. Everything else — fusion, batching,
//! allocation, constant folding — is an implementation detail the caller
//! never has to think about, matching the "eager, synchronous-looking API
//! backed by an asynchronous device" shape of the engine this is built on.

pub mod allocator;
pub mod backend;
mod command_stream;
mod compiler;
pub mod config;
mod constant_fold;
pub mod device;
pub mod encoder;
pub mod handle;
pub mod instr;
mod queue;
pub mod registry;

pub use backend::{Backend, CommandBufferId, MockBackend};
pub use config::{DebugFlags, RuntimeConfig};
pub use device::Device;
pub use handle::Tensor;
pub use instr::{CopyInstr, ElementwiseInstr, Instruction};
