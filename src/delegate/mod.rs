//! Delegates and their invocation.

pub mod command;
pub mod invoker;
pub mod registry;
pub mod traits;

pub use command::{CommandDelegate, DelegateConfig};
pub use invoker::{
    CompletionSender, DelegateInvoker, InvocationMode, InvokerConfig, IssuedInvocation,
    WaveBarrier,
};
pub use registry::DelegateRegistry;
pub use traits::{Delegate, DelegateClass, DelegateResponse};
