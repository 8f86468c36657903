//! Architecture-specific context switching.
//!
//! Each architecture provides:
//! - `SavedContext`: the callee-saved register block of a suspended fiber
//! - `init_context`: prepare a fresh context that enters `entry(arg)` on
//!   the given stack when first switched to
//! - `context_switch`: save the current registers into one block and load
//!   another, transferring control

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::{context_switch, init_context, SavedContext};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::{context_switch, init_context, SavedContext};
    } else {
        compile_error!("unsupported architecture");
    }
}
