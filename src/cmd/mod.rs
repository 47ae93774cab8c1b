//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module      | Commands handled                                   |
//! |-------------|----------------------------------------------------|
//! | `serve`     | `Serve`                                            |
//! | `provision` | `Init`, `Bootstrap`, `Superadmin`, `Session`       |
//! | `import`    | `Import`                                           |

pub mod import;
pub mod provision;
pub mod serve;

pub use import::cmd_import;
pub use provision::{BootstrapArgs, cmd_bootstrap, cmd_init, cmd_session, cmd_superadmin};
pub use serve::cmd_serve;
