//! System requirements validation.
//!
//! This module checks that the host carries the platform tools the selected
//! backend shells out to, before any tenant request arrives.

mod requirements;

pub use requirements::{
    SystemRequirements, check_all, check_cgroups_v2, kernel_release, required_tools,
    resolve_tool,
};
