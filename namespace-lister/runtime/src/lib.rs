#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use namespace_lister_core as core;
pub use namespace_lister_http as http;
pub use namespace_lister_k8s_api as k8s;
pub use namespace_lister_k8s_index as index;

mod args;

pub use self::args::Args;
