//! `md-media-context` — GPU context cache and engine routing.
//!
//! Pipelines ask [`MediaContext`] for a scalability instance for a media
//! function. The context maps the function to an engine node, creates (or
//! reuses) a GPU context on that node, and hands back the scalability state
//! bound to it.
//!
//! ```text
//! switch_context(function, params)
//!        │
//!        ├── cache hit ──▶ set_gpu_context, return cached instance
//!        │
//!        └── miss ──▶ function_to_node ──▶ evict LRU if full
//!                       ──▶ create_scalability ──▶ create_gpu_context
//! ```

pub mod balancer;
pub mod context;
pub mod node;

pub use md_common::{ContextError, ContextResult};

pub use balancer::{DecodeNodeBalancer, NoBalancing, RoundRobinBalancer};
pub use context::{ContextStats, MediaContext, SharedScalability};
pub use node::{default_node, function_to_node, NodeLimit};
