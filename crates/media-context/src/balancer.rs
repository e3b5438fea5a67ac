//! Per-frame VDBOX load balancing for decode.

use md_common::{GpuNode, MediaFunction};

use crate::node::NodeLimit;

/// Picks a video node for a decode frame.
///
/// A returned node overrides the cache lookup for that one frame: the
/// context cache reuses an entry bound to that node, or creates one.
pub trait DecodeNodeBalancer: Send + Sync {
    fn preferred_node(
        &self,
        function: MediaFunction,
        frame_number: u64,
        limit: &NodeLimit,
    ) -> Option<GpuNode>;
}

/// Alternate decode frames between the available video nodes.
#[derive(Copy, Clone, Debug, Default)]
pub struct RoundRobinBalancer;

impl DecodeNodeBalancer for RoundRobinBalancer {
    fn preferred_node(
        &self,
        function: MediaFunction,
        frame_number: u64,
        limit: &NodeLimit,
    ) -> Option<GpuNode> {
        if function != MediaFunction::VdboxDecode || limit.max_video_nodes < 2 {
            return None;
        }
        match frame_number % u64::from(limit.max_video_nodes) {
            0 => Some(GpuNode::Video),
            _ => Some(GpuNode::Video2),
        }
    }
}

/// Never override the cache.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoBalancing;

impl DecodeNodeBalancer for NoBalancing {
    fn preferred_node(&self, _: MediaFunction, _: u64, _: &NodeLimit) -> Option<GpuNode> {
        None
    }
}
