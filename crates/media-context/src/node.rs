//! Media function to GPU engine node routing.

use md_common::{ContextError, ContextResult, GpuNode, MediaFunction, MosInterface};

/// Platform engine limits applied on top of the default routing table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NodeLimit {
    /// VDBOX-backed video nodes (0, 1 or 2 usable node classes).
    pub max_video_nodes: u8,
    pub vebox_supported: bool,
    pub compute_supported: bool,
}

impl NodeLimit {
    /// Read the limits from the engine counts the OS layer reports.
    pub fn from_os(os: &dyn MosInterface) -> Self {
        Self {
            max_video_nodes: os.engine_count(GpuNode::Video).min(2),
            vebox_supported: os.engine_count(GpuNode::VideoEnhance) > 0,
            compute_supported: os.engine_count(GpuNode::Compute) > 0,
        }
    }
}

impl Default for NodeLimit {
    fn default() -> Self {
        Self {
            max_video_nodes: 2,
            vebox_supported: true,
            compute_supported: true,
        }
    }
}

/// Node a function runs on when the platform has every engine.
pub fn default_node(function: MediaFunction) -> GpuNode {
    match function {
        MediaFunction::RenderGeneric => GpuNode::Render3D,
        MediaFunction::VdboxDecode | MediaFunction::VdboxEncode | MediaFunction::VdboxCp => {
            GpuNode::Video
        }
        MediaFunction::VdboxDecodeWa => GpuNode::Video2,
        MediaFunction::VeboxVpp => GpuNode::VideoEnhance,
        MediaFunction::ComputeMdf | MediaFunction::ComputeVpp => GpuNode::Compute,
    }
}

/// Route `function` to a node, applying the platform overrides.
///
/// The second video node collapses onto the first on single-VDBOX parts and
/// compute work falls back to the render engine when there is no compute
/// engine. A function left without an engine is an error.
pub fn function_to_node(function: MediaFunction, limit: &NodeLimit) -> ContextResult<GpuNode> {
    let node = match default_node(function) {
        GpuNode::Video2 if limit.max_video_nodes == 1 => GpuNode::Video,
        GpuNode::Compute if !limit.compute_supported => GpuNode::Render3D,
        node => node,
    };
    let available = match node {
        GpuNode::Video => limit.max_video_nodes >= 1,
        GpuNode::Video2 => limit.max_video_nodes >= 2,
        GpuNode::VideoEnhance => limit.vebox_supported,
        GpuNode::Compute => limit.compute_supported,
        GpuNode::Render3D => true,
    };
    if available {
        Ok(node)
    } else {
        Err(ContextError::InvalidNode(function))
    }
}
