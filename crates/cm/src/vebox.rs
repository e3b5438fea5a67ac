//! VEBOX state objects.

use crate::slot::Handle;
use crate::surface::SurfaceId;

pub type VeboxId = Handle<CmVebox>;

/// Enhancement stages the VEBOX runs.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VeboxState {
    pub denoise: bool,
    pub deinterlace: bool,
    pub color_gamut_compression: bool,
    pub skin_tone_enhancement: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CmVebox {
    state: VeboxState,
    input: Option<SurfaceId>,
    output: Option<SurfaceId>,
}

impl CmVebox {
    pub fn set_state(&mut self, state: VeboxState) {
        self.state = state;
    }

    pub fn state(&self) -> VeboxState {
        self.state
    }

    pub fn set_surfaces(&mut self, input: SurfaceId, output: SurfaceId) {
        self.input = Some(input);
        self.output = Some(output);
    }

    /// Surfaces the VEBOX reads or writes.
    pub fn surfaces(&self) -> Vec<SurfaceId> {
        self.input.into_iter().chain(self.output).collect()
    }
}
