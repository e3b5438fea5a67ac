//! 3D samplers and sampler8x8 states.
//!
//! Both are registered in a HAL table before the device stores them. The
//! registration is held in a [`SamplerRegistration`] guard which unregisters
//! on drop unless it was committed into a table entry, so any failure
//! between registration and storage rolls the HAL slot back.

use std::sync::Arc;

use md_common::{CmError, CmHal, CmResult, Sampler8x8Descriptor, SamplerState};
use tracing::{debug, warn};

use crate::slot::{Handle, SlotArray};

pub type SamplerId = Handle<Sampler>;
pub type Sampler8x8Id = Handle<Sampler8x8>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SamplerTable {
    Sampler,
    Sampler8x8,
}

/// A live HAL registration that is rolled back unless committed.
pub struct SamplerRegistration {
    hal: Arc<dyn CmHal>,
    table: SamplerTable,
    index: u32,
    committed: bool,
}

impl SamplerRegistration {
    pub fn register(hal: &Arc<dyn CmHal>, state: &SamplerState) -> CmResult<Self> {
        let index = hal.register_sampler(state)?;
        debug!(index, "Sampler registered");
        Ok(Self {
            hal: Arc::clone(hal),
            table: SamplerTable::Sampler,
            index,
            committed: false,
        })
    }

    pub fn register_8x8(hal: &Arc<dyn CmHal>, desc: &Sampler8x8Descriptor) -> CmResult<Self> {
        let index = hal.register_sampler8x8(desc)?;
        debug!(index, "Sampler8x8 registered");
        Ok(Self {
            hal: Arc::clone(hal),
            table: SamplerTable::Sampler8x8,
            index,
            committed: false,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Keep the registration; the caller now owns unregistering it.
    pub fn commit(mut self) -> u32 {
        self.committed = true;
        self.index
    }
}

impl Drop for SamplerRegistration {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let result = match self.table {
            SamplerTable::Sampler => self.hal.unregister_sampler(self.index),
            SamplerTable::Sampler8x8 => self.hal.unregister_sampler8x8(self.index),
        };
        match result {
            Ok(()) => debug!(index = self.index, table = ?self.table, "Sampler registration rolled back"),
            Err(e) => warn!(index = self.index, error = %e, "Sampler rollback failed"),
        }
    }
}

/// 3D sampler: the registered state and its HAL index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sampler {
    state: SamplerState,
    hal_index: u32,
}

impl Sampler {
    pub fn state(&self) -> &SamplerState {
        &self.state
    }

    pub fn hal_index(&self) -> u32 {
        self.hal_index
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sampler8x8 {
    desc: Sampler8x8Descriptor,
    hal_index: u32,
}

impl Sampler8x8 {
    pub fn descriptor(&self) -> &Sampler8x8Descriptor {
        &self.desc
    }

    pub fn hal_index(&self) -> u32 {
        self.hal_index
    }
}

/// Register `state` and store it. A full device table rolls the HAL
/// registration back.
pub fn create_sampler(
    hal: &Arc<dyn CmHal>,
    table: &mut SlotArray<Sampler>,
    state: &SamplerState,
) -> CmResult<SamplerId> {
    let registration = SamplerRegistration::register(hal, state)?;
    let sampler = Sampler {
        state: *state,
        hal_index: registration.index(),
    };
    let id = table.insert(sampler).map_err(|_| CmError::ExceedSamplerAmount)?;
    registration.commit();
    Ok(id)
}

pub fn destroy_sampler(hal: &dyn CmHal, table: &mut SlotArray<Sampler>, id: SamplerId) -> CmResult<()> {
    let sampler = table.remove(id)?;
    hal.unregister_sampler(sampler.hal_index)?;
    debug!(sampler = ?id, index = sampler.hal_index, "Sampler destroyed");
    Ok(())
}

pub fn create_sampler8x8(
    hal: &Arc<dyn CmHal>,
    table: &mut SlotArray<Sampler8x8>,
    desc: &Sampler8x8Descriptor,
) -> CmResult<Sampler8x8Id> {
    desc.validate().map_err(CmError::InvalidArgValue)?;
    let registration = SamplerRegistration::register_8x8(hal, desc)?;
    let sampler = Sampler8x8 {
        desc: desc.clone(),
        hal_index: registration.index(),
    };
    let id = table.insert(sampler).map_err(|_| CmError::ExceedSamplerAmount)?;
    registration.commit();
    Ok(id)
}

pub fn destroy_sampler8x8(
    hal: &dyn CmHal,
    table: &mut SlotArray<Sampler8x8>,
    id: Sampler8x8Id,
) -> CmResult<()> {
    let sampler = table.remove(id)?;
    hal.unregister_sampler8x8(sampler.hal_index)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use md_common::cm_hal::{ConvolveParams, MiscParams};
    use md_gpu_hal::{HalCall, SoftwareCmHal, SoftwareCmHalConfig};

    fn hal(capacity: u32) -> (Arc<SoftwareCmHal>, Arc<dyn CmHal>) {
        let soft = Arc::new(SoftwareCmHal::new(SoftwareCmHalConfig {
            sampler_capacity: capacity,
            ..SoftwareCmHalConfig::default()
        }));
        let dyn_hal: Arc<dyn CmHal> = soft.clone();
        (soft, dyn_hal)
    }

    #[test]
    fn uncommitted_registration_unregisters() {
        let (soft, hal) = hal(4);
        {
            let reg = SamplerRegistration::register(&hal, &SamplerState::default()).unwrap();
            assert_eq!(reg.index(), 0);
            assert_eq!(soft.registered_samplers(), 1);
        }
        assert_eq!(soft.registered_samplers(), 0);
        assert_eq!(soft.calls().last(), Some(&HalCall::UnregisterSampler(0)));
    }

    #[test]
    fn full_device_table_rolls_back_registration() {
        let (soft, hal) = hal(4);
        let mut table = SlotArray::new("sampler", 1);
        create_sampler(&hal, &mut table, &SamplerState::default()).unwrap();

        let err = create_sampler(&hal, &mut table, &SamplerState::default()).unwrap_err();
        assert!(matches!(err, CmError::ExceedSamplerAmount));
        let calls = soft.calls();
        assert_eq!(
            &calls[calls.len() - 2..],
            &[HalCall::RegisterSampler(1), HalCall::UnregisterSampler(1)]
        );
        assert_eq!(soft.registered_samplers(), 1);
    }

    #[test]
    fn hal_table_full_is_hal_error() {
        let (_soft, hal) = hal(1);
        let mut table = SlotArray::new("sampler", 8);
        create_sampler(&hal, &mut table, &SamplerState::default()).unwrap();
        let err = create_sampler(&hal, &mut table, &SamplerState::default()).unwrap_err();
        assert!(matches!(err, CmError::Hal(_)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn destroy_unregisters() {
        let (soft, hal) = hal(4);
        let mut table = SlotArray::new("sampler", 4);
        let id = create_sampler(&hal, &mut table, &SamplerState::default()).unwrap();
        destroy_sampler(hal.as_ref(), &mut table, id).unwrap();
        assert_eq!(soft.registered_samplers(), 0);
        assert!(destroy_sampler(hal.as_ref(), &mut table, id).is_err());
    }

    #[test]
    fn sampler8x8_payload_validated_before_registration() {
        let (soft, hal) = hal(4);
        let mut table = SlotArray::new("sampler8x8", 2);
        let bad = Sampler8x8Descriptor::Convolve(ConvolveParams {
            width: 3,
            height: 3,
            coefficients: vec![0; 4],
        });
        assert!(matches!(
            create_sampler8x8(&hal, &mut table, &bad),
            Err(CmError::InvalidArgValue(_))
        ));
        assert_eq!(soft.registered_sampler8x8(), 0);

        let misc = Sampler8x8Descriptor::Misc(MiscParams {
            width: 3,
            height: 3,
            row_mask: 0x7,
        });
        let id = create_sampler8x8(&hal, &mut table, &misc).unwrap();
        assert_eq!(soft.registered_sampler8x8(), 1);
        destroy_sampler8x8(hal.as_ref(), &mut table, id).unwrap();
        assert_eq!(soft.registered_sampler8x8(), 0);
    }
}
