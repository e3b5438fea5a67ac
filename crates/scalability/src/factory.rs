//! Builds the right scalability variant for an option.

use std::sync::Arc;

use md_common::{MosInterface, ScalabilityConfig};
use tracing::debug;

use crate::multi_pipe::MediaScalabilityMultiPipe;
use crate::option::{ScalabilityOption, ScalabilityParams};
use crate::scalability::MediaScalability;
use crate::single_pipe::MediaScalabilitySinglePipe;
use crate::ScalabilityResult;

/// Create and initialize a scalability instance for `option`.
///
/// One pipe selects the single-pipe variant; anything more selects the
/// multi-pipe variant, which owns GPU semaphores.
pub fn create_scalability(
    os: Arc<dyn MosInterface>,
    config: &ScalabilityConfig,
    option: &ScalabilityOption,
) -> ScalabilityResult<Box<dyn MediaScalability>> {
    let mut scalability: Box<dyn MediaScalability> = if option.is_multi_pipe() {
        Box::new(MediaScalabilityMultiPipe::new(
            os,
            config.clone(),
            option.component(),
        ))
    } else {
        Box::new(MediaScalabilitySinglePipe::new(
            os,
            config.clone(),
            option.component(),
        ))
    };
    scalability.initialize(option)?;
    debug!(
        component = ?option.component(),
        pipes = option.num_pipe(),
        "Created scalability instance"
    );
    Ok(scalability)
}

/// Decide the option for `params`, then create the matching instance.
pub fn create_scalability_for(
    os: Arc<dyn MosInterface>,
    config: &ScalabilityConfig,
    params: &ScalabilityParams,
) -> ScalabilityResult<(ScalabilityOption, Box<dyn MediaScalability>)> {
    let option = ScalabilityOption::new(params, config)?;
    let scalability = create_scalability(os, config, &option)?;
    Ok((option, scalability))
}
