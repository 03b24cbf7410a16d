//! Builtin resolve/recompress passes around kernels that read compressed
//! buffers through stateless pointers.

use std::sync::Arc;

use tracing::debug;
use xe_common::{Result, XeError};
use xe_kernel::{KernelDescriptor, KernelDispatchState};
use xe_memory::GraphicsAllocation;

use crate::device::Device;
use crate::dispatch_info::{DispatchInfo, DispatchKind};

/// Name of the builtin that translates one buffer between compressed and
/// uncompressed layouts.
pub const AUX_TRANSLATION_KERNEL: &str = "__builtin_aux_translation";

const SIMD: u32 = 16;
/// Bytes one work item translates.
const BYTES_PER_ITEM: usize = 64;

pub(crate) fn builtin_descriptors() -> Vec<KernelDescriptor> {
    vec![
        KernelDescriptor::builder(AUX_TRANSLATION_KERNEL, SIMD)
            .pointer_arg()
            .dispatch_traits()
            .build(),
    ]
}

/// Groups needed to cover `size` bytes.
fn translation_groups(size: usize) -> Result<u32> {
    let groups = size.div_ceil(BYTES_PER_ITEM).div_ceil(SIMD as usize).max(1);
    u32::try_from(groups)
        .map_err(|_| XeError::out_of_resources(format!("aux translation of {groups} groups"), size))
}

fn translation_pass(
    device: &Device,
    allocation: &Arc<GraphicsAllocation>,
    kind: DispatchKind,
) -> Result<DispatchInfo> {
    let module = device.builtin_module()?;
    let mut kernel = module.create_kernel(AUX_TRANSLATION_KERNEL)?;
    kernel.set_arg_buffer_with_alloc(0, allocation.gpu_address(), allocation)?;
    kernel.set_group_size([SIMD, 1, 1])?;
    let groups = translation_groups(allocation.size())?;
    kernel.set_group_count([groups, 1, 1])?;
    Ok(DispatchInfo {
        kind,
        state: kernel.dispatch_state(),
        timestamp: None,
    })
}

/// Wrap `kernel_dispatches` with one resolve pass per compressed buffer
/// before and one recompress pass after.
pub fn surround_with_translation(
    device: &Device,
    state: &KernelDispatchState,
    kernel_dispatches: Vec<DispatchInfo>,
) -> Result<Vec<DispatchInfo>> {
    if state.aux_translation.is_empty() {
        return Ok(kernel_dispatches);
    }
    let buffers = &state.aux_translation;
    let mut dispatches = Vec::with_capacity(kernel_dispatches.len() + 2 * buffers.len());
    for allocation in buffers {
        dispatches.push(translation_pass(device, allocation, DispatchKind::AuxToNonAux)?);
    }
    dispatches.extend(kernel_dispatches);
    for allocation in buffers {
        dispatches.push(translation_pass(device, allocation, DispatchKind::NonAuxToAux)?);
    }
    debug!(
        kernel = %state.kernel_name,
        buffers = buffers.len(),
        "aux translation passes added"
    );
    Ok(dispatches)
}
