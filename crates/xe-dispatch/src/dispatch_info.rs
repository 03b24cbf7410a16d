//! The walkers one enqueue turns into.

use std::sync::Arc;

use serde::Serialize;
use xe_common::{Result, XeError};
use xe_csr::TimestampPacketNode;
use xe_kernel::KernelDispatchState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchKind {
    Kernel,
    /// Resolve compressed buffers before the kernel reads them.
    AuxToNonAux,
    /// Recompress after the kernel.
    NonAuxToAux,
}

/// One walker: frozen kernel state plus the node its timestamps go to.
#[derive(Debug, Clone)]
pub struct DispatchInfo {
    pub kind: DispatchKind,
    pub state: KernelDispatchState,
    pub timestamp: Option<Arc<TimestampPacketNode>>,
}

impl DispatchInfo {
    #[must_use]
    pub fn kernel(state: KernelDispatchState) -> Self {
        Self {
            kind: DispatchKind::Kernel,
            state,
            timestamp: None,
        }
    }
}

/// Every walker of one enqueue, in execution order.
#[derive(Debug, Clone, Default)]
pub struct MultiDispatchInfo {
    dispatches: Vec<DispatchInfo>,
}

impl MultiDispatchInfo {
    #[must_use]
    pub fn new(dispatches: Vec<DispatchInfo>) -> Self {
        Self { dispatches }
    }

    pub fn push(&mut self, dispatch: DispatchInfo) {
        self.dispatches.push(dispatch);
    }

    #[must_use]
    pub fn dispatches(&self) -> &[DispatchInfo] {
        &self.dispatches
    }

    pub fn dispatches_mut(&mut self) -> &mut [DispatchInfo] {
        &mut self.dispatches
    }

    pub fn iter(&self) -> impl Iterator<Item = &DispatchInfo> {
        self.dispatches.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.dispatches.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dispatches.is_empty()
    }

    /// The walkers running the user's kernel.
    pub fn kernel_dispatches(&self) -> impl Iterator<Item = &DispatchInfo> {
        self.iter().filter(|d| d.kind == DispatchKind::Kernel)
    }

    #[must_use]
    pub fn has_aux_translation(&self) -> bool {
        self.iter().any(|d| d.kind != DispatchKind::Kernel)
    }

    #[must_use]
    pub fn requires_dc_flush(&self) -> bool {
        self.iter()
            .any(|d| d.state.requires_dc_flush || d.state.uses_printf)
    }

    #[must_use]
    pub fn uses_printf(&self) -> bool {
        self.iter().any(|d| d.state.uses_printf)
    }

    #[must_use]
    pub fn uses_device_side_enqueue(&self) -> bool {
        self.iter().any(|d| d.state.uses_device_side_enqueue)
    }

    #[must_use]
    pub fn requires_large_grf(&self) -> bool {
        self.iter().any(|d| d.state.requires_large_grf)
    }

    #[must_use]
    pub fn slm_used(&self) -> bool {
        self.iter().any(|d| d.state.slm_size > 0)
    }

    #[must_use]
    pub fn per_thread_scratch_size(&self) -> u32 {
        self.iter()
            .map(|d| d.state.per_thread_scratch_size)
            .max()
            .unwrap_or(0)
    }

    /// Timestamp nodes in walker order.
    pub fn timestamp_nodes(&self) -> impl Iterator<Item = &Arc<TimestampPacketNode>> {
        self.iter().filter_map(|d| d.timestamp.as_ref())
    }
}

impl IntoIterator for MultiDispatchInfo {
    type Item = DispatchInfo;
    type IntoIter = std::vec::IntoIter<DispatchInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.dispatches.into_iter()
    }
}

/// Splits one kernel enqueue into walkers.
pub trait DispatchInfoBuilder: Send + Sync {
    fn name(&self) -> &'static str;

    fn build(&self, state: &KernelDispatchState) -> Result<Vec<DispatchInfo>>;
}

/// One walker covering the whole range.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultWalkerBuilder;

impl DispatchInfoBuilder for DefaultWalkerBuilder {
    fn name(&self) -> &'static str {
        "default"
    }

    fn build(&self, state: &KernelDispatchState) -> Result<Vec<DispatchInfo>> {
        Ok(vec![DispatchInfo::kernel(state.clone())])
    }
}

/// Cuts the X dimension into walkers of at most `max_groups_per_walker`
/// groups, each with its own global offset.
#[derive(Debug, Clone, Copy)]
pub struct SplitWalkerBuilder {
    pub max_groups_per_walker: u32,
}

impl DispatchInfoBuilder for SplitWalkerBuilder {
    fn name(&self) -> &'static str {
        "split-x"
    }

    fn build(&self, state: &KernelDispatchState) -> Result<Vec<DispatchInfo>> {
        if self.max_groups_per_walker == 0 {
            return Err(XeError::invalid_argument(
                "split walker needs at least one group per walker",
            ));
        }
        let [groups_x, groups_y, groups_z] = state.group_count;
        let mut dispatches = Vec::new();
        let mut first = 0;
        while first < groups_x {
            let count = self.max_groups_per_walker.min(groups_x - first);
            let mut part = state.clone();
            let offset_x = first
                .checked_mul(state.group_size[0])
                .and_then(|o| o.checked_add(state.global_offset[0]))
                .ok_or_else(|| XeError::invalid_argument("split walker offset overflows u32"))?;
            part.set_walker_geometry(
                [count, groups_y, groups_z],
                [offset_x, state.global_offset[1], state.global_offset[2]],
            )?;
            dispatches.push(DispatchInfo::kernel(part));
            first += count;
        }
        if dispatches.is_empty() {
            dispatches.push(DispatchInfo::kernel(state.clone()));
        }
        Ok(dispatches)
    }
}
