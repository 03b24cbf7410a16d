use std::sync::Arc;

use xe_common::HwInfo;
use xe_common::config::{KernelConfig, SvmModeOverride};
use xe_memory::{MemoryManager, SvmAllocsManager, SvmCapabilities};

use crate::module::DeviceResources;

pub(crate) fn resources() -> DeviceResources {
    let mm = Arc::new(MemoryManager::new(1, 0));
    let svm = Arc::new(SvmAllocsManager::new(
        Arc::clone(&mm),
        SvmCapabilities::default(),
        SvmModeOverride::Auto,
    ));
    DeviceResources::new(0, HwInfo::default(), KernelConfig::default(), mm, svm)
}
