//! A GPU device: memory, engines and the resources kernels are built with.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tracing::info;
use xe_common::{HwInfo, Result, RuntimeConfig, XeError};
use xe_csr::{CommandStreamReceiver, EngineDescriptor, EngineUsage, SimulatedGpu, SubmissionBackend};
use xe_kernel::{DeviceResources, KernelDescriptor, Module, ModuleGlobals};
use xe_memory::{MemoryManager, SvmAllocsManager, SvmCapabilities};

use crate::aux_translation;
use crate::event::ProfilingClock;

const ROOT_DEVICE_INDEX: u32 = 0;

/// One root device and its engines.
pub struct Device {
    hw_info: HwInfo,
    config: RuntimeConfig,
    memory_manager: Arc<MemoryManager>,
    svm: Arc<SvmAllocsManager>,
    engine: Arc<CommandStreamReceiver>,
    internal_engine: Option<Arc<CommandStreamReceiver>>,
    resources: DeviceResources,
    builtins: Mutex<Option<Arc<Module>>>,
    epoch: Instant,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("family", &self.hw_info.family)
            .field("engine", &self.engine.context_id())
            .field(
                "internal_engine",
                &self.internal_engine.as_ref().map(|csr| csr.context_id()),
            )
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Bring up a device submitting through `backend`.
    pub fn new(
        hw_info: HwInfo,
        config: RuntimeConfig,
        memory_manager: Arc<MemoryManager>,
        backend: Arc<dyn SubmissionBackend>,
    ) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|e| XeError::invalid_argument(e.to_string()))?;
        let svm = Arc::new(SvmAllocsManager::new(
            Arc::clone(&memory_manager),
            SvmCapabilities::from(&hw_info.features),
            config.memory.svm_mode,
        ));
        let engine = CommandStreamReceiver::new(
            Arc::clone(&memory_manager),
            Arc::clone(&backend),
            hw_info.clone(),
            EngineDescriptor::regular(ROOT_DEVICE_INDEX),
            &config,
        )?;
        let internal_engine = if config.csr.create_internal_engine {
            Some(CommandStreamReceiver::new(
                Arc::clone(&memory_manager),
                backend,
                hw_info.clone(),
                EngineDescriptor::internal(ROOT_DEVICE_INDEX),
                &config,
            )?)
        } else {
            None
        };
        let resources = DeviceResources::new(
            ROOT_DEVICE_INDEX,
            hw_info.clone(),
            config.kernel.clone(),
            Arc::clone(&memory_manager),
            Arc::clone(&svm),
        );
        info!(
            family = %hw_info.family,
            device = %hw_info.device_name,
            internal_engine = internal_engine.is_some(),
            "device created"
        );
        Ok(Arc::new(Self {
            hw_info,
            config,
            memory_manager,
            svm,
            engine,
            internal_engine,
            resources,
            builtins: Mutex::new(None),
            epoch: Instant::now(),
        }))
    }

    /// A device backed by an in-process [`SimulatedGpu`].
    pub fn simulated(
        hw_info: HwInfo,
        config: RuntimeConfig,
    ) -> Result<(Arc<Self>, Arc<SimulatedGpu>)> {
        let memory_manager = Arc::new(MemoryManager::new(1, config.memory.memory_budget));
        let gpu = Arc::new(SimulatedGpu::new(Arc::clone(&memory_manager)));
        let backend: Arc<dyn SubmissionBackend> = gpu.clone();
        let device = Self::new(hw_info, config, memory_manager, backend)?;
        Ok((device, gpu))
    }

    #[must_use]
    pub const fn hw_info(&self) -> &HwInfo {
        &self.hw_info
    }

    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub const fn root_device_index(&self) -> u32 {
        ROOT_DEVICE_INDEX
    }

    #[must_use]
    pub fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.memory_manager
    }

    #[must_use]
    pub fn svm(&self) -> &Arc<SvmAllocsManager> {
        &self.svm
    }

    #[must_use]
    pub const fn resources(&self) -> &DeviceResources {
        &self.resources
    }

    #[must_use]
    pub fn default_engine(&self) -> &Arc<CommandStreamReceiver> {
        &self.engine
    }

    #[must_use]
    pub fn internal_engine(&self) -> Option<&Arc<CommandStreamReceiver>> {
        self.internal_engine.as_ref()
    }

    /// The engine serving `usage`.
    pub fn engine(&self, usage: EngineUsage) -> Result<&Arc<CommandStreamReceiver>> {
        match usage {
            EngineUsage::Regular => Ok(&self.engine),
            EngineUsage::Internal => self.internal_engine.as_ref().ok_or_else(|| {
                XeError::invalid_operation("device was created without an internal engine")
            }),
        }
    }

    /// Every engine, regular first.
    pub fn engines(&self) -> impl Iterator<Item = &Arc<CommandStreamReceiver>> {
        std::iter::once(&self.engine).chain(self.internal_engine.iter())
    }

    pub fn create_module(&self, descriptors: Vec<KernelDescriptor>) -> Result<Module> {
        Module::new(self.resources.clone(), descriptors)
    }

    pub fn create_module_with_globals(
        &self,
        descriptors: Vec<KernelDescriptor>,
        globals: &ModuleGlobals,
    ) -> Result<Module> {
        Module::with_globals(self.resources.clone(), descriptors, globals)
    }

    /// Driver builtin kernels, built on first use.
    pub fn builtin_module(&self) -> Result<Arc<Module>> {
        let mut builtins = self.builtins.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(module) = builtins.as_ref() {
            return Ok(Arc::clone(module));
        }
        let module = Arc::new(self.create_module(aux_translation::builtin_descriptors())?);
        *builtins = Some(Arc::clone(&module));
        Ok(module)
    }

    /// Nanoseconds since the device came up.
    #[must_use]
    pub fn host_timestamp_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    pub(crate) fn profiling_clock(&self) -> ProfilingClock {
        ProfilingClock {
            epoch: self.epoch,
            timestamp_period_ns: self.hw_info.traits().timestamp_period_ns,
        }
    }

    /// Convert GPU timestamp ticks to nanoseconds.
    #[must_use]
    pub fn ticks_to_ns(&self, ticks: u64) -> u64 {
        (ticks as f64 * self.hw_info.traits().timestamp_period_ns) as u64
    }

    /// Flush every engine and wait for everything it was sent.
    pub fn synchronize(&self) -> Result<bool> {
        let mut completed = true;
        for engine in self.engines() {
            engine.flush()?;
            completed &= engine.wait_for_task_count(engine.latest_sent_task_count());
        }
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xe_common::HwFamily;

    #[test]
    fn internal_engine_follows_config() {
        let (device, _gpu) = Device::simulated(HwInfo::default(), RuntimeConfig::default()).unwrap();
        assert!(device.internal_engine().is_none());
        assert!(matches!(
            device.engine(EngineUsage::Internal),
            Err(XeError::InvalidOperation { .. })
        ));

        let mut config = RuntimeConfig::default();
        config.csr.create_internal_engine = true;
        let (device, _gpu) = Device::simulated(HwInfo::for_family(HwFamily::XeHpg), config).unwrap();
        let internal = device.engine(EngineUsage::Internal).unwrap();
        assert_ne!(internal.context_id(), device.default_engine().context_id());
        assert_eq!(device.engines().count(), 2);
    }

    #[test]
    fn builtin_module_is_built_once() {
        let (device, _gpu) = Device::simulated(HwInfo::default(), RuntimeConfig::default()).unwrap();
        let first = device.builtin_module().unwrap();
        let second = device.builtin_module().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.kernel_data(aux_translation::AUX_TRANSLATION_KERNEL).is_some());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.csr.command_buffer_size = 0;
        let err = Device::simulated(HwInfo::default(), config).unwrap_err();
        assert!(matches!(err, XeError::InvalidArgument { .. }));
    }
}
