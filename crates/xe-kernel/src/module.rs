//! Modules and the per-kernel state they share across kernel instances.

use std::sync::Arc;

use tracing::{debug, info};
use xe_common::config::KernelConfig;
use xe_common::{FamilyTraits, HwInfo, Result, XeError};
use xe_memory::{
    AllocationProperties, AllocationType, GraphicsAllocation, MemoryManager, OwnedAllocation,
    SvmAllocsManager,
};

use crate::descriptor::KernelDescriptor;
use crate::image::{ImageSurfaceEncoder, LinearImageSurfaceEncoder};
use crate::kernel::Kernel;
use crate::sampler::{BasicSamplerStateEncoder, SamplerStateEncoder};

/// Everything a module needs from the device it is built for.
#[derive(Debug, Clone)]
pub struct DeviceResources {
    pub root_device_index: u32,
    pub hw_info: HwInfo,
    pub config: KernelConfig,
    pub memory_manager: Arc<MemoryManager>,
    pub svm: Arc<SvmAllocsManager>,
    pub image_encoder: Arc<dyn ImageSurfaceEncoder>,
    pub sampler_encoder: Arc<dyn SamplerStateEncoder>,
}

impl DeviceResources {
    #[must_use]
    pub fn new(
        root_device_index: u32,
        hw_info: HwInfo,
        config: KernelConfig,
        memory_manager: Arc<MemoryManager>,
        svm: Arc<SvmAllocsManager>,
    ) -> Self {
        Self {
            root_device_index,
            hw_info,
            config,
            memory_manager,
            svm,
            image_encoder: Arc::new(LinearImageSurfaceEncoder),
            sampler_encoder: Arc::new(BasicSamplerStateEncoder),
        }
    }

    #[must_use]
    pub fn traits(&self) -> &'static FamilyTraits {
        self.hw_info.traits()
    }
}

/// Initial contents of module-scope surfaces.
#[derive(Debug, Clone, Default)]
pub struct ModuleGlobals {
    pub constants: Vec<u8>,
    pub variables: Vec<u8>,
}

/// Module-scope surfaces; freed once the last kernel data referencing them
/// is gone.
struct ModuleSurfaces {
    memory_manager: Arc<MemoryManager>,
    constants: Option<OwnedAllocation>,
    variables: Option<OwnedAllocation>,
}

impl ModuleSurfaces {
    fn create(resources: &DeviceResources, globals: &ModuleGlobals) -> Result<Self> {
        let mut surfaces = Self {
            memory_manager: Arc::clone(&resources.memory_manager),
            constants: None,
            variables: None,
        };
        surfaces.constants =
            Self::upload(resources, &globals.constants, AllocationType::ConstantSurface)?;
        surfaces.variables =
            Self::upload(resources, &globals.variables, AllocationType::GlobalSurface)?;
        Ok(surfaces)
    }

    fn upload(
        resources: &DeviceResources,
        contents: &[u8],
        allocation_type: AllocationType,
    ) -> Result<Option<OwnedAllocation>> {
        if contents.is_empty() {
            return Ok(None);
        }
        let allocation = resources.memory_manager.allocate(&AllocationProperties::new(
            resources.root_device_index,
            contents.len(),
            allocation_type,
        ))?;
        if let Err(err) = allocation.write_at(0, contents) {
            resources.memory_manager.free(allocation);
            return Err(err);
        }
        Ok(Some(allocation))
    }
}

impl Drop for ModuleSurfaces {
    fn drop(&mut self) {
        for surface in [self.constants.take(), self.variables.take()].into_iter().flatten() {
            self.memory_manager.check_gpu_usage_and_free(surface, true);
        }
    }
}

/// Compile-time-fixed state of one kernel, shared by all its instances.
pub struct KernelImmutableData {
    descriptor: KernelDescriptor,
    memory_manager: Arc<MemoryManager>,
    isa: Option<OwnedAllocation>,
    isa_view: Arc<GraphicsAllocation>,
    surfaces: Arc<ModuleSurfaces>,
}

impl std::fmt::Debug for KernelImmutableData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelImmutableData")
            .field("name", &self.descriptor.name)
            .field("isa", &self.isa_view.id())
            .finish_non_exhaustive()
    }
}

impl KernelImmutableData {
    fn create(
        resources: &DeviceResources,
        mut descriptor: KernelDescriptor,
        surfaces: Arc<ModuleSurfaces>,
    ) -> Result<Self> {
        descriptor.validate()?;
        if descriptor.isa.is_empty() {
            return Err(XeError::invalid_argument(format!(
                "kernel {} has no ISA",
                descriptor.name
            )));
        }
        let size = descriptor.attributes.cross_thread_data_size;
        descriptor.cross_thread_data.resize(size, 0);

        let padding = resources.traits().isa_padding;
        let isa = resources.memory_manager.allocate(&AllocationProperties::new(
            resources.root_device_index,
            descriptor.isa.len() + padding,
            AllocationType::KernelIsa,
        ))?;
        if let Err(err) = isa.write_at(0, &descriptor.isa) {
            resources.memory_manager.free(isa);
            return Err(err);
        }
        debug!(
            kernel = %descriptor.name,
            id = %isa.id(),
            isa_bytes = descriptor.isa.len(),
            padding,
            "kernel ISA uploaded"
        );
        Ok(Self {
            descriptor,
            memory_manager: Arc::clone(&resources.memory_manager),
            isa_view: isa.share(),
            isa: Some(isa),
            surfaces,
        })
    }

    #[must_use]
    pub const fn descriptor(&self) -> &KernelDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    #[must_use]
    pub const fn isa_allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.isa_view
    }

    #[must_use]
    pub fn cross_thread_template(&self) -> &[u8] {
        &self.descriptor.cross_thread_data
    }

    #[must_use]
    pub fn surface_state_template(&self) -> &[u8] {
        &self.descriptor.surface_state_heap
    }

    #[must_use]
    pub fn dynamic_state_template(&self) -> &[u8] {
        &self.descriptor.dynamic_state_heap
    }

    #[must_use]
    pub fn global_constants(&self) -> Option<Arc<GraphicsAllocation>> {
        self.surfaces.constants.as_ref().map(OwnedAllocation::share)
    }

    #[must_use]
    pub fn global_variables(&self) -> Option<Arc<GraphicsAllocation>> {
        self.surfaces.variables.as_ref().map(OwnedAllocation::share)
    }

    /// Allocations every dispatch of this kernel must make resident.
    #[must_use]
    pub fn static_residency(&self) -> Vec<Arc<GraphicsAllocation>> {
        let mut residency = vec![Arc::clone(&self.isa_view)];
        residency.extend(self.global_constants());
        residency.extend(self.global_variables());
        residency
    }
}

impl Drop for KernelImmutableData {
    fn drop(&mut self) {
        if let Some(isa) = self.isa.take() {
            self.memory_manager.check_gpu_usage_and_free(isa, true);
        }
    }
}

/// A set of kernels built together for one device.
#[derive(Debug)]
pub struct Module {
    resources: DeviceResources,
    kernels: Vec<Arc<KernelImmutableData>>,
}

impl Module {
    pub fn new(resources: DeviceResources, descriptors: Vec<KernelDescriptor>) -> Result<Self> {
        Self::with_globals(resources, descriptors, &ModuleGlobals::default())
    }

    /// Build a module whose kernels share constant and global surfaces.
    pub fn with_globals(
        resources: DeviceResources,
        descriptors: Vec<KernelDescriptor>,
        globals: &ModuleGlobals,
    ) -> Result<Self> {
        let surfaces = Arc::new(ModuleSurfaces::create(&resources, globals)?);
        let mut kernels = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if kernels
                .iter()
                .any(|k: &Arc<KernelImmutableData>| k.name() == descriptor.name)
            {
                return Err(XeError::invalid_argument(format!(
                    "duplicate kernel {} in module",
                    descriptor.name
                )));
            }
            kernels.push(Arc::new(KernelImmutableData::create(
                &resources,
                descriptor,
                Arc::clone(&surfaces),
            )?));
        }
        info!(
            kernels = kernels.len(),
            family = %resources.hw_info.family,
            "module built"
        );
        Ok(Self { resources, kernels })
    }

    #[must_use]
    pub const fn resources(&self) -> &DeviceResources {
        &self.resources
    }

    pub fn kernel_names(&self) -> impl Iterator<Item = &str> {
        self.kernels.iter().map(|k| k.name())
    }

    #[must_use]
    pub fn kernel_data(&self, name: &str) -> Option<&Arc<KernelImmutableData>> {
        self.kernels.iter().find(|k| k.name() == name)
    }

    /// Instantiate `name` with its own argument state.
    pub fn create_kernel(&self, name: &str) -> Result<Kernel> {
        let data = self.kernel_data(name).ok_or_else(|| {
            XeError::invalid_argument(format!("module has no kernel named {name}"))
        })?;
        Kernel::new(Arc::clone(data), &self.resources)
    }
}
