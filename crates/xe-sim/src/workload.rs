//! Synthetic dispatch workload run against the simulated GPU.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{debug, info, instrument};
use xe_common::{HwFamily, HwInfo, RuntimeConfig};
use xe_csr::{CsrStats, SimStats};
use xe_dispatch::{
    CommandList, CommandQueue, Device, EnqueueOptions, Event, ExecutionStatus, NdRange, ProfilingInfo,
    QueueProperties, QueueStats, SignalEvent, WaitStatus,
};
use xe_kernel::{Kernel, KernelDescriptor, Module};
use xe_memory::SvmAllocationProperties;

/// Knobs of one simulated run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadPlan {
    pub family: HwFamily,
    pub kernels: u32,
    pub global_size: u32,
    pub local_size: Option<u32>,
    pub simd: u32,
    pub out_of_order: bool,
    pub profiling: bool,
    /// Park the first half of the kernels behind a user event.
    pub user_event: bool,
    /// Record the kernel once more into a command list and execute it.
    pub command_list: bool,
    pub buffer_size: usize,
}

impl Default for WorkloadPlan {
    fn default() -> Self {
        Self {
            family: HwFamily::Gen12Lp,
            kernels: 4,
            global_size: 1024,
            local_size: None,
            simd: 16,
            out_of_order: false,
            profiling: false,
            user_event: false,
            command_list: false,
            buffer_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkloadReport {
    pub family: HwFamily,
    pub device_name: String,
    pub walkers_executed: usize,
    pub page_faults: usize,
    pub final_task_count: u32,
    pub queue: QueueStats,
    pub engine: CsrStats,
    pub gpu: SimStats,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub profiling: Vec<ProfilingInfo>,
}

impl std::fmt::Display for WorkloadReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "device:            {} ({})", self.device_name, self.family)?;
        writeln!(f, "walkers executed:  {}", self.walkers_executed)?;
        writeln!(f, "page faults:       {}", self.page_faults)?;
        writeln!(f, "final task count:  {}", self.final_task_count)?;
        writeln!(
            f,
            "queue:             {} kernels, {} markers, {} barriers, {} blocked, {} replayed",
            self.queue.kernels,
            self.queue.markers,
            self.queue.barriers,
            self.queue.blocked_commands,
            self.queue.replayed_commands
        )?;
        writeln!(
            f,
            "engine:            {} flushes, {} submissions, {} SBA programs, residency peak {}",
            self.engine.flush_tasks,
            self.engine.submissions,
            self.engine.state_base_address_programmed,
            self.engine.residency_peak
        )?;
        write!(
            f,
            "gpu:               {} batches, {} commands, {} evictions",
            self.gpu.batches_completed, self.gpu.commands_executed, self.gpu.evictions
        )?;
        for (index, info) in self.profiling.iter().enumerate() {
            write!(
                f,
                "\nkernel {index}:          {} ns on device",
                info.end_ns.saturating_sub(info.start_ns)
            )?;
        }
        Ok(())
    }
}

fn saxpy_module(device: &Device, simd: u32) -> Result<Module> {
    Ok(device.create_module(vec![
        KernelDescriptor::builder("saxpy", simd)
            .pointer_arg()
            .pointer_arg()
            .value_arg(4)
            .dispatch_traits()
            .build(),
    ])?)
}

fn saxpy_kernel(device: &Device, module: &Module, buffer_size: usize) -> Result<Kernel> {
    let svm = device.svm();
    let x = svm.create_device_alloc(buffer_size, &SvmAllocationProperties::default(), 0)?;
    let y = svm.create_device_alloc(buffer_size, &SvmAllocationProperties::default(), 0)?;
    let mut kernel = module.create_kernel("saxpy")?;
    kernel.set_arg_buffer(0, Some(x))?;
    kernel.set_arg_buffer(1, Some(y))?;
    kernel.set_arg_immediate(2, 4, Some(&2.0f32.to_le_bytes()))?;
    Ok(kernel)
}

/// Run `plan` on a fresh simulated device and collect its statistics.
#[instrument(skip(config), fields(family = %plan.family, kernels = plan.kernels))]
pub fn run(plan: &WorkloadPlan, config: RuntimeConfig) -> Result<WorkloadReport> {
    if plan.kernels == 0 {
        bail!("the workload needs at least one kernel");
    }
    let (device, gpu) = Device::simulated(HwInfo::for_family(plan.family), config)
        .context("failed to create the simulated device")?;
    let module = saxpy_module(&device, plan.simd)?;
    let mut kernel = saxpy_kernel(&device, &module, plan.buffer_size)?;
    let queue = CommandQueue::new(
        &device,
        QueueProperties {
            out_of_order: plan.out_of_order,
            profiling: plan.profiling,
            ..QueueProperties::default()
        },
    )?;

    let mut range = NdRange::linear(plan.global_size);
    if let Some(local) = plan.local_size {
        range = range.with_local_size([local, 1, 1]);
    }

    let gate = plan.user_event.then(Event::new_user);
    let mut events = Vec::with_capacity(plan.kernels as usize);
    for index in 0..plan.kernels {
        let mut options = EnqueueOptions::new();
        if let Some(gate) = gate.as_ref().filter(|_| index < plan.kernels / 2) {
            options = options.wait_for(&[Arc::clone(gate)]);
        }
        let event = queue
            .enqueue_kernel(&mut kernel, &range, &options)
            .with_context(|| format!("enqueue of kernel {index} failed"))?
            .context("enqueue returned no event")?;
        debug!(index, event = event.id(), "kernel enqueued");
        events.push(event);
    }

    let barrier = queue.enqueue_barrier(&[])?;
    if let Some(gate) = &gate {
        info!(blocked = queue.has_blocked_work(), "releasing user event");
        gate.set_user_event_status(ExecutionStatus::Complete)?;
    }
    if Event::wait_for_events(&[&barrier])? != WaitStatus::Ready {
        bail!("barrier did not complete");
    }

    if plan.command_list {
        let signal = SignalEvent::new(&device)?;
        let mut list = CommandList::new(&device);
        let group_size = kernel.suggest_group_size([plan.global_size, 1, 1], 1);
        kernel.set_group_size(group_size)?;
        let groups = plan.global_size.div_ceil(group_size[0]);
        list.append_launch_kernel(&mut kernel, [groups, 1, 1], Some(&signal), &[])?;
        list.close()?;
        let executed = queue.execute_command_lists(&[&list])?;
        if executed.wait()? != WaitStatus::Ready || !signal.is_signalled() {
            bail!("command list did not complete");
        }
    }

    queue.enqueue_marker()?;
    if queue.finish()? != WaitStatus::Ready {
        bail!("queue still has blocked work after finish");
    }

    let profiling = if plan.profiling {
        events
            .iter()
            .map(|event| event.profiling_info())
            .collect::<xe_common::Result<Vec<_>>>()?
    } else {
        Vec::new()
    };

    let report = WorkloadReport {
        family: plan.family,
        device_name: device.hw_info().device_name.clone(),
        walkers_executed: gpu.executed_walkers().len(),
        page_faults: gpu.page_faults().len(),
        final_task_count: queue.task_count(),
        queue: queue.stats(),
        engine: queue.csr().stats(),
        gpu: gpu.stats(),
        profiling,
    };
    info!(
        walkers = report.walkers_executed,
        page_faults = report.page_faults,
        task_count = report.final_task_count,
        "workload finished"
    );
    Ok(report)
}
