//! OpenCL devices through `opencl3`.

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::{get_all_devices, Device, CL_DEVICE_TYPE_GPU};
use opencl3::error_codes::ClError;
use opencl3::event::{wait_for_events, Event, CL_COMPLETE};
use opencl3::kernel::Kernel;
use opencl3::memory::{Buffer, ClMem};
use opencl3::platform::Platform;
use opencl3::program::Program;
use opencl3::types::{cl_device_id, cl_event, CL_BLOCKING, CL_NON_BLOCKING};
use tracing::{debug, warn};

use super::{
    AllocationKind, AllocationRequest, BackendError, BuildFailure, ComputeBackend,
    DeviceDescription, LaunchGeometry, SignalId,
};

const BACKEND_NAME: &str = "opencl";
const INVALID_BUILD_OPTIONS: i32 = -43;
const BUILD_PROGRAM_FAILURE: i32 = -11;
const INVALID_KERNEL_NAME: i32 = -46;

fn api(api: &'static str) -> impl Fn(ClError) -> BackendError {
    move |err| BackendError::Api { api, code: err.0 }
}

/// Every GPU the installed OpenCL platforms expose.
pub fn enumerate_gpus() -> Result<Vec<OpenClDevice>, BackendError> {
    let ids = get_all_devices(CL_DEVICE_TYPE_GPU).map_err(api("clGetDeviceIDs"))?;
    let mut devices = Vec::with_capacity(ids.len());
    for id in ids {
        match OpenClDevice::open(id) {
            Ok(device) => devices.push(device),
            Err(err) => warn!(error = %err, "skipping OpenCL device"),
        }
    }
    Ok(devices)
}

pub struct OpenClDevice {
    device_id: cl_device_id,
    context: Context,
    platform: String,
    name: String,
    max_allocation: usize,
    next_signal: AtomicU64,
}

impl OpenClDevice {
    pub fn open(device_id: cl_device_id) -> Result<Self, BackendError> {
        let device = Device::new(device_id);
        let name = device.name().unwrap_or_default().trim().to_string();
        let platform = device
            .platform()
            .map(|id| Platform::new(id).name().unwrap_or_default())
            .unwrap_or_default()
            .trim()
            .to_string();
        let max_allocation = device.max_mem_alloc_size().map_err(api("clGetDeviceInfo"))? as usize;
        let context = Context::from_device(&device).map_err(api("clCreateContext"))?;
        debug!(%name, %platform, max_allocation, "opened OpenCL device");
        Ok(Self {
            device_id,
            context,
            platform,
            name,
            max_allocation,
            next_signal: AtomicU64::new(1),
        })
    }

    fn check_host_data(request: &AllocationRequest<'_>, len: usize) -> Result<(), BackendError> {
        match (request.flags.takes_host_data(), request.initial) {
            (true, Some(data)) if data.len() == len => Ok(()),
            (false, None) => Ok(()),
            _ => Err(BackendError::InvalidHostData),
        }
    }
}

impl fmt::Debug for OpenClDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenClDevice")
            .field("name", &self.name)
            .field("platform", &self.platform)
            .finish()
    }
}

pub struct OpenClMemory {
    buffer: Buffer<u8>,
    len: usize,
}

impl OpenClMemory {
    fn check_range(&self, offset: usize, len: usize) -> Result<(), BackendError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(BackendError::OutOfBounds {
                offset,
                len,
                size: self.len,
            }),
        }
    }
}

/// A pending non-blocking read. The host buffer must outlive the transfer, so
/// dropping an unfinished signal waits for it.
pub struct OpenClSignal {
    id: SignalId,
    event: Event,
    host: Vec<u8>,
    settled: bool,
}

impl Drop for OpenClSignal {
    fn drop(&mut self) {
        if !self.settled {
            if let Err(err) = self.event.wait() {
                warn!(signal = %self.id, error = %err, "read failed while dropping signal");
            }
        }
    }
}

impl ComputeBackend for OpenClDevice {
    type Memory = OpenClMemory;
    type Program = Program;
    type Kernel = Kernel;
    type Queue = CommandQueue;
    type Signal = OpenClSignal;

    fn describe(&self) -> DeviceDescription {
        DeviceDescription {
            backend: BACKEND_NAME,
            platform: self.platform.clone(),
            device: self.name.clone(),
        }
    }

    fn allocate(&self, request: &AllocationRequest<'_>) -> Result<OpenClMemory, BackendError> {
        if !request.flags.is_valid() {
            return Err(BackendError::InvalidFlags(request.flags.bits()));
        }
        let len = match request.kind {
            AllocationKind::Buffer { bytes } => bytes,
            AllocationKind::Image(_) => return Err(BackendError::Unsupported("image allocation")),
        };
        if len == 0 {
            return Err(BackendError::ZeroSize);
        }
        if len > self.max_allocation {
            return Err(BackendError::TooLarge {
                requested: len,
                limit: self.max_allocation,
            });
        }
        Self::check_host_data(request, len)?;

        let host = match request.initial {
            Some(data) if request.flags.takes_host_data() => data.as_ptr() as *mut _,
            _ => ptr::null_mut(),
        };
        // SAFETY: with COPY_HOST_PTR the driver copies `len` bytes out of
        // `initial` before returning; the length was checked above.
        let buffer = unsafe { Buffer::<u8>::create(&self.context, request.flags.bits(), len, host) }
            .map_err(api("clCreateBuffer"))?;
        debug!(device = %self.name, name = request.name, len, "allocated buffer");
        Ok(OpenClMemory { buffer, len })
    }

    fn build_program(&self, source: &str, options: &str) -> Result<Program, BuildFailure> {
        let mut program = Program::create_from_source(&self.context, source).map_err(|err| BuildFailure {
            error: api("clCreateProgramWithSource")(err),
            log: String::new(),
        })?;
        if let Err(err) = program.build(self.context.devices(), options) {
            let log = program.get_build_log(self.device_id).unwrap_or_default();
            let error = match err.0 {
                INVALID_BUILD_OPTIONS => BackendError::InvalidBuildOptions,
                BUILD_PROGRAM_FAILURE => BackendError::BuildFailed,
                code => BackendError::Api {
                    api: "clBuildProgram",
                    code,
                },
            };
            return Err(BuildFailure { error, log });
        }
        Ok(program)
    }

    fn create_kernel(&self, program: &Program, entry_point: &str) -> Result<Kernel, BackendError> {
        Kernel::create(program, entry_point).map_err(|err| match err.0 {
            INVALID_KERNEL_NAME => BackendError::UnknownEntryPoint(entry_point.to_string()),
            code => BackendError::Api {
                api: "clCreateKernel",
                code,
            },
        })
    }

    fn set_memory_arg(&self, kernel: &Kernel, index: u32, memory: &OpenClMemory) -> Result<(), BackendError> {
        // SAFETY: the argument is a live cl_mem handle owned by the catalog.
        unsafe { kernel.set_arg(index, &memory.buffer.get()) }.map_err(api("clSetKernelArg"))
    }

    fn set_bytes_arg(&self, kernel: &Kernel, index: u32, bytes: &[u8]) -> Result<(), BackendError> {
        // SAFETY: each arm passes a plain value of exactly the immediate's width.
        let set = unsafe {
            match *bytes {
                [a] => kernel.set_arg(index, &a),
                [a, b] => kernel.set_arg(index, &u16::from_le_bytes([a, b])),
                [a, b, c, d] => kernel.set_arg(index, &u32::from_le_bytes([a, b, c, d])),
                [a, b, c, d, e, f, g, h] => {
                    kernel.set_arg(index, &u64::from_le_bytes([a, b, c, d, e, f, g, h]))
                }
                _ => return Err(BackendError::InvalidArgSize(bytes.len())),
            }
        };
        set.map_err(api("clSetKernelArg"))
    }

    fn create_queue(&self) -> Result<CommandQueue, BackendError> {
        #[allow(deprecated)]
        CommandQueue::create_default(&self.context, 0).map_err(api("clCreateCommandQueue"))
    }

    fn write_blocking(
        &self,
        queue: &CommandQueue,
        memory: &mut OpenClMemory,
        offset: usize,
        data: &[u8],
    ) -> Result<(), BackendError> {
        memory.check_range(offset, data.len())?;
        // SAFETY: blocking write, so `data` is only read before this returns.
        unsafe { queue.enqueue_write_buffer(&mut memory.buffer, CL_BLOCKING, offset, data, &[]) }
            .map_err(api("clEnqueueWriteBuffer"))?;
        Ok(())
    }

    fn read_blocking(&self, queue: &CommandQueue, memory: &OpenClMemory, len: usize) -> Result<Vec<u8>, BackendError> {
        memory.check_range(0, len)?;
        let mut host = vec![0u8; len];
        // SAFETY: blocking read into a host buffer of the requested length.
        unsafe { queue.enqueue_read_buffer(&memory.buffer, CL_BLOCKING, 0, &mut host, &[]) }
            .map_err(api("clEnqueueReadBuffer"))?;
        Ok(host)
    }

    fn enqueue_kernel(&self, queue: &CommandQueue, kernel: &Kernel, geometry: &LaunchGeometry) -> Result<(), BackendError> {
        geometry.validate()?;
        // SAFETY: the three arrays hold at least `dims` entries each.
        unsafe {
            queue.enqueue_nd_range_kernel(
                kernel.get(),
                geometry.dims as u32,
                geometry.offset.as_ptr(),
                geometry.global.as_ptr(),
                geometry.local.as_ptr(),
                &[],
            )
        }
        .map_err(api("clEnqueueNDRangeKernel"))?;
        Ok(())
    }

    fn enqueue_read(&self, queue: &CommandQueue, memory: &OpenClMemory, len: usize) -> Result<OpenClSignal, BackendError> {
        memory.check_range(0, len)?;
        let mut host = vec![0u8; len];
        // SAFETY: the heap block behind `host` moves into the signal with the
        // event and is not touched again until the event completes.
        let event = unsafe { queue.enqueue_read_buffer(&memory.buffer, CL_NON_BLOCKING, 0, &mut host, &[]) }
            .map_err(api("clEnqueueReadBuffer"))?;
        // Reads only start once the queue is flushed.
        queue.flush().map_err(api("clFlush"))?;
        Ok(OpenClSignal {
            id: SignalId(self.next_signal.fetch_add(1, Ordering::Relaxed)),
            event,
            host,
            settled: false,
        })
    }

    fn signal_id(&self, signal: &OpenClSignal) -> SignalId {
        signal.id
    }

    fn is_complete(&self, signal: &OpenClSignal) -> Result<bool, BackendError> {
        let status = signal
            .event
            .command_execution_status()
            .map_err(api("clGetEventInfo"))?;
        if status.0 < 0 {
            return Err(BackendError::Api {
                api: "clEnqueueReadBuffer",
                code: status.0,
            });
        }
        Ok(status.0 == CL_COMPLETE)
    }

    fn wait(&self, signals: &[&OpenClSignal]) -> Result<(), BackendError> {
        if signals.is_empty() {
            return Ok(());
        }
        let events: Vec<cl_event> = signals.iter().map(|signal| signal.event.get()).collect();
        wait_for_events(&events).map_err(api("clWaitForEvents"))
    }

    fn take_read(&self, mut signal: OpenClSignal) -> Result<Vec<u8>, BackendError> {
        signal.event.wait().map_err(api("clWaitForEvents"))?;
        signal.settled = true;
        Ok(std::mem::take(&mut signal.host))
    }
}
