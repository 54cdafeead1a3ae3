//! A declared algorithm: its resources, bound kernels and dispatch order.

use std::fmt;
use std::sync::Arc;

use clkvc_oracle::Header;
use serde::Serialize;
use tracing::trace;

use crate::backend::{ComputeBackend, LaunchGeometry};
use crate::error::{CheckError, CheckResult, DispatchFailure};
use crate::kernels::{declare_kernels, BoundKernel, KernelDescriptor, KernelSourceProvider, WorkGroupShape};
use crate::resources::{ResourceCatalog, ResourceDescriptor};
use crate::signature::VersionSignature;
use crate::special::SpecialValueResolver;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AlgorithmIdentity {
    pub algorithm: String,
    pub implementation: String,
    pub version: String,
}

impl AlgorithmIdentity {
    pub fn new(
        algorithm: impl Into<String>,
        implementation: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            algorithm: algorithm.into(),
            implementation: implementation.into(),
            version: version.into(),
        }
    }

    /// `algorithm.implementation`, the name used in logs and error messages.
    pub fn presentation(&self) -> String {
        format!("{}.{}", self.algorithm, self.implementation)
    }
}

impl fmt::Display for AlgorithmIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.algorithm, self.implementation, self.version)
    }
}

/// Byte order the kernels expect the uploaded header in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum HeaderByteOrder {
    #[default]
    AsIs,
    /// Every 32-bit word byte-reversed.
    SwapWords,
}

impl HeaderByteOrder {
    pub fn apply(self, header: &Header) -> Header {
        let mut out = *header;
        if self == Self::SwapWords {
            for word in out.chunks_exact_mut(4) {
                word.reverse();
            }
        }
        out
    }
}

/// Everything needed to declare one algorithm implementation on a device.
#[derive(Debug, Clone)]
pub struct AlgorithmTable {
    pub identity: AlgorithmIdentity,
    pub byte_order: HeaderByteOrder,
    pub resources: Vec<ResourceDescriptor>,
    pub kernels: Vec<KernelDescriptor>,
}

impl AlgorithmTable {
    /// Attaches creation-time content to a declared buffer. Returns false when
    /// no resource has that name.
    pub fn set_initial(&mut self, name: &str, data: Vec<u8>) -> bool {
        match self.resources.iter_mut().find(|resource| resource.name == name) {
            Some(resource) => {
                *resource = resource.clone().with_initial(data);
                true
            }
            None => false,
        }
    }
}

pub struct AlgorithmInstance<B: ComputeBackend> {
    backend: Arc<B>,
    identity: AlgorithmIdentity,
    byte_order: HeaderByteOrder,
    catalog: ResourceCatalog<B::Memory>,
    kernels: Vec<BoundKernel<B>>,
    signature: VersionSignature,
}

impl<B: ComputeBackend> AlgorithmInstance<B> {
    /// Declares the table's resources, then builds and binds its kernels in
    /// order. The first failure aborts the whole build.
    pub fn build(
        backend: Arc<B>,
        table: &AlgorithmTable,
        sources: &dyn KernelSourceProvider,
        resolver: &dyn SpecialValueResolver<B::Memory>,
    ) -> CheckResult<Self> {
        let mut catalog = ResourceCatalog::new();
        catalog.declare_resources(backend.as_ref(), &table.resources)?;
        let (kernels, signature) = declare_kernels(
            backend.as_ref(),
            &table.identity,
            &table.kernels,
            &catalog,
            sources,
            resolver,
        )?;
        Ok(Self {
            backend,
            identity: table.identity.clone(),
            byte_order: table.byte_order,
            catalog,
            kernels,
            signature,
        })
    }

    pub fn identity(&self) -> &AlgorithmIdentity {
        &self.identity
    }

    pub fn byte_order(&self) -> HeaderByteOrder {
        self.byte_order
    }

    pub fn signature(&self) -> VersionSignature {
        self.signature
    }

    pub fn catalog(&self) -> &ResourceCatalog<B::Memory> {
        &self.catalog
    }

    pub fn kernels(&self) -> &[BoundKernel<B>] {
        &self.kernels
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Enqueues every kernel once, in declaration order, over `count` hashes
    /// starting at `nonce_base`. `late` supplies the objects for late-bound
    /// parameters, indexed by slot.
    pub fn run_iteration(
        &self,
        queue: &B::Queue,
        nonce_base: u32,
        count: usize,
        late: &[&B::Memory],
    ) -> CheckResult<()> {
        let presentation = self.identity.presentation();
        for (kernel_index, bound) in self.kernels.iter().enumerate() {
            let fail = |failure: DispatchFailure| CheckError::Dispatch {
                algorithm: presentation.clone(),
                kernel_index,
                failure,
            };
            for deferred in bound.deferred() {
                let memory = late
                    .get(deferred.slot)
                    .ok_or_else(|| fail(DispatchFailure::MissingLateSlot { slot: deferred.slot }))?;
                self.backend
                    .set_memory_arg(bound.kernel(), deferred.index, memory)
                    .map_err(|err| fail(DispatchFailure::Backend(err)))?;
            }
            let geometry = launch_geometry(&bound.descriptor().shape, nonce_base, count);
            trace!(
                algorithm = %presentation,
                kernel = kernel_index,
                nonce_base,
                count,
                "enqueue kernel"
            );
            self.backend
                .enqueue_kernel(queue, bound.kernel(), &geometry)
                .map_err(|err| fail(DispatchFailure::Backend(err)))?;
        }
        Ok(())
    }

    /// Blocking read of a declared buffer's full contents.
    pub fn read_resource(&self, queue: &B::Queue, name: &str) -> CheckResult<Vec<u8>> {
        let memory = self.catalog.memory(name).ok_or_else(|| {
            CheckError::Protocol(format!("{} declares no buffer named {name}", self.identity.presentation()))
        })?;
        let len = self
            .catalog
            .descriptor(name)
            .map(ResourceDescriptor::footprint)
            .unwrap_or_default();
        self.backend
            .read_blocking(queue, memory, len)
            .map_err(|source| CheckError::Transfer {
                algorithm: self.identity.presentation(),
                what: "resource read",
                source,
            })
    }

    /// Blocking write into a declared buffer.
    pub fn write_resource(
        &mut self,
        queue: &B::Queue,
        name: &str,
        offset: usize,
        data: &[u8],
    ) -> CheckResult<()> {
        let presentation = self.identity.presentation();
        let memory = self.catalog.memory_mut(name).ok_or_else(|| {
            CheckError::Protocol(format!("{presentation} declares no buffer named {name}"))
        })?;
        self.backend
            .write_blocking(queue, memory, offset, data)
            .map_err(|source| CheckError::Transfer {
                algorithm: presentation,
                what: "resource write",
                source,
            })
    }
}

/// One hash per work item along the last dimension; earlier dimensions span a
/// single work group.
pub fn launch_geometry(shape: &WorkGroupShape, nonce_base: u32, count: usize) -> LaunchGeometry {
    let dims = shape.dims();
    let last = dims - 1;
    let mut geometry = LaunchGeometry {
        dims,
        offset: [0; 3],
        global: [1; 3],
        local: [1; 3],
    };
    for dim in 0..dims {
        geometry.local[dim] = shape.extent(dim);
        geometry.global[dim] = shape.extent(dim);
    }
    geometry.offset[last] = nonce_base as usize;
    geometry.global[last] = count;
    geometry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::emulated::{EmulatedDevice, EmulatedMemory};
    use crate::backend::MemFlags;
    use crate::error::{AllocationFailure, CompileFailure};
    use crate::kernels::EmbeddedSources;
    use crate::special::{NoSpecials, StageSlots};

    fn stage_table() -> AlgorithmTable {
        AlgorithmTable {
            identity: AlgorithmIdentity::new("blake2b", "chain", "v1"),
            byte_order: HeaderByteOrder::AsIs,
            resources: vec![
                ResourceDescriptor::buffer("io0", 4 * 64, MemFlags::READ_WRITE),
                ResourceDescriptor::buffer("io1", 4 * 64, MemFlags::READ_WRITE),
                ResourceDescriptor::immediate_u32("itemWords", 8),
            ],
            kernels: vec![KernelDescriptor::new(
                "blake2b.cl",
                "blake2b_stage",
                "",
                WorkGroupShape::linear(4),
                "$stageIn, $stageOut, itemWords",
            )],
        }
    }

    #[test]
    fn identity_formats() {
        let identity = AlgorithmIdentity::new("sha256d", "monolithic", "v1");
        assert_eq!(identity.presentation(), "sha256d.monolithic");
        assert_eq!(identity.to_string(), "sha256d.monolithic.v1");
    }

    #[test]
    fn swapped_headers_reverse_each_word() {
        let mut header = [0u8; 80];
        header[..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let swapped = HeaderByteOrder::SwapWords.apply(&header);
        assert_eq!(&swapped[..8], &[4, 3, 2, 1, 8, 7, 6, 5]);
        assert_eq!(HeaderByteOrder::AsIs.apply(&header), header);
        assert_eq!(HeaderByteOrder::SwapWords.apply(&swapped), header);
    }

    #[test]
    fn geometry_puts_hashes_on_the_last_dimension() {
        let geometry = launch_geometry(&WorkGroupShape::planar(4, 16), 1000, 4096);
        assert_eq!(geometry.dims, 2);
        assert_eq!(geometry.offset, [0, 1000, 0]);
        assert_eq!(geometry.global, [4, 4096, 1]);
        assert_eq!(geometry.local, [4, 16, 1]);
        assert_eq!(geometry.items(), 4096);
        geometry.validate().expect("geometry should be valid");
    }

    #[test]
    fn set_initial_marks_the_buffer_for_copy() {
        let mut table = stage_table();
        assert!(table.set_initial("io0", vec![0; 256]));
        assert!(!table.set_initial("io9", vec![0; 4]));
        let io0 = &table.resources[0];
        assert!(io0.flags.contains(MemFlags::COPY_HOST_PTR));
        assert_eq!(io0.initial.as_ref().map(Vec::len), Some(256));
    }

    #[test]
    fn late_slots_follow_the_caller_between_iterations() {
        let device = Arc::new(EmulatedDevice::new("test"));
        let mut instance = AlgorithmInstance::build(Arc::clone(&device), &stage_table(), &EmbeddedSources, &StageSlots)
            .expect("stage algorithm should build");
        let queue = device.create_queue().expect("queue should be created");

        let input: Vec<u8> = (0..4 * 64).map(|i| i as u8).collect();
        instance
            .write_resource(&queue, "io0", 0, &input)
            .expect("input should upload");
        let io0 = instance.catalog().memory("io0").expect("io0 should exist").clone();
        let io1 = instance.catalog().memory("io1").expect("io1 should exist").clone();

        instance
            .run_iteration(&queue, 0, 4, &[&io0, &io1])
            .expect("first pass should dispatch");
        instance
            .run_iteration(&queue, 0, 4, &[&io1, &io0])
            .expect("second pass should dispatch");
        let output = instance.read_resource(&queue, "io0").expect("io0 should read back");

        for (item, chunk) in input.chunks_exact(64).zip(output.chunks_exact(64)) {
            let expected = clkvc_oracle::blake2b512(&clkvc_oracle::blake2b512(item));
            assert_eq!(chunk, &expected[..]);
        }
    }

    #[test]
    fn missing_late_slot_names_the_kernel() {
        let device = Arc::new(EmulatedDevice::new("test"));
        let instance = AlgorithmInstance::build(Arc::clone(&device), &stage_table(), &EmbeddedSources, &StageSlots)
            .expect("stage algorithm should build");
        let queue = device.create_queue().expect("queue should be created");
        let io0: EmulatedMemory = instance.catalog().memory("io0").expect("io0 should exist").clone();

        let err = instance
            .run_iteration(&queue, 0, 4, &[&io0])
            .expect_err("second slot is missing");
        match err {
            CheckError::Dispatch {
                algorithm,
                kernel_index,
                failure,
            } => {
                assert_eq!(algorithm, "blake2b.chain");
                assert_eq!(kernel_index, 0);
                assert_eq!(failure, DispatchFailure::MissingLateSlot { slot: 1 });
            }
            other => panic!("expected a dispatch error, got {other}"),
        }
    }

    #[test]
    fn build_stops_at_the_first_failure() {
        let device = Arc::new(EmulatedDevice::new("test"));
        let mut table = stage_table();
        table.resources.push(ResourceDescriptor::buffer("io0", 4, MemFlags::READ_WRITE));
        let err = AlgorithmInstance::build(Arc::clone(&device), &table, &EmbeddedSources, &StageSlots)
            .err()
            .expect("duplicate resource should fail");
        assert!(matches!(
            err,
            CheckError::Allocation {
                failure: AllocationFailure::DuplicateName,
                ..
            }
        ));

        let err = AlgorithmInstance::build(device, &stage_table(), &EmbeddedSources, &NoSpecials)
            .err()
            .expect("stage names need a resolver");
        assert!(matches!(err, CheckError::Binding { .. }));

        let mut table = stage_table();
        table.kernels[0].entry_point = "blake2b_final".to_string();
        let err = AlgorithmInstance::build(Arc::new(EmulatedDevice::new("test")), &table, &EmbeddedSources, &StageSlots)
            .err()
            .expect("unknown entry point should fail");
        assert!(matches!(
            err,
            CheckError::Compile {
                failure: CompileFailure::KernelCreation(_),
                ..
            }
        ));
    }
}
