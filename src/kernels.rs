//! Kernel declarations: source loading, program builds and argument binding.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::algorithm::AlgorithmIdentity;
use crate::backend::{BackendError, ComputeBackend};
use crate::error::{BindingFailure, CheckError, CheckResult, CompileFailure};
use crate::resources::{ResourceCatalog, RESERVED_PREFIX};
use crate::signature::VersionSignature;
use crate::special::{SpecialBinding, SpecialValueResolver};

/// Sources this large or larger are refused before reaching the compiler.
pub const MAX_KERNEL_SOURCE_BYTES: usize = 8 * 1024 * 1024;

const EMBEDDED: &[(&str, &str)] = &[
    ("sha256.cl", include_str!("../kernels/sha256.cl")),
    ("blake2b.cl", include_str!("../kernels/blake2b.cl")),
    ("sha512.cl", include_str!("../kernels/sha512.cl")),
];

/// Local work-group extents, one to three dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkGroupShape {
    dims: usize,
    extents: [usize; 3],
}

impl WorkGroupShape {
    pub const fn linear(x: usize) -> Self {
        Self {
            dims: 1,
            extents: [x, 1, 1],
        }
    }

    pub const fn planar(x: usize, y: usize) -> Self {
        Self {
            dims: 2,
            extents: [x, y, 1],
        }
    }

    pub const fn cubic(x: usize, y: usize, z: usize) -> Self {
        Self {
            dims: 3,
            extents: [x, y, z],
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn extent(&self, dim: usize) -> usize {
        self.extents[dim]
    }

    pub fn extents(&self) -> &[usize] {
        &self.extents[..self.dims]
    }

    pub fn threads(&self) -> usize {
        self.extents().iter().product()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDescriptor {
    pub source: String,
    pub entry_point: String,
    pub compile_flags: String,
    pub shape: WorkGroupShape,
    pub params: String,
}

impl KernelDescriptor {
    pub fn new(
        source: impl Into<String>,
        entry_point: impl Into<String>,
        compile_flags: impl Into<String>,
        shape: WorkGroupShape,
        params: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            entry_point: entry_point.into(),
            compile_flags: compile_flags.into(),
            shape,
            params: params.into(),
        }
    }

    pub fn label(&self) -> String {
        format!("{}:{}", self.source, self.entry_point)
    }
}

pub trait KernelSourceProvider {
    fn load(&self, id: &str) -> Result<String, CompileFailure>;
}

/// The kernels shipped with the crate, compiled into the binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmbeddedSources;

impl KernelSourceProvider for EmbeddedSources {
    fn load(&self, id: &str) -> Result<String, CompileFailure> {
        EMBEDDED
            .iter()
            .find(|(name, _)| *name == id)
            .map(|(_, text)| text.to_string())
            .ok_or_else(|| CompileFailure::SourceLoad(format!("no embedded kernel source named {id}")))
    }
}

/// Kernel sources read from files under a root directory.
#[derive(Debug, Clone)]
pub struct DirectorySources {
    root: PathBuf,
}

impl DirectorySources {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl KernelSourceProvider for DirectorySources {
    fn load(&self, id: &str) -> Result<String, CompileFailure> {
        let path = self.root.join(id);
        let metadata = fs::metadata(&path)
            .map_err(|err| CompileFailure::SourceLoad(format!("{}: {err}", path.display())))?;
        let bytes = usize::try_from(metadata.len()).unwrap_or(usize::MAX);
        if bytes >= MAX_KERNEL_SOURCE_BYTES {
            return Err(CompileFailure::SourceTooLarge {
                bytes,
                limit: MAX_KERNEL_SOURCE_BYTES,
            });
        }
        fs::read_to_string(&path)
            .map_err(|err| CompileFailure::SourceLoad(format!("{}: {err}", path.display())))
    }
}

/// Loads every distinct source id once for the duration of one declaration.
pub struct KernelSourceCache<'a> {
    provider: &'a dyn KernelSourceProvider,
    loaded: HashMap<String, String>,
}

impl<'a> KernelSourceCache<'a> {
    pub fn new(provider: &'a dyn KernelSourceProvider) -> Self {
        Self {
            provider,
            loaded: HashMap::new(),
        }
    }

    pub fn load(&mut self, id: &str) -> Result<&str, CompileFailure> {
        let provider = self.provider;
        match self.loaded.entry(id.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut().as_str()),
            Entry::Vacant(entry) => {
                let text = provider.load(id)?;
                if text.len() >= MAX_KERNEL_SOURCE_BYTES {
                    return Err(CompileFailure::SourceTooLarge {
                        bytes: text.len(),
                        limit: MAX_KERNEL_SOURCE_BYTES,
                    });
                }
                debug!(source = id, bytes = text.len(), "loaded kernel source");
                Ok(entry.insert(text).as_str())
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&str> {
        self.loaded.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }
}

/// What a kernel parameter resolved to. Resolution happens once; dispatch
/// only ever looks at the deferred list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Resource(String),
    Immediate(String),
    SpecialEarly(String),
    SpecialLate { name: String, slot: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredArg {
    pub index: u32,
    pub slot: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterBindings {
    pub bindings: Vec<Binding>,
    pub deferred: Vec<DeferredArg>,
}

pub struct BoundKernel<B: ComputeBackend> {
    descriptor: KernelDescriptor,
    kernel: B::Kernel,
    bindings: Vec<Binding>,
    deferred: Vec<DeferredArg>,
    _program: B::Program,
}

impl<B: ComputeBackend> BoundKernel<B> {
    pub fn descriptor(&self) -> &KernelDescriptor {
        &self.descriptor
    }

    pub fn kernel(&self) -> &B::Kernel {
        &self.kernel
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn deferred(&self) -> &[DeferredArg] {
        &self.deferred
    }
}

/// Builds and binds every kernel of an algorithm and computes its signature.
pub fn declare_kernels<B: ComputeBackend>(
    backend: &B,
    identity: &AlgorithmIdentity,
    list: &[KernelDescriptor],
    catalog: &ResourceCatalog<B::Memory>,
    sources: &dyn KernelSourceProvider,
    resolver: &dyn SpecialValueResolver<B::Memory>,
) -> CheckResult<(Vec<BoundKernel<B>>, VersionSignature)> {
    let mut cache = KernelSourceCache::new(sources);
    for descriptor in list {
        cache
            .load(&descriptor.source)
            .map_err(|failure| CheckError::Compile {
                kernel: descriptor.label(),
                failure,
            })?;
    }

    let mut bound = Vec::with_capacity(list.len());
    for descriptor in list {
        let label = descriptor.label();
        let source = cache.load(&descriptor.source).map_err(|failure| CheckError::Compile {
            kernel: label.clone(),
            failure,
        })?;
        info!(
            algorithm = %identity.presentation(),
            kernel = %label,
            options = %descriptor.compile_flags,
            "building kernel"
        );
        let program = backend
            .build_program(source, &descriptor.compile_flags)
            .map_err(|build| CheckError::Compile {
                kernel: label.clone(),
                failure: match build.error {
                    BackendError::InvalidBuildOptions => CompileFailure::BadBuildOptions { log: build.log },
                    error => CompileFailure::Build { error, log: build.log },
                },
            })?;
        let kernel = backend
            .create_kernel(&program, &descriptor.entry_point)
            .map_err(|err| CheckError::Compile {
                kernel: label.clone(),
                failure: CompileFailure::KernelCreation(err),
            })?;
        let ParameterBindings { bindings, deferred } =
            bind_parameters(backend, &kernel, descriptor, catalog, resolver)
                .map_err(|failure| CheckError::Binding { kernel: label, failure })?;
        bound.push(BoundKernel {
            descriptor: descriptor.clone(),
            kernel,
            bindings,
            deferred,
            _program: program,
        });
    }

    let signature = VersionSignature::compute(
        identity,
        list.iter()
            .map(|descriptor| (descriptor, cache.get(&descriptor.source).unwrap_or_default())),
    );
    Ok((bound, signature))
}

/// Resolves a comma-separated parameter list in order: reserved names go to
/// the resolver, then declared resources, then immediates.
pub fn bind_parameters<B: ComputeBackend>(
    backend: &B,
    kernel: &B::Kernel,
    descriptor: &KernelDescriptor,
    catalog: &ResourceCatalog<B::Memory>,
    resolver: &dyn SpecialValueResolver<B::Memory>,
) -> Result<ParameterBindings, BindingFailure> {
    let mut resolved = ParameterBindings::default();
    for (position, raw) in descriptor.params.split(',').enumerate() {
        let name = raw.trim();
        if name.is_empty() {
            return Err(BindingFailure::EmptyName);
        }
        let index = position as u32;
        let backend_failure = |error: BackendError| BindingFailure::Backend {
            index,
            parameter: name.to_string(),
            error,
        };

        let binding = if name.starts_with(RESERVED_PREFIX) {
            match resolver.resolve(name) {
                Some(SpecialBinding::Early(memory)) => {
                    backend
                        .set_memory_arg(kernel, index, memory)
                        .map_err(backend_failure)?;
                    Binding::SpecialEarly(name.to_string())
                }
                Some(SpecialBinding::Late(slot)) => {
                    resolved.deferred.push(DeferredArg { index, slot });
                    Binding::SpecialLate {
                        name: name.to_string(),
                        slot,
                    }
                }
                None => return Err(BindingFailure::Unresolved(name.to_string())),
            }
        } else if let Some(memory) = catalog.memory(name) {
            backend
                .set_memory_arg(kernel, index, memory)
                .map_err(backend_failure)?;
            Binding::Resource(name.to_string())
        } else if let Some(bytes) = catalog.immediate(name) {
            backend
                .set_bytes_arg(kernel, index, bytes)
                .map_err(backend_failure)?;
            Binding::Immediate(name.to_string())
        } else {
            return Err(BindingFailure::Unresolved(name.to_string()));
        };
        resolved.bindings.push(binding);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::fs::File;

    use super::*;
    use crate::backend::emulated::{EmulatedDevice, EmulatedMemory};
    use crate::backend::MemFlags;
    use crate::resources::ResourceDescriptor;
    use crate::special::{NoSpecials, StageSlots};

    struct CountingSources {
        loads: RefCell<Vec<String>>,
    }

    impl KernelSourceProvider for CountingSources {
        fn load(&self, id: &str) -> Result<String, CompileFailure> {
            self.loads.borrow_mut().push(id.to_string());
            EmbeddedSources.load(id)
        }
    }

    struct OversizedSource;

    impl KernelSourceProvider for OversizedSource {
        fn load(&self, _id: &str) -> Result<String, CompileFailure> {
            Ok(" ".repeat(MAX_KERNEL_SOURCE_BYTES))
        }
    }

    fn identity() -> AlgorithmIdentity {
        AlgorithmIdentity::new("blake2b", "1-way", "v1")
    }

    fn stage_catalog(device: &EmulatedDevice) -> ResourceCatalog<EmulatedMemory> {
        let mut catalog = ResourceCatalog::new();
        catalog
            .declare_resources(
                device,
                &[
                    ResourceDescriptor::buffer("io0", 256, MemFlags::READ_WRITE),
                    ResourceDescriptor::buffer("io1", 256, MemFlags::READ_WRITE),
                    ResourceDescriptor::immediate_u32("itemWords", 8),
                ],
            )
            .expect("stage resources should declare");
        catalog
    }

    fn stage_kernel(params: &str) -> KernelDescriptor {
        KernelDescriptor::new("blake2b.cl", "blake2b_stage", "", WorkGroupShape::linear(4), params)
    }

    #[test]
    fn parameters_resolve_to_resources_immediates_and_late_slots() {
        let device = EmulatedDevice::new("test");
        let catalog = stage_catalog(&device);

        let (kernels, _) = declare_kernels(
            &device,
            &identity(),
            &[stage_kernel(" io0 ,io1,  itemWords ")],
            &catalog,
            &EmbeddedSources,
            &NoSpecials,
        )
        .expect("resource parameters should bind");
        assert_eq!(
            kernels[0].bindings(),
            [
                Binding::Resource("io0".to_string()),
                Binding::Resource("io1".to_string()),
                Binding::Immediate("itemWords".to_string()),
            ]
        );
        assert!(kernels[0].deferred().is_empty());
        let io0 = catalog.memory("io0").expect("io0 should exist");
        assert_eq!(kernels[0].kernel().memory_arg(0), Some(io0.id()));

        let (kernels, _) = declare_kernels(
            &device,
            &identity(),
            &[stage_kernel("$stageIn, $stageOut, itemWords")],
            &catalog,
            &EmbeddedSources,
            &StageSlots,
        )
        .expect("stage parameters should bind");
        assert_eq!(
            kernels[0].deferred(),
            [DeferredArg { index: 0, slot: 0 }, DeferredArg { index: 1, slot: 1 }]
        );
        assert_eq!(kernels[0].kernel().memory_arg(0), None);
    }

    #[test]
    fn empty_and_unknown_parameters_are_rejected() {
        let device = EmulatedDevice::new("test");
        let catalog = stage_catalog(&device);
        let cases = [
            ("io0,, itemWords", BindingFailure::EmptyName),
            ("io0, io1, rounds", BindingFailure::Unresolved("rounds".to_string())),
            ("$stageIn, io1, itemWords", BindingFailure::Unresolved("$stageIn".to_string())),
        ];
        for (params, expected) in cases {
            let err = declare_kernels(
                &device,
                &identity(),
                &[stage_kernel(params)],
                &catalog,
                &EmbeddedSources,
                &NoSpecials,
            )
            .err()
            .expect("binding should fail");
            match err {
                CheckError::Binding { kernel, failure } => {
                    assert_eq!(kernel, "blake2b.cl:blake2b_stage");
                    assert_eq!(failure, expected, "{params}");
                }
                other => panic!("expected a binding error, got {other}"),
            }
        }
    }

    #[test]
    fn unresolved_parameter_message_names_the_parameter() {
        let message = format!(
            "{}",
            CheckError::Binding {
                kernel: "sha256.cl:sha256_tail".to_string(),
                failure: BindingFailure::Unresolved("io3".to_string()),
            }
        );
        assert!(message.contains("Could not find parameter \"io3\""));
    }

    #[test]
    fn shared_sources_load_once_and_build_per_request() {
        let device = EmulatedDevice::new("test");
        let mut catalog = ResourceCatalog::new();
        catalog
            .declare_resources(
                &device,
                &[ResourceDescriptor::buffer("io0", 64 * 32, MemFlags::READ_WRITE)],
            )
            .expect("resources should declare");
        let sources = CountingSources {
            loads: RefCell::new(Vec::new()),
        };
        let list = [
            KernelDescriptor::new("sha256.cl", "sha256_head", "-D HEADER_WORDS_SWAPPED", WorkGroupShape::linear(64), "io0, io0"),
            KernelDescriptor::new("sha256.cl", "sha256_head", "", WorkGroupShape::linear(64), "io0, io0"),
        ];
        let (kernels, _) = declare_kernels(
            &device,
            &AlgorithmIdentity::new("sha256", "head", "v1"),
            &list,
            &catalog,
            &sources,
            &NoSpecials,
        )
        .expect("kernels should declare");
        assert_eq!(kernels.len(), 2);
        assert_eq!(*sources.loads.borrow(), ["sha256.cl".to_string()]);
    }

    #[test]
    fn oversized_and_missing_sources_fail_to_compile() {
        let device = EmulatedDevice::new("test");
        let catalog = stage_catalog(&device);
        let err = declare_kernels(
            &device,
            &identity(),
            &[stage_kernel("io0, io1, itemWords")],
            &catalog,
            &OversizedSource,
            &NoSpecials,
        )
        .err()
        .expect("oversized source should fail");
        assert!(matches!(
            err,
            CheckError::Compile {
                failure: CompileFailure::SourceTooLarge { .. },
                ..
            }
        ));

        let mut missing = stage_kernel("io0, io1, itemWords");
        missing.source = "lyra2.cl".to_string();
        let err = declare_kernels(&device, &identity(), &[missing], &catalog, &EmbeddedSources, &NoSpecials)
            .err()
            .expect("missing source should fail");
        assert!(matches!(
            err,
            CheckError::Compile {
                failure: CompileFailure::SourceLoad(_),
                ..
            }
        ));
    }

    #[test]
    fn bad_build_options_are_reported_as_such() {
        let device = EmulatedDevice::new("test");
        let catalog = stage_catalog(&device);
        let mut descriptor = stage_kernel("io0, io1, itemWords");
        descriptor.compile_flags = "-O9000".to_string();
        let err = declare_kernels(&device, &identity(), &[descriptor], &catalog, &EmbeddedSources, &NoSpecials)
            .err()
            .expect("bad options should fail");
        let message = format!("{err}");
        assert!(message.contains("Bad build options"), "{message}");
        assert!(message.contains("-O9000"), "{message}");
    }

    #[test]
    fn directory_sources_check_size_before_reading() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        fs::write(dir.path().join("tiny.cl"), "__kernel void tiny() {}").expect("source should write");
        File::create(dir.path().join("huge.cl"))
            .and_then(|file| file.set_len(MAX_KERNEL_SOURCE_BYTES as u64))
            .expect("sparse source should be created");

        let sources = DirectorySources::new(dir.path());
        assert_eq!(
            sources.load("tiny.cl").expect("tiny source should load"),
            "__kernel void tiny() {}"
        );
        assert!(matches!(
            sources.load("huge.cl"),
            Err(CompileFailure::SourceTooLarge { .. })
        ));
        assert!(matches!(sources.load("absent.cl"), Err(CompileFailure::SourceLoad(_))));
    }

    #[test]
    fn work_group_shape_reports_its_dimensions() {
        let shape = WorkGroupShape::planar(4, 16);
        assert_eq!(shape.dims(), 2);
        assert_eq!(shape.extents(), [4, 16]);
        assert_eq!(shape.threads(), 64);
        assert_eq!(WorkGroupShape::cubic(2, 2, 8).threads(), 32);
    }
}
