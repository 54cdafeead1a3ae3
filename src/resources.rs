//! Named device resources an algorithm declares up front.
//!
//! Buffers and images are allocated through the backend; immediates are kept
//! inline and passed to kernels by value. A declaration call is all or
//! nothing: if any entry fails, everything it allocated is released and the
//! catalog is left as it was.

use std::collections::HashMap;

use tracing::debug;

use crate::backend::{AllocationKind, AllocationRequest, ComputeBackend, ImageShape, MemFlags};
use crate::error::{AllocationFailure, CheckError, CheckResult};

/// Prefix of names the host provides itself (`$wuData`, `$candidates`, ...).
pub const RESERVED_PREFIX: char = '$';
pub const MAX_IMMEDIATE_BYTES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceShape {
    Buffer { bytes: usize },
    Image(ImageShape),
    Immediate(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub name: String,
    pub shape: ResourceShape,
    pub flags: MemFlags,
    pub initial: Option<Vec<u8>>,
    pub presentation: Option<String>,
}

impl ResourceDescriptor {
    pub fn buffer(name: impl Into<String>, bytes: usize, flags: MemFlags) -> Self {
        Self {
            name: name.into(),
            shape: ResourceShape::Buffer { bytes },
            flags,
            initial: None,
            presentation: None,
        }
    }

    pub fn image(name: impl Into<String>, shape: ImageShape, flags: MemFlags) -> Self {
        Self {
            name: name.into(),
            shape: ResourceShape::Image(shape),
            flags,
            initial: None,
            presentation: None,
        }
    }

    pub fn immediate(name: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            name: name.into(),
            shape: ResourceShape::Immediate(bytes.to_vec()),
            flags: MemFlags::empty(),
            initial: None,
            presentation: None,
        }
    }

    pub fn immediate_u32(name: impl Into<String>, value: u32) -> Self {
        Self::immediate(name, &value.to_le_bytes())
    }

    pub fn immediate_u64(name: impl Into<String>, value: u64) -> Self {
        Self::immediate(name, &value.to_le_bytes())
    }

    /// Content copied into the allocation at creation time.
    pub fn with_initial(mut self, data: Vec<u8>) -> Self {
        self.flags = self.flags | MemFlags::COPY_HOST_PTR;
        self.initial = Some(data);
        self
    }

    pub fn with_presentation(mut self, label: impl Into<String>) -> Self {
        self.presentation = Some(label.into());
        self
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self.shape, ResourceShape::Immediate(_))
    }

    /// Bytes the resource occupies on the device; immediates occupy none.
    pub fn footprint(&self) -> usize {
        match &self.shape {
            ResourceShape::Buffer { bytes } => *bytes,
            ResourceShape::Image(shape) => shape.byte_len(),
            ResourceShape::Immediate(_) => 0,
        }
    }
}

enum Resident<M> {
    Memory(M),
    Immediate(Vec<u8>),
}

struct CatalogEntry<M> {
    descriptor: ResourceDescriptor,
    resident: Resident<M>,
}

pub struct ResourceCatalog<M> {
    entries: Vec<CatalogEntry<M>>,
    index: HashMap<String, usize>,
}

impl<M> Default for ResourceCatalog<M> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<M> ResourceCatalog<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare_resources<B>(&mut self, backend: &B, list: &[ResourceDescriptor]) -> CheckResult<()>
    where
        B: ComputeBackend<Memory = M>,
    {
        let mut staged: Vec<CatalogEntry<M>> = Vec::with_capacity(list.len());
        for descriptor in list {
            let taken = self.index.contains_key(&descriptor.name)
                || staged.iter().any(|entry| entry.descriptor.name == descriptor.name);
            match stage(backend, descriptor, taken) {
                Ok(entry) => staged.push(entry),
                Err(err) => {
                    debug!(
                        resource = %descriptor.name,
                        released = staged.len(),
                        "resource declaration failed, releasing staged allocations"
                    );
                    return Err(err);
                }
            }
        }

        for entry in staged {
            debug!(
                resource = %entry.descriptor.name,
                bytes = entry.descriptor.footprint(),
                immediate = entry.descriptor.is_immediate(),
                "declared resource"
            );
            self.index
                .insert(entry.descriptor.name.clone(), self.entries.len());
            self.entries.push(entry);
        }
        Ok(())
    }

    fn entry(&self, name: &str) -> Option<&CatalogEntry<M>> {
        self.index.get(name).map(|&position| &self.entries[position])
    }

    pub fn memory(&self, name: &str) -> Option<&M> {
        match &self.entry(name)?.resident {
            Resident::Memory(memory) => Some(memory),
            Resident::Immediate(_) => None,
        }
    }

    pub fn memory_mut(&mut self, name: &str) -> Option<&mut M> {
        let position = *self.index.get(name)?;
        match &mut self.entries[position].resident {
            Resident::Memory(memory) => Some(memory),
            Resident::Immediate(_) => None,
        }
    }

    pub fn immediate(&self, name: &str) -> Option<&[u8]> {
        match &self.entry(name)?.resident {
            Resident::Immediate(bytes) => Some(bytes),
            Resident::Memory(_) => None,
        }
    }

    pub fn descriptor(&self, name: &str) -> Option<&ResourceDescriptor> {
        self.entry(name).map(|entry| &entry.descriptor)
    }

    /// Label for reports: the presentation name when one was declared.
    pub fn presentation<'a>(&'a self, name: &'a str) -> &'a str {
        self.entry(name)
            .and_then(|entry| entry.descriptor.presentation.as_deref())
            .unwrap_or(name)
    }

    pub fn footprint(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| entry.descriptor.footprint())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .map(|entry| entry.descriptor.name.as_str())
    }
}

fn stage<B: ComputeBackend>(
    backend: &B,
    descriptor: &ResourceDescriptor,
    taken: bool,
) -> CheckResult<CatalogEntry<B::Memory>> {
    let fail = |failure: AllocationFailure| CheckError::Allocation {
        name: descriptor.name.clone(),
        failure,
    };
    if descriptor.name.is_empty() {
        return Err(fail(AllocationFailure::EmptyName));
    }
    if descriptor.name.starts_with(RESERVED_PREFIX) {
        return Err(fail(AllocationFailure::ReservedName));
    }
    if taken {
        return Err(fail(AllocationFailure::DuplicateName));
    }

    let kind = match &descriptor.shape {
        ResourceShape::Immediate(bytes) => {
            if bytes.len() > MAX_IMMEDIATE_BYTES {
                return Err(fail(AllocationFailure::ImmediateTooWide(bytes.len())));
            }
            return Ok(CatalogEntry {
                descriptor: descriptor.clone(),
                resident: Resident::Immediate(bytes.clone()),
            });
        }
        ResourceShape::Buffer { bytes } => AllocationKind::Buffer { bytes: *bytes },
        ResourceShape::Image(shape) => AllocationKind::Image(*shape),
    };

    let memory = backend
        .allocate(&AllocationRequest {
            name: &descriptor.name,
            flags: descriptor.flags,
            kind,
            initial: descriptor.initial.as_deref(),
        })
        .map_err(|err| fail(err.into()))?;
    Ok(CatalogEntry {
        descriptor: descriptor.clone(),
        resident: Resident::Memory(memory),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::emulated::{EmulatedDevice, EmulatedMemory};
    use crate::backend::{ChannelOrder, ChannelType};

    fn allocation_failure(err: CheckError) -> (String, AllocationFailure) {
        match err {
            CheckError::Allocation { name, failure } => (name, failure),
            other => panic!("expected an allocation error, got {other}"),
        }
    }

    #[test]
    fn declares_buffers_images_and_immediates() {
        let device = EmulatedDevice::new("test");
        let mut catalog = ResourceCatalog::<EmulatedMemory>::new();
        let image = ImageShape {
            width: 64,
            height: 4,
            depth: 0,
            order: ChannelOrder::Rgba,
            channel_type: ChannelType::UnsignedInt32,
        };
        catalog
            .declare_resources(
                &device,
                &[
                    ResourceDescriptor::buffer("io0", 4096, MemFlags::READ_WRITE)
                        .with_presentation("intermediate hashes"),
                    ResourceDescriptor::image("sbox", image, MemFlags::READ_ONLY),
                    ResourceDescriptor::immediate_u32("rounds", 10),
                ],
            )
            .expect("declaration should succeed");

        assert_eq!(catalog.len(), 3);
        assert!(catalog.memory("io0").is_some());
        assert!(catalog.memory("rounds").is_none());
        assert_eq!(catalog.immediate("rounds"), Some(&10u32.to_le_bytes()[..]));
        assert_eq!(catalog.presentation("io0"), "intermediate hashes");
        assert_eq!(catalog.presentation("sbox"), "sbox");
        assert_eq!(catalog.footprint(), 4096 + 64 * 4 * 16);
        assert_eq!(catalog.names().collect::<Vec<_>>(), ["io0", "sbox", "rounds"]);
    }

    #[test]
    fn rejects_reserved_and_duplicate_names() {
        let device = EmulatedDevice::new("test");
        let mut catalog = ResourceCatalog::<EmulatedMemory>::new();
        catalog
            .declare_resources(&device, &[ResourceDescriptor::immediate_u32("rounds", 1)])
            .expect("first declaration should succeed");

        let err = catalog
            .declare_resources(&device, &[ResourceDescriptor::immediate_u32("rounds", 2)])
            .err()
            .expect("duplicate against the catalog should fail");
        assert_eq!(allocation_failure(err).1, AllocationFailure::DuplicateName);

        let err = catalog
            .declare_resources(
                &device,
                &[
                    ResourceDescriptor::buffer("a", 4, MemFlags::READ_WRITE),
                    ResourceDescriptor::buffer("a", 4, MemFlags::READ_WRITE),
                ],
            )
            .err()
            .expect("duplicate within one call should fail");
        assert_eq!(allocation_failure(err).1, AllocationFailure::DuplicateName);

        let err = catalog
            .declare_resources(
                &device,
                &[ResourceDescriptor::buffer("$wuData", 80, MemFlags::READ_ONLY)],
            )
            .err()
            .expect("reserved name should fail");
        assert_eq!(allocation_failure(err).1, AllocationFailure::ReservedName);
    }

    #[test]
    fn failed_declaration_leaves_the_catalog_untouched() {
        let device = EmulatedDevice::new("test").with_max_allocation(1 << 20);
        let mut catalog = ResourceCatalog::<EmulatedMemory>::new();
        catalog
            .declare_resources(&device, &[ResourceDescriptor::buffer("kept", 16, MemFlags::READ_WRITE)])
            .expect("first declaration should succeed");

        let err = catalog
            .declare_resources(
                &device,
                &[
                    ResourceDescriptor::buffer("io0", 1024, MemFlags::READ_WRITE),
                    ResourceDescriptor::immediate_u32("rounds", 3),
                    ResourceDescriptor::buffer("huge", 2 << 20, MemFlags::READ_WRITE),
                ],
            )
            .err()
            .expect("oversized resource should fail");
        let (name, failure) = allocation_failure(err);
        assert_eq!(name, "huge");
        assert!(matches!(failure, AllocationFailure::Oversized { .. }));
        assert_eq!(catalog.names().collect::<Vec<_>>(), ["kept"]);

        catalog
            .declare_resources(
                &device,
                &[
                    ResourceDescriptor::buffer("io0", 1024, MemFlags::READ_WRITE),
                    ResourceDescriptor::immediate_u32("rounds", 3),
                ],
            )
            .expect("names of a failed declaration should be free again");
        assert_eq!(catalog.len(), 3);
    }

    #[test]
    fn classifies_allocation_failures() {
        let device = EmulatedDevice::new("test");
        let mut catalog = ResourceCatalog::<EmulatedMemory>::new();
        let cases = [
            (
                ResourceDescriptor::buffer("flags", 4, MemFlags::READ_ONLY | MemFlags::WRITE_ONLY),
                AllocationFailure::InvalidFlags,
            ),
            (
                ResourceDescriptor::buffer("empty", 0, MemFlags::READ_WRITE),
                AllocationFailure::ZeroSize,
            ),
            (
                ResourceDescriptor::buffer("short", 8, MemFlags::READ_WRITE).with_initial(vec![0; 4]),
                AllocationFailure::InvalidHostData,
            ),
            (
                ResourceDescriptor::immediate("wide", &[0u8; 12]),
                AllocationFailure::ImmediateTooWide(12),
            ),
            (
                ResourceDescriptor::buffer("", 4, MemFlags::READ_WRITE),
                AllocationFailure::EmptyName,
            ),
        ];
        for (descriptor, expected) in cases {
            let err = catalog
                .declare_resources(&device, &[descriptor])
                .err()
                .expect("declaration should fail");
            assert_eq!(allocation_failure(err).1, expected);
        }
        assert!(catalog.is_empty());
    }
}
