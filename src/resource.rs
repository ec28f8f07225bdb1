//! Resource handles, descriptions, and heap categories.
//!
//! Descriptions arrive from out-of-scope collaborators (asset and scene code)
//! with sizes, formats, and usage already computed; this module only carries
//! them to the allocators. Handles going the other way are opaque,
//! generation-checked ids.

use ash::vk;
use smallvec::SmallVec;

bitflags::bitflags! {
    /// Resource categories a heap is allowed to back.
    ///
    /// Pools are created per category so that render targets, unordered-access
    /// buffers, and plain resources never contend for the same free lists.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct HeapUsage: u32 {
        const BUFFER = 1 << 0;
        const TEXTURE = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const UNORDERED_ACCESS = 1 << 3;
    }
}

/// Identifies one fixed-size device memory heap within a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeapHandle(pub(crate) u32);

impl HeapHandle {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Opaque, stable id for a device resource.
///
/// The index refers to a pool slot; the generation guards against use of a
/// handle whose slot has since been reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Where a resource's bytes live: a block run inside one heap.
///
/// The rendering frontend creates the API object placed at
/// `first_block * block_size` within the heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub heap: HeapHandle,
    pub first_block: u32,
    pub block_count: u32,
}

/// Per-frame placements of one resource.
///
/// GPU-resident resources have exactly one placement; CPU-writable resources
/// needing per-frame copies carry one placement per frame in flight (at most
/// three).
pub type Placements = SmallVec<[Placement; 3]>;

/// What kind of resource a description creates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Buffer {
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    },
    Image {
        extent: vk::Extent3D,
        format: vk::Format,
        mip_levels: u32,
        array_layers: u32,
        usage: vk::ImageUsageFlags,
    },
}

/// Description of a resource to allocate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceDesc {
    pub kind: ResourceKind,
    /// The heap category this resource must land in.
    pub category: HeapUsage,
    /// CPU-writable resources get one physical copy per frame in flight.
    pub cpu_writable: bool,
    /// Debug label surfaced in diagnostics and device-loss reports.
    pub label: Option<String>,
}

impl ResourceDesc {
    pub fn buffer(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Self {
        Self {
            kind: ResourceKind::Buffer { size, usage },
            category: HeapUsage::BUFFER,
            cpu_writable: false,
            label: None,
        }
    }

    pub fn image(
        extent: vk::Extent3D,
        format: vk::Format,
        mip_levels: u32,
        array_layers: u32,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        Self {
            kind: ResourceKind::Image {
                extent,
                format,
                mip_levels,
                array_layers,
                usage,
            },
            category: HeapUsage::TEXTURE,
            cpu_writable: false,
            label: None,
        }
    }

    pub fn with_category(mut self, category: HeapUsage) -> Self {
        self.category = category;
        self
    }

    pub fn with_cpu_writable(mut self) -> Self {
        self.cpu_writable = true;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Bytes one physical copy of this resource occupies, before block
    /// rounding. For images this sums the full mip chain across layers.
    pub fn size_bytes(&self) -> vk::DeviceSize {
        match &self.kind {
            ResourceKind::Buffer { size, .. } => *size,
            ResourceKind::Image {
                extent,
                format,
                mip_levels,
                array_layers,
                ..
            } => {
                let texel = format_texel_size(*format);
                let mut total = 0u64;
                for mip in 0..*mip_levels {
                    let w = (extent.width >> mip).max(1) as u64;
                    let h = (extent.height >> mip).max(1) as u64;
                    let d = (extent.depth >> mip).max(1) as u64;
                    total += w * h * d * texel;
                }
                total * *array_layers as u64
            }
        }
    }
}

/// Bytes per texel for the formats this subsystem places. Formats outside the
/// table fall back to 4 bytes; exact footprints come from the frontend's
/// driver queries and only affect block rounding here.
fn format_texel_size(format: vk::Format) -> u64 {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_SNORM | vk::Format::R8_UINT | vk::Format::R8_SINT => {
            1
        }
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT | vk::Format::D16_UNORM => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::B10G11R11_UFLOAT_PACK32
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::D32_SFLOAT => 4,
        vk::Format::D24_UNORM_S8_UINT | vk::Format::X8_D24_UNORM_PACK32 => 4,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => 16,
        _ => 4,
    }
}
