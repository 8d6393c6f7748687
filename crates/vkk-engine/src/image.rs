//! Images with per-mip layout tracking.

use crate::deferred::Object;
use crate::engine::{Core, Engine};
use crate::error::{driver, EngineError, Result};
use crate::memory::Allocation;
use crate::renderer::Tracked;
use crate::transfer::ImageTarget;
use ash::vk;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Pixel formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Rgba8888,
    Rgba4444,
    RgbaF32,
    RgbaF16,
    Rgb888,
    Rgb565,
    Rg88,
    R8,
    RF32,
    RF16,
    /// 32-bit float depth.
    Depth,
}

impl ImageFormat {
    /// Bytes per pixel.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::R8 => 1,
            Self::Rgba4444 | Self::Rgb565 | Self::Rg88 | Self::RF16 => 2,
            Self::Rgb888 => 3,
            Self::Rgba8888 | Self::RF32 | Self::Depth => 4,
            Self::RgbaF16 => 8,
            Self::RgbaF32 => 16,
        }
    }

    pub fn vk_format(self) -> vk::Format {
        match self {
            Self::Rgba8888 => vk::Format::R8G8B8A8_UNORM,
            Self::Rgba4444 => vk::Format::R4G4B4A4_UNORM_PACK16,
            Self::RgbaF32 => vk::Format::R32G32B32A32_SFLOAT,
            Self::RgbaF16 => vk::Format::R16G16B16A16_SFLOAT,
            Self::Rgb888 => vk::Format::R8G8B8_UNORM,
            Self::Rgb565 => vk::Format::R5G6B5_UNORM_PACK16,
            Self::Rg88 => vk::Format::R8G8_UNORM,
            Self::R8 => vk::Format::R8_UNORM,
            Self::RF32 => vk::Format::R32_SFLOAT,
            Self::RF16 => vk::Format::R16_SFLOAT,
            Self::Depth => vk::Format::D32_SFLOAT,
        }
    }

    pub fn is_depth(self) -> bool {
        self == Self::Depth
    }
}

/// What an image is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageUsage {
    /// Sampled texture.
    Texture,
    /// Color target of another renderer, sampled afterwards. Carries a
    /// semaphore for cross-renderer synchronization.
    Offscreen,
    /// Depth attachment.
    Depth,
}

impl ImageUsage {
    fn flags(self) -> vk::ImageUsageFlags {
        let base = vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST;
        match self {
            Self::Texture => base,
            Self::Offscreen => base | vk::ImageUsageFlags::COLOR_ATTACHMENT,
            Self::Depth => base | vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        }
    }
}

/// Image creation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    /// 1 for 2D images.
    pub depth: u32,
    pub format: ImageFormat,
    /// Generate a full mip chain. Requires power-of-two dimensions.
    pub mipmap: bool,
    pub usage: ImageUsage,
}

impl ImageInfo {
    /// A 2D texture without mipmaps.
    pub fn texture(width: u32, height: u32, format: ImageFormat) -> Self {
        Self {
            width,
            height,
            depth: 1,
            format,
            mipmap: false,
            usage: ImageUsage::Texture,
        }
    }

    pub fn with_mipmap(mut self, mipmap: bool) -> Self {
        self.mipmap = mipmap;
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_usage(mut self, usage: ImageUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Mip levels the image will have.
    pub fn mip_levels(&self) -> u32 {
        if self.mipmap {
            let largest = self.width.max(self.height).max(self.depth);
            u32::BITS - largest.leading_zeros()
        } else {
            1
        }
    }

    /// Byte size of mip level 0.
    pub fn byte_size(&self) -> u64 {
        u64::from(self.width)
            * u64::from(self.height)
            * u64::from(self.depth)
            * u64::from(self.format.bytes_per_pixel())
    }

    fn extent(&self) -> vk::Extent3D {
        vk::Extent3D {
            width: self.width,
            height: self.height,
            depth: self.depth,
        }
    }

    fn aspect(&self) -> vk::ImageAspectFlags {
        if self.format.is_depth() {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        }
    }

    fn validate(&self, pixels: Option<&[u8]>) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.depth == 0 {
            return Err(EngineError::validation(format!(
                "image extent {}x{}x{} has a zero dimension",
                self.width, self.height, self.depth
            )));
        }
        if self.format.is_depth() != (self.usage == ImageUsage::Depth) {
            return Err(EngineError::validation(
                "depth format and depth usage must be used together",
            ));
        }
        if self.mipmap {
            if self.format.is_depth() {
                return Err(EngineError::validation("depth images cannot be mipmapped"));
            }
            if !(self.width.is_power_of_two()
                && self.height.is_power_of_two()
                && self.depth.is_power_of_two())
            {
                return Err(EngineError::validation(format!(
                    "mipmapped image {}x{}x{} needs power-of-two dimensions",
                    self.width, self.height, self.depth
                )));
            }
        }
        if let Some(pixels) = pixels {
            if self.format.is_depth() {
                return Err(EngineError::validation("depth images cannot be uploaded"));
            }
            if pixels.len() as u64 != self.byte_size() {
                return Err(EngineError::validation(format!(
                    "image expects {} bytes of pixels, got {}",
                    self.byte_size(),
                    pixels.len()
                )));
            }
        }
        Ok(())
    }
}

/// Vulkan handles of a released image. Null handles are skipped.
pub struct ImageResources {
    image: vk::Image,
    view: vk::ImageView,
    semaphore: vk::Semaphore,
    allocation: Option<Allocation>,
    pub(crate) ts: u64,
}

impl ImageResources {
    fn empty() -> Self {
        Self {
            image: vk::Image::null(),
            view: vk::ImageView::null(),
            semaphore: vk::Semaphore::null(),
            allocation: None,
            ts: 0,
        }
    }

    /// # Safety
    /// No pending GPU work may reference the image.
    pub(crate) unsafe fn destroy(self, core: &Core) {
        let device = &core.device;
        if self.semaphore != vk::Semaphore::null() {
            device.destroy_semaphore(self.semaphore);
        }
        if self.view != vk::ImageView::null() {
            device.destroy_image_view(self.view);
        }
        if self.image != vk::Image::null() {
            device.destroy_image(self.image);
        }
        if let Some(allocation) = self.allocation {
            core.memory.free(allocation);
        }
    }
}

/// A device-local image with its view.
pub struct Image {
    engine: Engine,
    info: ImageInfo,
    mip_levels: u32,
    res: ImageResources,
    layouts: Mutex<Vec<vk::ImageLayout>>,
    ts: AtomicU64,
}

impl Image {
    /// Create an image, uploading `pixels` to level 0 and generating the mip
    /// chain when given. Blocks until the upload completes.
    ///
    /// Parameters are validated before any device call.
    pub fn new(engine: &Engine, info: ImageInfo, pixels: Option<&[u8]>) -> Result<Self> {
        engine.check_live()?;
        info.validate(pixels)?;

        let mip_levels = info.mip_levels();
        let mut image = Self {
            engine: engine.clone(),
            info,
            mip_levels,
            res: ImageResources::empty(),
            layouts: Mutex::new(vec![vk::ImageLayout::UNDEFINED; mip_levels as usize]),
            ts: AtomicU64::new(0),
        };
        // On error `image` drops and queues whatever was created so far.
        image.create_resources()?;

        if let Some(pixels) = pixels {
            engine
                .transfer()
                .write_image_target(&image.transfer_target(), pixels)?;
        }

        tracing::debug!(
            "image {}x{}x{} {:?}, {} mip levels",
            info.width,
            info.height,
            info.depth,
            info.format,
            mip_levels
        );
        Ok(image)
    }

    fn create_resources(&mut self) -> Result<()> {
        let core = self.engine.core().clone();
        let info = self.info;
        let mip_levels = self.mip_levels;
        let res = &mut self.res;

        let (image_type, view_type) = if info.depth > 1 {
            (vk::ImageType::TYPE_3D, vk::ImageViewType::TYPE_3D)
        } else {
            (vk::ImageType::TYPE_2D, vk::ImageViewType::TYPE_2D)
        };

        let create_info = vk::ImageCreateInfo::default()
            .image_type(image_type)
            .format(info.format.vk_format())
            .extent(info.extent())
            .mip_levels(mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(info.usage.flags())
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        // SAFETY: the device is valid; each handle is recorded in `res` as
        // soon as it exists so a failure releases everything before it.
        unsafe {
            res.image = core
                .device
                .create_image(&create_info)
                .map_err(driver("vkCreateImage"))?;
            res.allocation = Some(core.memory.alloc_image(res.image, true)?);

            let view_info = vk::ImageViewCreateInfo::default()
                .image(res.image)
                .view_type(view_type)
                .format(info.format.vk_format())
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: info.aspect(),
                    base_mip_level: 0,
                    level_count: mip_levels,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            res.view = core
                .device
                .create_image_view(&view_info)
                .map_err(driver("vkCreateImageView"))?;

            if info.usage == ImageUsage::Offscreen {
                res.semaphore = core
                    .device
                    .create_semaphore()
                    .map_err(driver("vkCreateSemaphore"))?;
            }
        }
        Ok(())
    }

    pub fn info(&self) -> &ImageInfo {
        &self.info
    }

    pub fn width(&self) -> u32 {
        self.info.width
    }

    pub fn height(&self) -> u32 {
        self.info.height
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn handle(&self) -> vk::Image {
        self.res.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.res.view
    }

    /// Semaphore signaled by the renderer that draws into an offscreen image.
    pub fn semaphore(&self) -> Option<vk::Semaphore> {
        let semaphore = self.res.semaphore;
        (semaphore != vk::Semaphore::null()).then_some(semaphore)
    }

    /// Current layout of `mip`, or `None` past the last mip level.
    pub fn layout(&self, mip: u32) -> Option<vk::ImageLayout> {
        self.layouts.lock().get(mip as usize).copied()
    }

    /// Record a layout change made by the caller's own commands.
    pub fn set_layout(&self, layout: vk::ImageLayout) {
        self.layouts.lock().fill(layout);
    }

    pub(crate) fn transfer_target(&self) -> ImageTarget<'_> {
        ImageTarget {
            image: self.handle(),
            extent: self.info.extent(),
            mip_levels: self.mip_levels,
            aspect: self.info.aspect(),
            bytes: self.info.byte_size(),
            layouts: &self.layouts,
        }
    }
}

impl Tracked for Image {
    fn mark_used(&self, ts: u64) {
        self.ts.fetch_max(ts, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("info", &self.info)
            .field("mip_levels", &self.mip_levels)
            .finish()
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        let mut resources = std::mem::replace(&mut self.res, ImageResources::empty());
        resources.ts = self.ts.load(Ordering::Acquire);
        self.engine.delete_object(Object::Image(resources));
    }
}
